use kproxy_protocol::google;
use kproxy_protocol::openai::{ChatCompletionRequest, ChatContent, ContentPart, StopSequences};
use serde_json::Value;

use crate::TransformError;

/// Safety categories that must be explicitly relaxed; Google blocks by
/// default at a threshold chat frontends find unusable behind a proxy.
const SAFETY_CATEGORIES: [&str; 4] = [
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
];

pub fn chat(body: &Value) -> Result<Value, TransformError> {
    let req: ChatCompletionRequest =
        serde_json::from_value(body.clone()).map_err(TransformError::decode)?;

    let mut system_parts = Vec::new();
    let mut contents = Vec::new();
    for message in &req.messages {
        let text = flatten_text(&message.content);
        if message.role == "system" {
            system_parts.push(google::Part::Text { text });
            continue;
        }
        let role = if message.role == "assistant" {
            "model"
        } else {
            "user"
        };
        contents.push(google::Content {
            role: Some(role.to_string()),
            parts: vec![google::Part::Text { text }],
        });
    }

    let generation_config = google::GenerationConfig {
        stop_sequences: req.stop.map(StopSequences::into_vec),
        max_output_tokens: req.max_tokens.or(req.max_completion_tokens),
        temperature: req.temperature,
        top_p: req.top_p,
        top_k: None,
        candidate_count: Some(1),
    };

    let out = google::GenerateContentRequest {
        contents,
        system_instruction: (!system_parts.is_empty()).then(|| google::Content {
            role: None,
            parts: system_parts,
        }),
        safety_settings: Some(
            SAFETY_CATEGORIES
                .iter()
                .map(|category| google::SafetySetting {
                    category: category.to_string(),
                    threshold: "BLOCK_NONE".to_string(),
                })
                .collect(),
        ),
        generation_config: Some(generation_config),
    };
    serde_json::to_value(out).map_err(TransformError::decode)
}

fn flatten_text(content: &Option<ChatContent>) -> String {
    match content {
        Some(ChatContent::Text(text)) => text.clone(),
        Some(ChatContent::Parts(parts)) => parts
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safety_settings_are_relaxed() {
        let body = serde_json::json!({
            "model": "gemini-1.5-pro",
            "messages": [{"role": "user", "content": "hi"}],
        });
        let out = chat(&body).unwrap();
        let settings = out["safetySettings"].as_array().unwrap();
        assert_eq!(settings.len(), SAFETY_CATEGORIES.len());
        assert!(settings.iter().all(|s| s["threshold"] == "BLOCK_NONE"));
    }
}

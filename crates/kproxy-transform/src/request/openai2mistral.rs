use kproxy_protocol::mistral;
use kproxy_protocol::openai::{ChatCompletionRequest, ChatContent, ContentPart, StopSequences};
use serde_json::Value;

use crate::TransformError;

pub fn chat(body: &Value) -> Result<Value, TransformError> {
    let req: ChatCompletionRequest =
        serde_json::from_value(body.clone()).map_err(TransformError::decode)?;

    // Mistral rejects consecutive messages with the same role; merge them.
    let mut messages: Vec<mistral::ChatMessage> = Vec::new();
    for message in &req.messages {
        let role = match message.role.as_str() {
            "assistant" => "assistant",
            "system" => "system",
            _ => "user",
        };
        let text = flatten_text(&message.content);
        match messages.last_mut() {
            Some(last) if last.role == role => {
                last.content.push('\n');
                last.content.push_str(&text);
            }
            _ => messages.push(mistral::ChatMessage {
                role: role.to_string(),
                content: text,
            }),
        }
    }

    let out = mistral::ChatRequest {
        model: req.model,
        messages,
        max_tokens: req.max_tokens.or(req.max_completion_tokens),
        temperature: req.temperature,
        top_p: req.top_p,
        stream: req.stream,
        safe_prompt: Some(false),
        stop: req.stop.map(StopSequences::into_vec),
        extra: serde_json::Map::new(),
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
    fn consecutive_same_role_messages_merge() {
        let body = serde_json::json!({
            "model": "mistral-large-2402",
            "messages": [
                {"role": "user", "content": "a"},
                {"role": "user", "content": "b"},
                {"role": "assistant", "content": "c"},
            ],
        });
        let out = chat(&body).unwrap();
        let messages = out["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["content"], "a\nb");
    }
}

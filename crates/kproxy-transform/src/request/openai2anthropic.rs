use kproxy_protocol::anthropic;
use kproxy_protocol::openai::{
    ChatCompletionRequest, ChatContent, ChatMessage, ContentPart, StopSequences,
};
use serde_json::Value;

use crate::TransformError;

const DEFAULT_MAX_TOKENS: u32 = 4096;

pub fn chat(body: &Value) -> Result<Value, TransformError> {
    let req: ChatCompletionRequest =
        serde_json::from_value(body.clone()).map_err(TransformError::decode)?;

    let system = collect_system_text(&req.messages);
    let messages = req
        .messages
        .iter()
        .filter(|message| message.role != "system")
        .map(to_anthropic_message)
        .collect();

    let out = anthropic::MessagesRequest {
        model: req.model,
        messages,
        max_tokens: req
            .max_tokens
            .or(req.max_completion_tokens)
            .unwrap_or(DEFAULT_MAX_TOKENS),
        system: (!system.is_empty()).then(|| anthropic::SystemPrompt::Text(system)),
        stop_sequences: req.stop.map(StopSequences::into_vec),
        stream: req.stream,
        temperature: req.temperature,
        top_p: req.top_p,
        top_k: None,
        extra: serde_json::Map::new(),
    };
    serde_json::to_value(out).map_err(TransformError::decode)
}

pub fn text(body: &Value) -> Result<Value, TransformError> {
    let req: ChatCompletionRequest =
        serde_json::from_value(body.clone()).map_err(TransformError::decode)?;

    let mut prompt = String::new();
    for message in &req.messages {
        let text = message_text(message);
        match message.role.as_str() {
            "assistant" => {
                prompt.push_str("\n\nAssistant: ");
                prompt.push_str(&text);
            }
            // System prompts fold into the human turn for the legacy API.
            _ => {
                prompt.push_str("\n\nHuman: ");
                prompt.push_str(&text);
            }
        }
    }
    prompt.push_str("\n\nAssistant:");

    let mut stop_sequences = req
        .stop
        .map(StopSequences::into_vec)
        .unwrap_or_default();
    if !stop_sequences.iter().any(|s| s == "\n\nHuman:") {
        stop_sequences.push("\n\nHuman:".to_string());
    }

    let out = anthropic::CompleteRequest {
        model: req.model,
        prompt,
        max_tokens_to_sample: req
            .max_tokens
            .or(req.max_completion_tokens)
            .unwrap_or(DEFAULT_MAX_TOKENS),
        stop_sequences: Some(stop_sequences),
        stream: req.stream,
        temperature: req.temperature,
        top_p: req.top_p,
        top_k: None,
        extra: serde_json::Map::new(),
    };
    serde_json::to_value(out).map_err(TransformError::decode)
}

fn collect_system_text(messages: &[ChatMessage]) -> String {
    let mut out = String::new();
    for message in messages.iter().filter(|m| m.role == "system") {
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(&message_text(message));
    }
    out
}

fn to_anthropic_message(message: &ChatMessage) -> anthropic::Message {
    let role = if message.role == "assistant" {
        "assistant"
    } else {
        "user"
    };
    let content = match &message.content {
        Some(ChatContent::Text(text)) => anthropic::MessageContent::Text(text.clone()),
        Some(ChatContent::Parts(parts)) => {
            anthropic::MessageContent::Blocks(parts.iter().filter_map(to_block).collect())
        }
        None => anthropic::MessageContent::Text(String::new()),
    };
    anthropic::Message {
        role: role.to_string(),
        content,
    }
}

fn to_block(part: &ContentPart) -> Option<anthropic::ContentBlock> {
    match part {
        ContentPart::Text { text } => Some(anthropic::ContentBlock::Text { text: text.clone() }),
        ContentPart::ImageUrl { image_url } => {
            // Anthropic only accepts inline base64; remote URLs are dropped.
            let rest = image_url.url.strip_prefix("data:")?;
            let (media_type, data) = rest.split_once(";base64,")?;
            Some(anthropic::ContentBlock::Image {
                source: anthropic::ImageSource {
                    source_type: "base64".to_string(),
                    media_type: media_type.to_string(),
                    data: data.to_string(),
                },
            })
        }
        ContentPart::Unknown(_) => None,
    }
}

fn message_text(message: &ChatMessage) -> String {
    match &message.content {
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
    fn image_data_urls_become_inline_blocks() {
        let body = serde_json::json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": [
                {"type": "text", "text": "look"},
                {"type": "image_url", "image_url": {"url": "data:image/png;base64,QUJD"}},
            ]}],
        });
        let out = chat(&body).unwrap();
        let blocks = out["messages"][0]["content"].as_array().unwrap();
        assert_eq!(blocks[0]["type"], "text");
        assert_eq!(blocks[1]["type"], "image");
        assert_eq!(blocks[1]["source"]["media_type"], "image/png");
        assert_eq!(blocks[1]["source"]["data"], "QUJD");
    }

    #[test]
    fn legacy_text_prompt_ends_with_assistant_turn() {
        let body = serde_json::json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "hi"}],
        });
        let out = text(&body).unwrap();
        let prompt = out["prompt"].as_str().unwrap();
        assert!(prompt.starts_with("\n\nHuman: hi"));
        assert!(prompt.ends_with("\n\nAssistant:"));
        let stops = out["stop_sequences"].as_array().unwrap();
        assert!(stops.iter().any(|s| s == "\n\nHuman:"));
    }
}

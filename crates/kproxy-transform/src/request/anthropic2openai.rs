use kproxy_protocol::anthropic;
use kproxy_protocol::openai::{
    ChatCompletionRequest, ChatContent, ChatMessage, StopSequences,
};
use serde_json::Value;

use crate::TransformError;

/// Anthropic messages client on an OpenAI-shaped upstream.
pub fn chat(body: &Value) -> Result<Value, TransformError> {
    let req: anthropic::MessagesRequest =
        serde_json::from_value(body.clone()).map_err(TransformError::decode)?;

    let mut messages = Vec::new();
    if let Some(system) = &req.system {
        let text = match system {
            anthropic::SystemPrompt::Text(text) => text.clone(),
            anthropic::SystemPrompt::Blocks(blocks) => blocks_text(blocks),
        };
        if !text.is_empty() {
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: Some(ChatContent::Text(text)),
                name: None,
            });
        }
    }
    for message in &req.messages {
        let text = match &message.content {
            anthropic::MessageContent::Text(text) => text.clone(),
            anthropic::MessageContent::Blocks(blocks) => blocks_text(blocks),
        };
        messages.push(ChatMessage {
            role: message.role.clone(),
            content: Some(ChatContent::Text(text)),
            name: None,
        });
    }

    let out = ChatCompletionRequest {
        model: req.model,
        messages,
        max_tokens: Some(req.max_tokens),
        max_completion_tokens: None,
        temperature: req.temperature,
        top_p: req.top_p,
        n: None,
        stop: req.stop_sequences.map(StopSequences::Many),
        stream: req.stream,
        presence_penalty: None,
        frequency_penalty: None,
        logit_bias: None,
        user: None,
        extra: serde_json::Map::new(),
    };
    serde_json::to_value(out).map_err(TransformError::decode)
}

fn blocks_text(blocks: &[anthropic::ContentBlock]) -> String {
    blocks
        .iter()
        .filter_map(|block| match block {
            anthropic::ContentBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_prompt_becomes_system_message() {
        let body = serde_json::json!({
            "model": "claude-3-5-sonnet-20240620",
            "max_tokens": 100,
            "system": "be brief",
            "messages": [{"role": "user", "content": "hi"}],
        });
        let out = chat(&body).unwrap();
        let messages = out["messages"].as_array().unwrap();
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[1]["role"], "user");
        assert_eq!(out["max_tokens"], 100);
    }
}

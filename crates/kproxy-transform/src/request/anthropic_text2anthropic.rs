use kproxy_protocol::anthropic;
use serde_json::Value;

use crate::TransformError;

/// Parse a legacy `\n\nHuman:`/`\n\nAssistant:` prompt back into messages so
/// it can ride the modern messages endpoint.
pub fn chat(body: &Value) -> Result<Value, TransformError> {
    let req: anthropic::CompleteRequest =
        serde_json::from_value(body.clone()).map_err(TransformError::decode)?;

    let mut messages = Vec::new();
    let mut system = String::new();
    for (role, text) in split_prompt(&req.prompt) {
        let text = text.trim();
        if text.is_empty() {
            continue;
        }
        match role {
            TurnRole::Preamble => system.push_str(text),
            TurnRole::Human => messages.push(anthropic::Message {
                role: "user".to_string(),
                content: anthropic::MessageContent::Text(text.to_string()),
            }),
            TurnRole::Assistant => messages.push(anthropic::Message {
                role: "assistant".to_string(),
                content: anthropic::MessageContent::Text(text.to_string()),
            }),
        }
    }
    if messages.is_empty() {
        messages.push(anthropic::Message {
            role: "user".to_string(),
            content: anthropic::MessageContent::Text(String::new()),
        });
    }

    let out = anthropic::MessagesRequest {
        model: req.model,
        messages,
        max_tokens: req.max_tokens_to_sample,
        system: (!system.is_empty()).then(|| anthropic::SystemPrompt::Text(system)),
        stop_sequences: req.stop_sequences,
        stream: req.stream,
        temperature: req.temperature,
        top_p: req.top_p,
        top_k: req.top_k,
        extra: serde_json::Map::new(),
    };
    serde_json::to_value(out).map_err(TransformError::decode)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TurnRole {
    Preamble,
    Human,
    Assistant,
}

fn split_prompt(prompt: &str) -> Vec<(TurnRole, String)> {
    let mut turns = Vec::new();
    let mut role = TurnRole::Preamble;
    let mut current = String::new();
    let mut rest = prompt;

    loop {
        let human = rest.find("\n\nHuman:");
        let assistant = rest.find("\n\nAssistant:");
        let next = match (human, assistant) {
            (Some(h), Some(a)) => Some(if h < a { (h, TurnRole::Human, 8) } else { (a, TurnRole::Assistant, 12) }),
            (Some(h), None) => Some((h, TurnRole::Human, 8)),
            (None, Some(a)) => Some((a, TurnRole::Assistant, 12)),
            (None, None) => None,
        };
        match next {
            Some((at, next_role, marker_len)) => {
                current.push_str(&rest[..at]);
                turns.push((role, std::mem::take(&mut current)));
                role = next_role;
                rest = &rest[at + marker_len..];
            }
            None => {
                current.push_str(rest);
                turns.push((role, current));
                return turns;
            }
        }
    }
}

use kproxy_protocol::anthropic;
use kproxy_protocol::openai;
use serde_json::Value;

use crate::{TransformError, map_anthropic_stop_reason};

pub fn chat(body: &Value) -> Result<Value, TransformError> {
    let resp: anthropic::MessagesResponse =
        serde_json::from_value(body.clone()).map_err(TransformError::decode)?;

    let content: String = resp
        .content
        .iter()
        .filter_map(|block| match block {
            anthropic::ContentBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("");

    let out = openai::ChatCompletionResponse {
        id: format!("chatcmpl-{}", resp.id),
        object: "chat.completion".to_string(),
        created: now_unix(),
        model: resp.model,
        choices: vec![openai::ChatChoice {
            index: 0,
            message: openai::ChatResponseMessage {
                role: resp.role,
                content: Some(content),
            },
            finish_reason: resp
                .stop_reason
                .as_deref()
                .map(|reason| map_anthropic_stop_reason(reason).to_string()),
        }],
        usage: Some(openai::Usage {
            prompt_tokens: resp.usage.input_tokens,
            completion_tokens: resp.usage.output_tokens,
            total_tokens: resp.usage.input_tokens + resp.usage.output_tokens,
        }),
    };
    serde_json::to_value(out).map_err(TransformError::decode)
}

pub fn text(body: &Value) -> Result<Value, TransformError> {
    let resp: anthropic::CompleteResponse =
        serde_json::from_value(body.clone()).map_err(TransformError::decode)?;

    let out = openai::ChatCompletionResponse {
        id: "chatcmpl-anthropic".to_string(),
        object: "chat.completion".to_string(),
        created: now_unix(),
        model: resp.model.unwrap_or_else(|| "claude".to_string()),
        choices: vec![openai::ChatChoice {
            index: 0,
            message: openai::ChatResponseMessage {
                role: "assistant".to_string(),
                content: Some(resp.completion),
            },
            finish_reason: resp
                .stop_reason
                .as_deref()
                .map(|reason| map_anthropic_stop_reason(reason).to_string()),
        }],
        usage: None,
    };
    serde_json::to_value(out).map_err(TransformError::decode)
}

/// Modern messages response rendered for a legacy `/v1/complete` client.
pub fn chat_to_text(body: &Value) -> Result<Value, TransformError> {
    let resp: anthropic::MessagesResponse =
        serde_json::from_value(body.clone()).map_err(TransformError::decode)?;

    let completion: String = resp
        .content
        .iter()
        .filter_map(|block| match block {
            anthropic::ContentBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("");

    let out = anthropic::CompleteResponse {
        completion,
        stop_reason: resp.stop_reason,
        model: Some(resp.model),
    };
    serde_json::to_value(out).map_err(TransformError::decode)
}

pub(super) fn now_unix() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

use kproxy_protocol::anthropic;
use kproxy_protocol::openai;
use serde_json::Value;

use super::anthropic2openai::now_unix;
use crate::{TransformError, map_openai_finish_reason};

/// OpenAI upstream response rendered for an Anthropic messages client.
pub fn chat(body: &Value) -> Result<Value, TransformError> {
    let resp: openai::ChatCompletionResponse =
        serde_json::from_value(body.clone()).map_err(TransformError::decode)?;

    let choice = resp
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| TransformError::Decode("empty choices".to_string()))?;

    let out = anthropic::MessagesResponse {
        id: format!("msg_{}", resp.id),
        response_type: "message".to_string(),
        role: "assistant".to_string(),
        content: vec![anthropic::ContentBlock::Text {
            text: choice.message.content.unwrap_or_default(),
        }],
        model: resp.model,
        stop_reason: choice
            .finish_reason
            .as_deref()
            .map(|reason| map_openai_finish_reason(reason).to_string()),
        stop_sequence: None,
        usage: resp
            .usage
            .map(|usage| anthropic::MessagesUsage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
            })
            .unwrap_or_default(),
    };
    serde_json::to_value(out).map_err(TransformError::decode)
}

/// OpenAI chat response rendered for a legacy text-completion client.
pub fn chat_to_openai_text(body: &Value) -> Result<Value, TransformError> {
    let resp: openai::ChatCompletionResponse =
        serde_json::from_value(body.clone()).map_err(TransformError::decode)?;

    let out = openai::CompletionResponse {
        id: resp.id,
        object: "text_completion".to_string(),
        created: now_unix(),
        model: resp.model,
        choices: resp
            .choices
            .into_iter()
            .map(|choice| openai::CompletionChoice {
                index: choice.index,
                text: choice.message.content.unwrap_or_default(),
                finish_reason: choice.finish_reason,
            })
            .collect(),
        usage: resp.usage,
    };
    serde_json::to_value(out).map_err(TransformError::decode)
}

use kproxy_protocol::mistral;
use kproxy_protocol::openai;
use serde_json::Value;

use super::anthropic2openai::now_unix;
use crate::TransformError;

pub fn chat(body: &Value) -> Result<Value, TransformError> {
    let resp: mistral::ChatResponse =
        serde_json::from_value(body.clone()).map_err(TransformError::decode)?;

    let out = openai::ChatCompletionResponse {
        id: resp.id,
        object: "chat.completion".to_string(),
        created: resp.created,
        model: resp.model,
        choices: resp
            .choices
            .into_iter()
            .map(|choice| openai::ChatChoice {
                index: choice.index,
                message: openai::ChatResponseMessage {
                    role: choice.message.role,
                    content: Some(choice.message.content),
                },
                finish_reason: choice.finish_reason,
            })
            .collect(),
        usage: resp.usage.map(|usage| openai::Usage {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
        }),
    };
    serde_json::to_value(out).map_err(TransformError::decode)
}

/// Bedrock Mistral raw output rendered as a chat response.
pub fn text_to_chat(body: &Value) -> Result<Value, TransformError> {
    let resp: mistral::TextResponse =
        serde_json::from_value(body.clone()).map_err(TransformError::decode)?;

    let (text, stop_reason) = resp
        .outputs
        .into_iter()
        .next()
        .map(|output| (output.text, output.stop_reason))
        .unwrap_or_default();

    let out = mistral::ChatResponse {
        id: "cmpl-mistral".to_string(),
        object: "chat.completion".to_string(),
        created: now_unix(),
        model: "mistral".to_string(),
        choices: vec![mistral::ChatChoice {
            index: 0,
            message: mistral::ChatMessage {
                role: "assistant".to_string(),
                content: text,
            },
            finish_reason: stop_reason,
        }],
        usage: None,
    };
    serde_json::to_value(out).map_err(TransformError::decode)
}

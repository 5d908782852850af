use kproxy_protocol::google;
use kproxy_protocol::openai;
use serde_json::Value;

use super::anthropic2openai::now_unix;
use crate::{TransformError, map_google_finish_reason};

pub fn chat(body: &Value) -> Result<Value, TransformError> {
    let resp: google::GenerateContentResponse =
        serde_json::from_value(body.clone()).map_err(TransformError::decode)?;

    let usage = resp.usage_metadata.map(|meta| openai::Usage {
        prompt_tokens: meta.prompt_token_count,
        completion_tokens: meta.candidates_token_count,
        total_tokens: meta.total_token_count,
    });
    let finish_reason = resp
        .finish_reason()
        .map(|reason| map_google_finish_reason(reason).to_string());
    let content = resp.first_candidate_text();

    let out = openai::ChatCompletionResponse {
        id: "chatcmpl-gemini".to_string(),
        object: "chat.completion".to_string(),
        created: now_unix(),
        model: "gemini".to_string(),
        choices: vec![openai::ChatChoice {
            index: 0,
            message: openai::ChatResponseMessage {
                role: "assistant".to_string(),
                content: Some(content),
            },
            finish_reason,
        }],
        usage,
    };
    serde_json::to_value(out).map_err(TransformError::decode)
}

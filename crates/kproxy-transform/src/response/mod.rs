//! Blocking response translation, run by the response handler after error
//! classification.

mod anthropic2openai;
mod google2openai;
mod mistral2openai;
mod openai2anthropic;

use kproxy_common::ApiFormat;
use serde_json::Value;

use crate::TransformError;

/// Translate a response body from the upstream format `src` back into the
/// client's format `dst`. Pairs without a direct transformer compose through
/// the OpenAI chat shape.
pub fn transform_response(
    src: ApiFormat,
    dst: ApiFormat,
    body: &Value,
) -> Result<Value, TransformError> {
    if src == dst {
        return Ok(body.clone());
    }
    if let Some(result) = direct(src, dst, body) {
        return result;
    }
    let Some(hub) = direct(src, ApiFormat::OpenAi, body) else {
        return Err(TransformError::UnsupportedPair { src, dst });
    };
    direct(ApiFormat::OpenAi, dst, &hub?)
        .unwrap_or(Err(TransformError::UnsupportedPair { src, dst }))
}

fn direct(src: ApiFormat, dst: ApiFormat, body: &Value) -> Option<Result<Value, TransformError>> {
    let result = match (src, dst) {
        (ApiFormat::AnthropicChat, ApiFormat::OpenAi) => anthropic2openai::chat(body),
        (ApiFormat::AnthropicText, ApiFormat::OpenAi) => anthropic2openai::text(body),
        (ApiFormat::AnthropicChat, ApiFormat::AnthropicText) => {
            anthropic2openai::chat_to_text(body)
        }
        (ApiFormat::GoogleAi, ApiFormat::OpenAi) => google2openai::chat(body),
        (ApiFormat::Mistral, ApiFormat::OpenAi) => mistral2openai::chat(body),
        (ApiFormat::MistralText, ApiFormat::Mistral) => mistral2openai::text_to_chat(body),
        (ApiFormat::MistralText, ApiFormat::OpenAi) => {
            mistral2openai::text_to_chat(body).and_then(|chat| mistral2openai::chat(&chat))
        }
        (ApiFormat::OpenAi, ApiFormat::AnthropicChat) => openai2anthropic::chat(body),
        (ApiFormat::OpenAi, ApiFormat::OpenAiText) => {
            openai2anthropic::chat_to_openai_text(body)
        }
        _ => return None,
    };
    Some(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anthropic_chat_round_trip_preserves_role() {
        let upstream = serde_json::json!({
            "id": "msg_01",
            "type": "message",
            "role": "assistant",
            "model": "claude-3-5-sonnet-20240620",
            "content": [{"type": "text", "text": "hello"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 3, "output_tokens": 2},
        });
        let out = transform_response(ApiFormat::AnthropicChat, ApiFormat::OpenAi, &upstream)
            .unwrap();
        assert_eq!(out["choices"][0]["message"]["role"], "assistant");
        assert_eq!(out["choices"][0]["message"]["content"], "hello");
        assert_eq!(out["choices"][0]["finish_reason"], "stop");
        assert_eq!(out["usage"]["prompt_tokens"], 3);
        assert_eq!(out["usage"]["completion_tokens"], 2);
    }

    #[test]
    fn google_response_extracts_first_candidate() {
        let upstream = serde_json::json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "hi"}]},
                "finishReason": "MAX_TOKENS",
            }],
            "usageMetadata": {"promptTokenCount": 5, "candidatesTokenCount": 7, "totalTokenCount": 12},
        });
        let out =
            transform_response(ApiFormat::GoogleAi, ApiFormat::OpenAi, &upstream).unwrap();
        assert_eq!(out["choices"][0]["message"]["content"], "hi");
        assert_eq!(out["choices"][0]["finish_reason"], "length");
    }
}

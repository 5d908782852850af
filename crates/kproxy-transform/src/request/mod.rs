//! One-time request translation, run by the API-format preprocessor before
//! the request is enqueued.

mod anthropic2openai;
mod anthropic_text2anthropic;
mod mistral2mistral_text;
mod openai2anthropic;
mod openai2google;
mod openai2mistral;
mod openai_text2openai;

use kproxy_common::ApiFormat;
use serde_json::Value;

use crate::TransformError;

/// Translate a request body from `src` to `dst`. Identity pairs are returned
/// unchanged; pairs without a direct transformer compose through the OpenAI
/// chat shape, which every format maps to and from.
pub fn transform_request(
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
        (ApiFormat::OpenAi, ApiFormat::AnthropicChat) => openai2anthropic::chat(body),
        (ApiFormat::OpenAi, ApiFormat::AnthropicText) => openai2anthropic::text(body),
        (ApiFormat::OpenAi, ApiFormat::GoogleAi) => openai2google::chat(body),
        (ApiFormat::OpenAi, ApiFormat::Mistral) => openai2mistral::chat(body),
        (ApiFormat::OpenAi, ApiFormat::MistralText) => {
            openai2mistral::chat(body).and_then(|chat| mistral2mistral_text::text(&chat))
        }
        (ApiFormat::OpenAiText, ApiFormat::OpenAi) => openai_text2openai::chat(body),
        (ApiFormat::AnthropicChat, ApiFormat::OpenAi) => anthropic2openai::chat(body),
        (ApiFormat::Mistral, ApiFormat::MistralText) => mistral2mistral_text::text(body),
        (ApiFormat::AnthropicText, ApiFormat::AnthropicChat) => {
            anthropic_text2anthropic::chat(body)
        }
        _ => return None,
    };
    Some(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn openai_chat_body() -> Value {
        serde_json::json!({
            "model": "gpt-4o-2024-05-13",
            "messages": [
                {"role": "system", "content": "be terse"},
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": "hello"},
                {"role": "user", "content": "bye"},
            ],
            "max_tokens": 64,
            "temperature": 0.5,
            "stop": ["###"],
            "stream": true,
        })
    }

    #[test]
    fn identity_pair_is_untouched() {
        let body = openai_chat_body();
        let out = transform_request(ApiFormat::OpenAi, ApiFormat::OpenAi, &body).unwrap();
        assert_eq!(out, body);
    }

    #[test]
    fn openai_to_anthropic_chat_keeps_message_order() {
        let out =
            transform_request(ApiFormat::OpenAi, ApiFormat::AnthropicChat, &openai_chat_body())
                .unwrap();
        assert_eq!(out["system"], "be terse");
        let roles: Vec<&str> = out["messages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["role"].as_str().unwrap())
            .collect();
        assert_eq!(roles, vec!["user", "assistant", "user"]);
        assert_eq!(out["max_tokens"], 64);
        assert_eq!(out["stop_sequences"][0], "###");
    }

    #[test]
    fn openai_to_google_rekeys_generation_params() {
        let out = transform_request(ApiFormat::OpenAi, ApiFormat::GoogleAi, &openai_chat_body())
            .unwrap();
        assert_eq!(out["generationConfig"]["maxOutputTokens"], 64);
        assert_eq!(out["generationConfig"]["stopSequences"][0], "###");
        assert_eq!(
            out["systemInstruction"]["parts"][0]["text"],
            "be terse"
        );
        // Assistant turns become "model" turns.
        let roles: Vec<&str> = out["contents"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["role"].as_str().unwrap())
            .collect();
        assert_eq!(roles, vec!["user", "model", "user"]);
    }

    #[test]
    fn unsupported_pair_is_an_error() {
        let err = transform_request(ApiFormat::GoogleAi, ApiFormat::Mistral, &openai_chat_body())
            .unwrap_err();
        assert!(matches!(err, TransformError::UnsupportedPair { .. }));
    }
}

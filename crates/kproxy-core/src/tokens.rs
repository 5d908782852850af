//! Prompt token counting.
//!
//! OpenAI-family prompts are counted with tiktoken; providers without a
//! public tokenizer get a bytes/4 estimate. The response path prefers the
//! upstream's own usage numbers when present.

use std::sync::OnceLock;

use kproxy_common::{ApiFormat, ProxyError, Service};
use kproxy_protocol::{anthropic, google, mistral, openai};
use serde_json::Value;
use tiktoken_rs::CoreBPE;

/// Default assumed completion budget when the client does not set one.
const DEFAULT_OUTPUT_TOKENS: u64 = 16;

fn cl100k() -> Option<&'static CoreBPE> {
    static BPE: OnceLock<Option<CoreBPE>> = OnceLock::new();
    BPE.get_or_init(|| tiktoken_rs::cl100k_base().ok()).as_ref()
}

/// Extract the prompt text for a request body in `format`.
pub fn prompt_text(format: ApiFormat, body: &Value) -> Result<String, ProxyError> {
    let text = match format {
        ApiFormat::OpenAi => parse::<openai::ChatCompletionRequest>(body)?.flattened_text(),
        ApiFormat::OpenAiText => parse::<openai::CompletionRequest>(body)?.prompt,
        ApiFormat::OpenAiImage => parse::<openai::ImageGenerationRequest>(body)?.prompt,
        ApiFormat::AnthropicChat => parse::<anthropic::MessagesRequest>(body)?.flattened_text(),
        ApiFormat::AnthropicText => parse::<anthropic::CompleteRequest>(body)?.prompt,
        ApiFormat::GoogleAi => parse::<google::GenerateContentRequest>(body)?.flattened_text(),
        ApiFormat::Mistral => parse::<mistral::ChatRequest>(body)?.flattened_text(),
        ApiFormat::MistralText => parse::<mistral::TextRequest>(body)?.prompt,
    };
    Ok(text)
}

/// Count prompt tokens for a request body already translated into `format`.
pub fn count_prompt_tokens(
    service: Service,
    format: ApiFormat,
    body: &Value,
) -> Result<u64, ProxyError> {
    let text = prompt_text(format, body)?;
    Ok(count_text(service, &text))
}

pub fn count_text(service: Service, text: &str) -> u64 {
    match service {
        Service::OpenAi | Service::Azure => match cl100k() {
            Some(bpe) => bpe.encode_with_special_tokens(text).len() as u64,
            None => estimate(text),
        },
        _ => estimate(text),
    }
}

fn estimate(text: &str) -> u64 {
    (text.len() as u64).div_ceil(4)
}

/// The client's requested completion budget, used for quota accounting and
/// scheduling weight before any output exists.
pub fn requested_output_tokens(format: ApiFormat, body: &Value) -> u64 {
    let max = match format {
        ApiFormat::OpenAi => body
            .get("max_tokens")
            .or_else(|| body.get("max_completion_tokens"))
            .and_then(Value::as_u64),
        ApiFormat::AnthropicChat => body.get("max_tokens").and_then(Value::as_u64),
        ApiFormat::AnthropicText => body.get("max_tokens_to_sample").and_then(Value::as_u64),
        ApiFormat::GoogleAi => body
            .pointer("/generationConfig/maxOutputTokens")
            .and_then(Value::as_u64),
        ApiFormat::OpenAiText | ApiFormat::Mistral | ApiFormat::MistralText => {
            body.get("max_tokens").and_then(Value::as_u64)
        }
        ApiFormat::OpenAiImage => Some(0),
    };
    max.unwrap_or(DEFAULT_OUTPUT_TOKENS)
}

fn parse<T: serde::de::DeserializeOwned>(body: &Value) -> Result<T, ProxyError> {
    serde_json::from_value(body.clone())
        .map_err(|err| ProxyError::BadRequest(format!("request body: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openai_prompts_use_tiktoken() {
        let body = serde_json::json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "hello world"}],
        });
        let count = count_prompt_tokens(Service::OpenAi, ApiFormat::OpenAi, &body).unwrap();
        assert!(count >= 2);
        assert!(count < 10);
    }

    #[test]
    fn other_providers_estimate_by_length() {
        let body = serde_json::json!({
            "model": "claude-3-5-sonnet-20240620",
            "max_tokens": 256,
            "messages": [{"role": "user", "content": "abcdefgh"}],
        });
        let count =
            count_prompt_tokens(Service::Anthropic, ApiFormat::AnthropicChat, &body).unwrap();
        // "abcdefgh\n" is nine bytes.
        assert_eq!(count, 3);
    }

    #[test]
    fn requested_output_tokens_reads_per_format_field() {
        let anthropic = serde_json::json!({"max_tokens": 512});
        assert_eq!(
            requested_output_tokens(ApiFormat::AnthropicChat, &anthropic),
            512
        );
        let google = serde_json::json!({"generationConfig": {"maxOutputTokens": 99}});
        assert_eq!(requested_output_tokens(ApiFormat::GoogleAi, &google), 99);
        let none = serde_json::json!({});
        assert_eq!(
            requested_output_tokens(ApiFormat::OpenAi, &none),
            DEFAULT_OUTPUT_TOKENS
        );
    }
}

//! Error rendering.
//!
//! Proxy errors are disguised as assistant completions in the client's own
//! format so chat frontends display them in-line instead of swallowing an
//! unexpected error shape. Streaming clients get the full event sequence
//! their format expects, terminated normally.

use kproxy_common::ApiFormat;
use kproxy_protocol::openai::{ChatCompletionChunk, ChunkDelta};
use kproxy_protocol::sse::SseFrame;
use serde_json::Value;

use crate::stream::StreamEmitter;

const SPOOFED_MODEL: &str = "proxy-error";

/// Render an error message as a blocking completion body in `format`.
pub fn spoof_completion(format: ApiFormat, message: &str) -> Value {
    let text = banner(message);
    let now = time::OffsetDateTime::now_utc().unix_timestamp();
    match format {
        ApiFormat::OpenAi | ApiFormat::OpenAiImage => serde_json::json!({
            "id": "chatcmpl-proxy-error",
            "object": "chat.completion",
            "created": now,
            "model": SPOOFED_MODEL,
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": text},
                "finish_reason": "stop",
            }],
        }),
        ApiFormat::OpenAiText => serde_json::json!({
            "id": "cmpl-proxy-error",
            "object": "text_completion",
            "created": now,
            "model": SPOOFED_MODEL,
            "choices": [{"index": 0, "text": text, "finish_reason": "stop"}],
        }),
        ApiFormat::AnthropicChat => serde_json::json!({
            "id": "msg_proxy_error",
            "type": "message",
            "role": "assistant",
            "model": SPOOFED_MODEL,
            "content": [{"type": "text", "text": text}],
            "stop_reason": "end_turn",
            "stop_sequence": null,
            "usage": {"input_tokens": 0, "output_tokens": 0},
        }),
        ApiFormat::AnthropicText => serde_json::json!({
            "completion": text,
            "stop_reason": "stop_sequence",
            "model": SPOOFED_MODEL,
        }),
        ApiFormat::GoogleAi => serde_json::json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": text}]},
                "finishReason": "STOP",
                "index": 0,
            }],
        }),
        ApiFormat::Mistral | ApiFormat::MistralText => serde_json::json!({
            "id": "cmpl-proxy-error",
            "object": "chat.completion",
            "created": now,
            "model": SPOOFED_MODEL,
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": text},
                "finish_reason": "stop",
            }],
        }),
    }
}

/// Render an error as SSE frames in `format`, including the terminating
/// frames the format requires.
pub fn spoof_stream(format: ApiFormat, message: &str) -> Vec<SseFrame> {
    let mut emitter = StreamEmitter::new(format);
    let now = time::OffsetDateTime::now_utc().unix_timestamp();
    let base = ChatCompletionChunk::new("chatcmpl-proxy-error", SPOOFED_MODEL, now);

    let mut frames = Vec::new();
    frames.extend(emitter.emit(&base.clone().with_delta(ChunkDelta::role("assistant"), None)));
    frames.extend(emitter.emit(&base.clone().with_delta(ChunkDelta::text(banner(message)), None)));
    frames.extend(emitter.emit(
        &base.with_delta(ChunkDelta::default(), Some("stop".to_string())),
    ));
    frames.extend(emitter.finish());
    frames
}

fn banner(message: &str) -> String {
    format!("\n\n**Proxy error:** {message}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anthropic_stream_spoof_has_full_sequence() {
        let frames = spoof_stream(ApiFormat::AnthropicChat, "no keys available");
        let names: Vec<&str> = frames
            .iter()
            .map(|frame| frame.event.as_deref().unwrap())
            .collect();
        assert_eq!(
            names,
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
        assert!(frames[2].data.contains("no keys available"));
    }

    #[test]
    fn openai_stream_spoof_ends_with_done() {
        let frames = spoof_stream(ApiFormat::OpenAi, "boom");
        assert_eq!(frames.last().unwrap().data, "[DONE]");
    }

    #[test]
    fn blocking_spoof_reads_as_completion() {
        let body = spoof_completion(ApiFormat::OpenAi, "quota exhausted");
        assert!(
            body["choices"][0]["message"]["content"]
                .as_str()
                .unwrap()
                .contains("quota exhausted")
        );
    }
}

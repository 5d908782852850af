//! Response handling: the blocking and streaming paths, error
//! classification, retry triggering, and usage accounting.

use base64::Engine;
use bytes::Bytes;
use kproxy_common::{ApiFormat, ProxyError, Service};
use kproxy_keys::key::KeyExtra;
use kproxy_protocol::eventstream::EventStreamDecoder;
use kproxy_protocol::sse::SseParser;
use kproxy_transform::stream::StreamItem;
use kproxy_transform::{StreamAdapter, StreamAggregator, StreamEmitter, transform_response};
use serde_json::Value;

use crate::classify::{Verdict, classify, classify_stream_error};
use crate::client::{UpstreamFailure, UpstreamResponse, UpstreamResponseBody};
use crate::manager::RequestManager;
use crate::queue::StreamHandle;
use crate::state::AppState;
use crate::tokens;

/// Final result of one request, in the client's inbound format.
#[derive(Debug)]
pub struct CompletedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Value,
}

/// What the engine should do next.
#[derive(Debug)]
pub enum Outcome {
    Done(CompletedResponse),
    /// Mutations are already reverted and the key already marked; re-enqueue.
    Retry,
}

/// Client-side streaming state that survives retries: the emitter keeps its
/// place in the event protocol, and the sent-character count lets a retry
/// skip the prefix the client already received.
pub struct StreamSession {
    pub emitter: StreamEmitter,
    pub sent_content_chars: usize,
}

impl StreamSession {
    pub fn new(format: ApiFormat) -> Self {
        Self {
            emitter: StreamEmitter::new(format),
            sent_content_chars: 0,
        }
    }
}

pub async fn process(
    state: &AppState,
    manager: &mut RequestManager,
    result: Result<UpstreamResponse, UpstreamFailure>,
    stream: Option<(&StreamHandle, &mut StreamSession)>,
) -> Result<Outcome, ProxyError> {
    let response = match result {
        Ok(response) => response,
        Err(failure) => {
            // No HTTP response at all: transient; the key keeps its reuse
            // throttle, which paces the retry loop.
            tracing::warn!(message = %failure.message, "upstream transport failure");
            manager.revert();
            return Ok(Outcome::Retry);
        }
    };

    match response.body {
        UpstreamResponseBody::Full(bytes) => {
            let body = parse_body(&response.headers, &bytes);
            let verdict = classify(
                manager.request().service,
                response.status,
                &response.headers,
                &body,
            );
            match verdict {
                Verdict::Success => {
                    finish_blocking(state, manager, response.status, response.headers, body).await
                }
                other => apply_verdict(state, manager, other, &response.headers).await,
            }
        }
        UpstreamResponseBody::Stream(rx) => {
            let Some((handle, session)) = stream else {
                return Err(ProxyError::UpstreamFatal(
                    "upstream streamed a non-streaming request".to_string(),
                ));
            };
            process_stream(state, manager, response.headers, rx, handle, session).await
        }
    }
}

// ---- blocking path ----

async fn finish_blocking(
    state: &AppState,
    manager: &mut RequestManager,
    status: u16,
    upstream_headers: Vec<(String, String)>,
    body: Value,
) -> Result<Outcome, ProxyError> {
    // Mutations are no longer needed once the upstream answered.
    manager.revert();

    let output_tokens = response_output_tokens(
        manager.request().service,
        manager.request().outbound_format,
        &body,
    );
    account_usage(state, manager, output_tokens).await;

    let translated = transform_response(
        manager.request().outbound_format,
        manager.request().inbound_format,
        &body,
    )
    .map_err(|err| ProxyError::UpstreamFatal(err.to_string()))?;

    Ok(Outcome::Done(CompletedResponse {
        status,
        headers: copy_response_headers(&upstream_headers),
        body: translated,
    }))
}

// ---- streaming path ----

async fn process_stream(
    state: &AppState,
    manager: &mut RequestManager,
    upstream_headers: Vec<(String, String)>,
    mut rx: tokio::sync::mpsc::Receiver<Result<Bytes, String>>,
    handle: &StreamHandle,
    session: &mut StreamSession,
) -> Result<Outcome, ProxyError> {
    let mut decoder = Decoder::for_headers(&upstream_headers);
    let mut adapter = StreamAdapter::new(
        manager.request().outbound_format,
        &manager.request().model,
    );
    let mut aggregator = StreamAggregator::new();
    let mut skip = if manager.request().retry_count == 0 {
        0
    } else {
        session.sent_content_chars
    };
    let mut done = false;

    while let Some(piece) = rx.recv().await {
        let datas = match piece {
            Ok(bytes) => match decoder.push(&bytes) {
                Ok(datas) => datas,
                Err(err) => {
                    return stream_abort(state, manager, session, handle, &aggregator, err).await;
                }
            },
            Err(err) => {
                // Mid-flight abort: keep what was aggregated, else surface.
                return stream_abort(state, manager, session, handle, &aggregator, err).await;
            }
        };
        for data in datas {
            let items = match adapter.adapt(&data) {
                Ok(items) => items,
                Err(err) => {
                    tracing::debug!(error = %err, "undecodable stream event dropped");
                    continue;
                }
            };
            for item in items {
                match item {
                    StreamItem::Chunk(chunk) => {
                        aggregator.push(&chunk);
                        let Some(chunk) = trim_sent_prefix(chunk, &mut skip) else {
                            continue;
                        };
                        if let Some(content) = chunk.first_content() {
                            session.sent_content_chars += content.chars().count();
                        }
                        for frame in session.emitter.emit(&chunk) {
                            handle.send_frame(&frame).await?;
                        }
                    }
                    StreamItem::Done => done = true,
                    StreamItem::UpstreamError {
                        error_type,
                        message,
                    } => {
                        let verdict = classify_stream_error(&error_type, &message);
                        return apply_verdict(state, manager, verdict, &upstream_headers).await;
                    }
                }
            }
        }
        if done {
            break;
        }
    }

    // Terminate the client stream in its own format.
    for frame in session.emitter.finish() {
        handle.send_frame(&frame).await?;
    }

    manager.revert();
    let output_tokens = aggregator
        .completion_tokens()
        .map(u64::from)
        .unwrap_or_else(|| {
            tokens::count_text(manager.request().service, aggregator.content())
        });
    account_usage(state, manager, output_tokens).await;

    let final_body = aggregator
        .finish(manager.request().inbound_format)
        .map_err(|err| ProxyError::UpstreamFatal(err.to_string()))?;
    Ok(Outcome::Done(CompletedResponse {
        status: 200,
        headers: vec![(
            "content-type".to_string(),
            "text/event-stream".to_string(),
        )],
        body: final_body,
    }))
}

async fn stream_abort(
    state: &AppState,
    manager: &mut RequestManager,
    session: &mut StreamSession,
    handle: &StreamHandle,
    aggregator: &StreamAggregator,
    error: impl std::fmt::Display,
) -> Result<Outcome, ProxyError> {
    if aggregator.events_seen() == 0 {
        return Err(ProxyError::UpstreamFatal(error.to_string()));
    }
    // Partial stream: close out what the client already has and account it.
    for frame in session.emitter.finish() {
        handle.send_frame(&frame).await?;
    }
    manager.revert();
    let output_tokens = aggregator
        .completion_tokens()
        .map(u64::from)
        .unwrap_or_else(|| tokens::count_text(manager.request().service, aggregator.content()));
    account_usage(state, manager, output_tokens).await;
    let final_body = aggregator
        .finish(manager.request().inbound_format)
        .map_err(|err| ProxyError::UpstreamFatal(err.to_string()))?;
    Ok(Outcome::Done(CompletedResponse {
        status: 200,
        headers: Vec::new(),
        body: final_body,
    }))
}

/// Drop the content prefix the client already received from an earlier
/// attempt; finish/role chunks always pass.
fn trim_sent_prefix(
    mut chunk: kproxy_protocol::openai::ChatCompletionChunk,
    skip: &mut usize,
) -> Option<kproxy_protocol::openai::ChatCompletionChunk> {
    if *skip == 0 {
        return Some(chunk);
    }
    let Some(choice) = chunk.choices.first_mut() else {
        return None;
    };
    let Some(content) = choice.delta.content.clone() else {
        // Role-only chunks were already delivered once.
        return choice.finish_reason.is_some().then_some(chunk);
    };
    let chars = content.chars().count();
    if chars <= *skip {
        *skip -= chars;
        if choice.finish_reason.is_some() {
            choice.delta.content = None;
            return Some(chunk);
        }
        return None;
    }
    let remainder: String = content.chars().skip(*skip).collect();
    *skip = 0;
    choice.delta.content = Some(remainder);
    Some(chunk)
}

// ---- shared verdict application ----

async fn apply_verdict(
    state: &AppState,
    manager: &mut RequestManager,
    verdict: Verdict,
    upstream_headers: &[(String, String)],
) -> Result<Outcome, ProxyError> {
    let service = manager.request().service;
    let key_hash = manager
        .request()
        .key
        .as_ref()
        .map(|key| key.hash.clone());

    match verdict {
        Verdict::Success => Err(ProxyError::UpstreamFatal(
            "success routed to verdict application".to_string(),
        )),
        Verdict::BadPrompt(message) => Err(ProxyError::BadRequest(message)),
        Verdict::RetryRateLimited => {
            if let Some(hash) = key_hash {
                if service == Service::OpenAi {
                    let (requests_reset, tokens_reset) = openai_resets(upstream_headers);
                    state
                        .pool
                        .update_rate_limits(service, &hash, requests_reset, tokens_reset)
                        .await;
                } else {
                    state.pool.mark_rate_limited(service, &hash).await;
                }
            }
            manager.revert();
            Ok(Outcome::Retry)
        }
        Verdict::RetryPreamble => {
            if let (Some(hash), Some(key)) = (key_hash, manager.request().key.clone())
                && let KeyExtra::Anthropic {
                    tier,
                    is_pozzed,
                    is_over_quota,
                    allows_multimodality,
                    ..
                } = key.extra
            {
                state
                    .pool
                    .update(
                        service,
                        &hash,
                        kproxy_keys::KeyPatch {
                            extra: Some(KeyExtra::Anthropic {
                                tier,
                                is_pozzed,
                                is_over_quota,
                                requires_preamble: true,
                                allows_multimodality,
                            }),
                            ..Default::default()
                        },
                    )
                    .await;
            }
            manager.revert();
            Ok(Outcome::Retry)
        }
        Verdict::RetryVision => {
            if let (Some(hash), Some(key)) = (key_hash, manager.request().key.clone())
                && let KeyExtra::Anthropic {
                    tier,
                    is_pozzed,
                    is_over_quota,
                    requires_preamble,
                    ..
                } = key.extra
            {
                state
                    .pool
                    .update(
                        service,
                        &hash,
                        kproxy_keys::KeyPatch {
                            extra: Some(KeyExtra::Anthropic {
                                tier,
                                is_pozzed,
                                is_over_quota,
                                requires_preamble,
                                allows_multimodality: false,
                            }),
                            ..Default::default()
                        },
                    )
                    .await;
            }
            manager.revert();
            Ok(Outcome::Retry)
        }
        Verdict::KeyRevoked => {
            if let Some(hash) = key_hash {
                state.pool.disable(service, &hash, true).await;
            }
            Err(ProxyError::KeyInvalid)
        }
        Verdict::KeyQuotaExhausted => {
            if let Some(hash) = key_hash {
                state.pool.disable(service, &hash, false).await;
            }
            Err(ProxyError::KeyQuotaExceeded)
        }
        Verdict::Surface { status, message } => {
            if status == 400 {
                Err(ProxyError::BadRequest(message))
            } else {
                Err(ProxyError::UpstreamFatal(format!(
                    "upstream returned {status}: {message}"
                )))
            }
        }
    }
}

// ---- helpers ----

enum Decoder {
    Sse(SseParser),
    EventStream(EventStreamDecoder),
}

impl Decoder {
    fn for_headers(headers: &[(String, String)]) -> Self {
        let content_type = headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
            .map(|(_, value)| value.as_str())
            .unwrap_or("");
        if content_type.contains("vnd.amazon.eventstream") {
            Decoder::EventStream(EventStreamDecoder::new())
        } else {
            Decoder::Sse(SseParser::new())
        }
    }

    /// Decode raw bytes into event payload strings.
    fn push(&mut self, bytes: &Bytes) -> Result<Vec<String>, ProxyError> {
        match self {
            Decoder::Sse(parser) => Ok(parser
                .push_bytes(bytes)
                .into_iter()
                .map(|frame| frame.data)
                .collect()),
            Decoder::EventStream(decoder) => {
                let frames = decoder
                    .push_bytes(bytes)
                    .map_err(|err| ProxyError::UpstreamFatal(err.to_string()))?;
                let mut datas = Vec::new();
                for frame in frames {
                    if frame.message_type() == Some("exception") {
                        let kind = frame.exception_type().unwrap_or("unknown").to_string();
                        let message = String::from_utf8_lossy(&frame.payload).into_owned();
                        // Synthesized as an in-band error event for the
                        // adapter-independent error path.
                        datas.push(
                            serde_json::json!({
                                "type": "error",
                                "error": {"type": kind, "message": message},
                            })
                            .to_string(),
                        );
                        continue;
                    }
                    // Bedrock wraps the inner JSON as {"bytes": base64}.
                    let payload: Value = serde_json::from_slice(&frame.payload)
                        .unwrap_or(Value::Null);
                    if let Some(encoded) = payload.get("bytes").and_then(Value::as_str) {
                        if let Ok(inner) =
                            base64::engine::general_purpose::STANDARD.decode(encoded)
                        {
                            datas.push(String::from_utf8_lossy(&inner).into_owned());
                        }
                    } else if payload != Value::Null {
                        datas.push(payload.to_string());
                    }
                }
                Ok(datas)
            }
        }
    }
}

fn parse_body(headers: &[(String, String)], bytes: &Bytes) -> Value {
    let looks_json = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
        .map(|(_, value)| value.contains("json"))
        .unwrap_or(true);
    if looks_json && let Ok(value) = serde_json::from_slice(bytes) {
        return value;
    }
    Value::String(String::from_utf8_lossy(bytes).into_owned())
}

/// Output token count from the upstream's own usage block, falling back to a
/// local count of the generated text.
fn response_output_tokens(service: Service, format: ApiFormat, body: &Value) -> u64 {
    let from_usage = match format {
        ApiFormat::OpenAi | ApiFormat::OpenAiText | ApiFormat::Mistral => {
            body.pointer("/usage/completion_tokens").and_then(Value::as_u64)
        }
        ApiFormat::AnthropicChat => body.pointer("/usage/output_tokens").and_then(Value::as_u64),
        ApiFormat::GoogleAi => body
            .pointer("/usageMetadata/candidatesTokenCount")
            .and_then(Value::as_u64),
        ApiFormat::AnthropicText | ApiFormat::MistralText | ApiFormat::OpenAiImage => None,
    };
    from_usage.unwrap_or_else(|| {
        let text = match format {
            ApiFormat::AnthropicText => body
                .get("completion")
                .and_then(Value::as_str)
                .unwrap_or_default(),
            ApiFormat::MistralText => body
                .pointer("/outputs/0/text")
                .and_then(Value::as_str)
                .unwrap_or_default(),
            _ => body
                .pointer("/choices/0/message/content")
                .or_else(|| body.pointer("/content/0/text"))
                .and_then(Value::as_str)
                .unwrap_or_default(),
        };
        tokens::count_text(service, text)
    })
}

async fn account_usage(state: &AppState, manager: &mut RequestManager, output_tokens: u64) {
    manager.scheduling_mut().output_tokens = output_tokens;
    let request = manager.request();
    let total = request.prompt_tokens + output_tokens;
    if let Some(key) = &request.key {
        state
            .pool
            .increment_usage(request.service, &key.hash, &request.model, total)
            .await;
    }
    if let Some(token) = &request.user_token {
        state.users.record_usage(token, request.model_family, total);
    }
    state
        .events
        .emit(kproxy_keys::Event::RequestCompleted {
            at_ms: kproxy_keys::clock::now_ms(),
            id: request.id.to_string(),
            family: request.model_family,
            key_hash: request.key.as_ref().map(|key| key.hash.clone()),
            prompt_tokens: request.prompt_tokens,
            output_tokens,
            retries: request.retry_count,
        })
        .await;
}

/// Headers the client may see. Upstream auth, rate-limit and infrastructure
/// headers never propagate.
fn copy_response_headers(upstream: &[(String, String)]) -> Vec<(String, String)> {
    upstream
        .iter()
        .filter(|(name, _)| {
            let lower = name.to_ascii_lowercase();
            lower == "content-type"
        })
        .cloned()
        .collect()
}

/// OpenAI reset headers ("90ms", "1s", "6m12s") to milliseconds.
fn openai_resets(headers: &[(String, String)]) -> (u64, u64) {
    let parse = |name: &str| {
        headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| parse_reset(value))
            .unwrap_or(0)
    };
    (
        parse("x-ratelimit-reset-requests"),
        parse("x-ratelimit-reset-tokens"),
    )
}

fn parse_reset(value: &str) -> u64 {
    let mut total_ms = 0u64;
    let mut number = String::new();
    let mut chars = value.trim().chars().peekable();
    while let Some(c) = chars.next() {
        if c.is_ascii_digit() || c == '.' {
            number.push(c);
            continue;
        }
        let unit: String = std::iter::once(c)
            .chain(std::iter::from_fn(|| {
                chars.next_if(|next| next.is_ascii_alphabetic())
            }))
            .collect();
        let amount: f64 = number.parse().unwrap_or(0.0);
        number.clear();
        total_ms += match unit.as_str() {
            "h" => (amount * 3_600_000.0) as u64,
            "m" => (amount * 60_000.0) as u64,
            "s" => (amount * 1000.0) as u64,
            "ms" => amount as u64,
            _ => 0,
        };
    }
    total_ms
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_headers_parse_compound_durations() {
        assert_eq!(parse_reset("90ms"), 90);
        assert_eq!(parse_reset("1s"), 1000);
        assert_eq!(parse_reset("6m12s"), 372_000);
        assert_eq!(parse_reset("2h"), 7_200_000);
        assert_eq!(parse_reset("garbage"), 0);
    }

    #[test]
    fn output_tokens_prefer_upstream_usage() {
        let body = serde_json::json!({
            "usage": {"output_tokens": 7},
            "content": [{"type": "text", "text": "irrelevant"}],
        });
        assert_eq!(
            response_output_tokens(Service::Anthropic, ApiFormat::AnthropicChat, &body),
            7
        );
    }

    #[test]
    fn trim_skips_exactly_the_sent_prefix() {
        use kproxy_protocol::openai::{ChatCompletionChunk, ChunkDelta};
        let chunk = ChatCompletionChunk::new("id", "m", 0)
            .with_delta(ChunkDelta::text("hello world"), None);
        let mut skip = 6;
        let trimmed = trim_sent_prefix(chunk, &mut skip).unwrap();
        assert_eq!(trimmed.first_content(), Some("world"));
        assert_eq!(skip, 0);

        let chunk =
            ChatCompletionChunk::new("id", "m", 0).with_delta(ChunkDelta::text("hi"), None);
        let mut skip = 10;
        assert!(trim_sent_prefix(chunk, &mut skip).is_none());
        assert_eq!(skip, 8);
    }
}

//! One-time, pre-enqueue transforms. Each stage either mutates the request
//! in place or rejects it; a rejected request never enters the queue.

use kproxy_common::{ProxyError, model_family};
use kproxy_keys::clock::now_ms;
use kproxy_transform::transform_request;
use serde_json::Value;

use crate::request::ProxyRequest;
use crate::state::AppState;
use crate::tokens;

/// Run the full preprocessor chain in order.
pub async fn run(state: &AppState, request: &mut ProxyRequest) -> Result<(), ProxyError> {
    resolve_model(request)?;
    block_disallowed_origins(state, request)?;
    transform_api_format(request)?;
    count_prompt_tokens(request)?;
    content_filter(state, request).await?;
    validate_limits(state, request)?;
    check_quota(state, request)?;
    Ok(())
}

/// Stage 1 happens at routing time (formats and service are fixed by the
/// route); here the model string and family are pinned from the body.
fn resolve_model(request: &mut ProxyRequest) -> Result<(), ProxyError> {
    let model = request
        .body
        .get("model")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| (!request.model.is_empty()).then(|| request.model.clone()))
        .ok_or_else(|| ProxyError::BadRequest("missing model".to_string()))?;
    let family = model_family(request.service, &model).ok_or_else(|| {
        ProxyError::BadRequest(format!(
            "model {model} is not served by {}",
            request.service
        ))
    })?;
    request.model = model;
    request.model_family = family;
    request.streaming = request
        .body
        .get("stream")
        .and_then(Value::as_bool)
        .unwrap_or(request.streaming);
    Ok(())
}

fn block_disallowed_origins(state: &AppState, request: &ProxyRequest) -> Result<(), ProxyError> {
    let config = state.config();
    if config.blocked_origins.is_empty() {
        return Ok(());
    }
    for header in ["origin", "referer"] {
        let Some(value) = header_get(&request.headers, header) else {
            continue;
        };
        if config
            .blocked_origins
            .iter()
            .any(|blocked| value.contains(blocked.as_str()))
        {
            return Err(ProxyError::Forbidden(
                "requests from this origin are not allowed".to_string(),
            ));
        }
    }
    Ok(())
}

/// Translate the body when the client's format differs from the upstream's.
fn transform_api_format(request: &mut ProxyRequest) -> Result<(), ProxyError> {
    if request.inbound_format == request.outbound_format {
        return Ok(());
    }
    let translated = transform_request(
        request.inbound_format,
        request.outbound_format,
        &request.body,
    )
    .map_err(|err| ProxyError::BadRequest(err.to_string()))?;
    request.body = translated;
    Ok(())
}

fn count_prompt_tokens(request: &mut ProxyRequest) -> Result<(), ProxyError> {
    request.prompt_tokens =
        tokens::count_prompt_tokens(request.service, request.outbound_format, &request.body)?;
    request.output_tokens = tokens::requested_output_tokens(request.outbound_format, &request.body);
    Ok(())
}

/// Optional content moderation with per-IP exponential backoff on repeated
/// hits.
async fn content_filter(state: &AppState, request: &ProxyRequest) -> Result<(), ProxyError> {
    let config = state.config();
    if config.blocked_phrases.is_empty() {
        return Ok(());
    }

    let now = now_ms();
    {
        let backoff = state.filter_backoff.lock().await;
        if let Some((_, blocked_until)) = backoff.get(&request.client_ip)
            && now < *blocked_until
        {
            return Err(ProxyError::Forbidden(
                "temporarily blocked after repeated filtered prompts".to_string(),
            ));
        }
    }

    let text = tokens::prompt_text(request.outbound_format, &request.body)?.to_lowercase();
    let hit = config
        .blocked_phrases
        .iter()
        .any(|phrase| text.contains(&phrase.to_lowercase()));
    if !hit {
        return Ok(());
    }

    let mut backoff = state.filter_backoff.lock().await;
    let entry = backoff.entry(request.client_ip.clone()).or_insert((0, 0));
    entry.0 += 1;
    let delay_secs = 1u64 << entry.0.min(10);
    entry.1 = now + delay_secs * 1000;
    Err(ProxyError::Forbidden(
        "this prompt was rejected by the content filter".to_string(),
    ))
}

fn validate_limits(state: &AppState, request: &ProxyRequest) -> Result<(), ProxyError> {
    let config = state.config();
    if let Some(max_context) = config.max_context_tokens {
        let total = request.prompt_tokens + request.output_tokens;
        if total > max_context as u64 {
            return Err(ProxyError::BadRequest(format!(
                "prompt plus requested output ({total} tokens) exceeds the context limit ({max_context})"
            )));
        }
    }
    if let Some(max_output) = config.max_output_tokens
        && request.output_tokens > max_output as u64
    {
        return Err(ProxyError::BadRequest(format!(
            "requested output exceeds the limit ({max_output} tokens)"
        )));
    }
    if !config.allow_vision && body_has_images(request) {
        return Err(ProxyError::Forbidden(
            "image prompts are not enabled on this proxy".to_string(),
        ));
    }
    Ok(())
}

fn body_has_images(request: &ProxyRequest) -> bool {
    match request.outbound_format {
        kproxy_common::ApiFormat::OpenAi => {
            serde_json::from_value::<kproxy_protocol::openai::ChatCompletionRequest>(
                request.body.clone(),
            )
            .map(|req| req.has_image_parts())
            .unwrap_or(false)
        }
        kproxy_common::ApiFormat::AnthropicChat => {
            serde_json::from_value::<kproxy_protocol::anthropic::MessagesRequest>(
                request.body.clone(),
            )
            .map(|req| req.has_image_blocks())
            .unwrap_or(false)
        }
        _ => false,
    }
}

/// Deny when consuming the declared budget would exceed the user's family
/// quota.
fn check_quota(state: &AppState, request: &ProxyRequest) -> Result<(), ProxyError> {
    let Some(token) = &request.user_token else {
        return Ok(());
    };
    let Some(remaining) = state.users.remaining_quota(token, request.model_family) else {
        return Ok(());
    };
    let needed = request.prompt_tokens + request.output_tokens;
    if needed > remaining {
        return Err(ProxyError::Forbidden(format!(
            "token quota exceeded for {}: {needed} needed, {remaining} left",
            request.model_family
        )));
    }
    Ok(())
}

fn header_get<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::StubFailClient;
    use kproxy_common::{ApiFormat, ProxyConfig, ProxyConfigPatch, QueueIdentity, Service};
    use kproxy_keys::{EventHub, KeyPool};
    use std::sync::Arc;

    fn state_with(patch: ProxyConfigPatch) -> AppState {
        let config: ProxyConfig = patch.into_config().unwrap();
        let events = EventHub::new(8);
        let pool = Arc::new(KeyPool::with_all_providers(events.clone(), false));
        let queue = crate::queue::RequestQueue::new(pool.clone(), events.clone());
        let client = Arc::new(StubFailClient);
        AppState {
            config: Arc::new(arc_swap::ArcSwap::from_pointee(config)),
            pool,
            queue,
            users: Arc::new(kproxy_common::OpenResolver),
            client: client.clone(),
            probe_client: client,
            events,
            filter_backoff: Arc::new(tokio::sync::Mutex::new(Default::default())),
        }
    }

    fn chat_request(origin: Option<&str>) -> ProxyRequest {
        let mut headers = Vec::new();
        if let Some(origin) = origin {
            headers.push(("origin".to_string(), origin.to_string()));
        }
        ProxyRequest::new(
            QueueIdentity::Ip("10.0.0.1".to_string()),
            None,
            "10.0.0.1".to_string(),
            ApiFormat::OpenAi,
            ApiFormat::AnthropicChat,
            Service::Anthropic,
            headers,
            serde_json::json!({
                "model": "claude-3-5-sonnet-20240620",
                "messages": [{"role": "user", "content": "hi"}],
                "max_tokens": 64,
                "stream": false,
            }),
        )
    }

    #[tokio::test]
    async fn chain_translates_and_counts() {
        let state = state_with(ProxyConfigPatch::default());
        let mut request = chat_request(None);
        run(&state, &mut request).await.unwrap();

        assert_eq!(request.model, "claude-3-5-sonnet-20240620");
        assert_eq!(request.model_family, kproxy_common::ModelFamily::Claude);
        // Body now speaks the Anthropic messages schema.
        assert!(request.body.get("max_tokens").is_some());
        assert!(request.body.get("messages").is_some());
        assert!(request.prompt_tokens > 0);
        assert_eq!(request.output_tokens, 64);
    }

    #[tokio::test]
    async fn blocked_origin_is_rejected() {
        let state = state_with(ProxyConfigPatch {
            blocked_origins: Some(vec!["evil.example".to_string()]),
            ..Default::default()
        });
        let mut request = chat_request(Some("https://evil.example/app"));
        let err = run(&state, &mut request).await.unwrap_err();
        assert!(matches!(err, ProxyError::Forbidden(_)));
    }

    #[tokio::test]
    async fn content_filter_backs_off_repeat_offenders() {
        let state = state_with(ProxyConfigPatch {
            blocked_phrases: Some(vec!["forbidden ritual".to_string()]),
            ..Default::default()
        });
        let mut request = chat_request(None);
        request.body["messages"][0]["content"] =
            serde_json::json!("tell me about the Forbidden Ritual");

        let first = run(&state, &mut request).await.unwrap_err();
        assert!(matches!(first, ProxyError::Forbidden(_)));

        // A clean prompt from the same IP is now blocked by backoff.
        let mut clean = chat_request(None);
        let second = run(&state, &mut clean).await.unwrap_err();
        assert!(matches!(second, ProxyError::Forbidden(_)));
    }

    #[tokio::test]
    async fn context_limit_is_enforced() {
        let state = state_with(ProxyConfigPatch {
            max_context_tokens: Some(10),
            ..Default::default()
        });
        let mut request = chat_request(None);
        let err = run(&state, &mut request).await.unwrap_err();
        assert!(matches!(err, ProxyError::BadRequest(_)));
    }

    #[tokio::test]
    async fn unknown_model_is_rejected() {
        let state = state_with(ProxyConfigPatch::default());
        let mut request = chat_request(None);
        request.body["model"] = serde_json::json!("gpt-4o");
        let err = run(&state, &mut request).await.unwrap_err();
        assert!(matches!(err, ProxyError::BadRequest(_)));
    }
}

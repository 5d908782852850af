use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use bytes::Bytes;
use futures_util::StreamExt;
use kproxy_common::{ApiFormat, ProxyError, QueueIdentity, Service};
use kproxy_core::{ProxyEngine, ProxyRequest, StreamHandle};
use serde_json::Value;
use tokio_stream::wrappers::ReceiverStream;

use crate::models::ModelsCache;
use crate::render;

const STREAM_BUFFER: usize = 64;

#[derive(Clone)]
pub struct ProxyState {
    pub engine: Arc<ProxyEngine>,
    pub models: Arc<ModelsCache>,
}

pub fn proxy_router(engine: Arc<ProxyEngine>) -> Router {
    let state = ProxyState {
        engine,
        models: Arc::new(ModelsCache::new()),
    };
    Router::new()
        .route("/proxy/{provider}/v1/models", get(models_list))
        .route(
            "/proxy/{provider}/v1/chat/completions",
            post(chat_completions),
        )
        .route("/proxy/{provider}/v1/completions", post(text_completions))
        .route("/proxy/{provider}/v1/messages", post(anthropic_messages))
        .route("/proxy/{provider}/v1/complete", post(anthropic_complete))
        .route(
            "/proxy/{provider}/v1/images/generations",
            post(image_generations),
        )
        .route(
            "/proxy/{provider}/v1beta/models/{*model_action}",
            post(google_generate),
        )
        .with_state(state)
}

fn parse_provider(provider: &str) -> Result<Service, ProxyError> {
    // Route aliases kept for clients configured against other proxies.
    let normalized = match provider {
        "claude" => "anthropic",
        "aws-claude" | "bedrock" => "aws",
        "gcp-claude" | "vertex" => "gcp",
        "azure-openai" => "azure",
        "gemini" => "google-ai",
        "mistral-ai" => "mistral",
        other => other,
    };
    Service::parse(normalized)
        .ok_or_else(|| ProxyError::BadRequest(format!("unknown provider: {provider}")))
}

/// The upstream format each service is spoken to in, given the client's
/// format and the request body (Bedrock hosts both Claude and Mistral
/// shapes; image requests stay image requests).
fn outbound_format(service: Service, inbound: ApiFormat, body: &Value) -> ApiFormat {
    if inbound == ApiFormat::OpenAiImage {
        return ApiFormat::OpenAiImage;
    }
    match service {
        Service::OpenAi | Service::Azure => ApiFormat::OpenAi,
        Service::Anthropic | Service::Gcp => ApiFormat::AnthropicChat,
        Service::Aws => {
            let model = body.get("model").and_then(Value::as_str).unwrap_or("");
            if model.contains("mistral") {
                ApiFormat::MistralText
            } else {
                ApiFormat::AnthropicChat
            }
        }
        Service::GoogleAi => ApiFormat::GoogleAi,
        Service::Mistral => ApiFormat::Mistral,
    }
}

fn client_ip(headers: &HeaderMap, addr: &SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|value| value.trim().to_string())
        .unwrap_or_else(|| addr.ip().to_string())
}

/// Queue identity: user token, else the alternate identity header, else the
/// client IP.
fn resolve_identity(
    headers: &HeaderMap,
    ip: &str,
) -> (QueueIdentity, Option<String>) {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .or_else(|| {
            headers
                .get("x-api-key")
                .and_then(|value| value.to_str().ok())
        })
        .map(str::trim)
        .filter(|value| !value.is_empty());
    if let Some(token) = token {
        return (
            QueueIdentity::Token(token.to_string()),
            Some(token.to_string()),
        );
    }
    if let Some(alternate) = headers
        .get("x-queue-identity")
        .and_then(|value| value.to_str().ok())
    {
        return (QueueIdentity::Header(alternate.to_string()), None);
    }
    (QueueIdentity::Ip(ip.to_string()), None)
}

fn headers_to_vec(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}

async fn models_list(
    State(state): State<ProxyState>,
    Path(provider): Path<String>,
) -> Response {
    let service = match parse_provider(&provider) {
        Ok(service) => service,
        Err(error) => return render::error_response(ApiFormat::OpenAi, &error),
    };
    let body = state
        .models
        .list(&state.engine.state().pool, service)
        .await;
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

async fn chat_completions(
    state: State<ProxyState>,
    path: Path<String>,
    connect: ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    completion_route(state, path, connect, headers, body, ApiFormat::OpenAi).await
}

async fn text_completions(
    state: State<ProxyState>,
    path: Path<String>,
    connect: ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    completion_route(state, path, connect, headers, body, ApiFormat::OpenAiText).await
}

async fn anthropic_messages(
    state: State<ProxyState>,
    path: Path<String>,
    connect: ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    completion_route(state, path, connect, headers, body, ApiFormat::AnthropicChat).await
}

async fn anthropic_complete(
    state: State<ProxyState>,
    path: Path<String>,
    connect: ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    completion_route(state, path, connect, headers, body, ApiFormat::AnthropicText).await
}

async fn image_generations(
    state: State<ProxyState>,
    path: Path<String>,
    connect: ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    completion_route(state, path, connect, headers, body, ApiFormat::OpenAiImage).await
}

async fn google_generate(
    State(state): State<ProxyState>,
    Path((provider, model_action)): Path<(String, String)>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let service = match parse_provider(&provider) {
        Ok(service) => service,
        Err(error) => return render::error_response(ApiFormat::GoogleAi, &error),
    };
    if service != Service::GoogleAi {
        return render::error_response(
            ApiFormat::GoogleAi,
            &ProxyError::BadRequest(format!(
                "the Google AI request shape is only served by the google-ai provider, not {service}"
            )),
        );
    }
    let Some((model, action)) = model_action.rsplit_once(':') else {
        return render::error_response(
            ApiFormat::GoogleAi,
            &ProxyError::BadRequest("expected models/{model}:generateContent".to_string()),
        );
    };
    let mut parsed: Value = match serde_json::from_slice(&body) {
        Ok(parsed) => parsed,
        Err(err) => {
            return render::error_response(
                ApiFormat::GoogleAi,
                &ProxyError::BadRequest(format!("request body: {err}")),
            );
        }
    };
    // Google puts the model in the path; pin it into the body for the
    // pipeline and honor the streaming verb.
    parsed["model"] = Value::String(model.to_string());
    let streaming = action == "streamGenerateContent";
    parsed["stream"] = Value::Bool(streaming);

    run_pipeline(
        state,
        service,
        ApiFormat::GoogleAi,
        parsed,
        streaming,
        headers,
        addr,
    )
    .await
}

async fn completion_route(
    State(state): State<ProxyState>,
    Path(provider): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
    inbound: ApiFormat,
) -> Response {
    let service = match parse_provider(&provider) {
        Ok(service) => service,
        Err(error) => return render::error_response(inbound, &error),
    };
    let parsed: Value = match serde_json::from_slice(&body) {
        Ok(parsed) => parsed,
        Err(err) => {
            return render::error_response(
                inbound,
                &ProxyError::BadRequest(format!("request body: {err}")),
            );
        }
    };
    let streaming = parsed
        .get("stream")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    run_pipeline(state, service, inbound, parsed, streaming, headers, addr).await
}

#[allow(clippy::too_many_arguments)]
async fn run_pipeline(
    state: ProxyState,
    service: Service,
    inbound: ApiFormat,
    body: Value,
    streaming: bool,
    headers: HeaderMap,
    addr: SocketAddr,
) -> Response {
    let ip = client_ip(&headers, &addr);
    let (identity, user_token) = resolve_identity(&headers, &ip);
    let outbound = outbound_format(service, inbound, &body);

    let mut body = body;
    if inbound == ApiFormat::OpenAiImage && body.get("model").is_none() {
        body["model"] = Value::String("dall-e-3".to_string());
    }

    let mut request = ProxyRequest::new(
        identity,
        user_token,
        ip,
        inbound,
        outbound,
        service,
        headers_to_vec(&headers),
        body,
    );
    request.streaming = streaming;

    if streaming {
        let (handle, rx) = StreamHandle::new(STREAM_BUFFER);
        let engine = state.engine.clone();
        let error_handle = handle.clone();
        tokio::spawn(async move {
            if let Err(error) = engine.handle(request, Some(handle)).await
                && !matches!(error, ProxyError::ClientAborted)
            {
                tracing::info!(%error, "streaming request failed; spoofing error event");
                render::stream_error(&error_handle, inbound, &error).await;
            }
        });

        let stream =
            ReceiverStream::new(rx).map(|chunk| Ok::<_, Infallible>(chunk));
        let body = Body::from_stream(stream);
        return Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache")
            .header(header::CONNECTION, "keep-alive")
            .body(body)
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
    }

    match state.engine.handle(request, None).await {
        Ok(completed) => {
            let mut builder = Response::builder().status(completed.status);
            let mut has_content_type = false;
            for (name, value) in &completed.headers {
                if name.eq_ignore_ascii_case("content-type") {
                    has_content_type = true;
                }
                builder = builder.header(name, value);
            }
            if !has_content_type {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
            }
            builder
                .body(Body::from(completed.body.to_string()))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        Err(error) => render::error_response(inbound, &error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_aliases_resolve() {
        assert_eq!(parse_provider("openai").unwrap(), Service::OpenAi);
        assert_eq!(parse_provider("claude").unwrap(), Service::Anthropic);
        assert_eq!(parse_provider("bedrock").unwrap(), Service::Aws);
        assert_eq!(parse_provider("gemini").unwrap(), Service::GoogleAi);
        assert!(parse_provider("acme").is_err());
    }

    #[test]
    fn bedrock_outbound_format_follows_model() {
        let claude = serde_json::json!({"model": "anthropic.claude-3-5-sonnet-20240620-v1:0"});
        assert_eq!(
            outbound_format(Service::Aws, ApiFormat::OpenAi, &claude),
            ApiFormat::AnthropicChat
        );
        let mistral = serde_json::json!({"model": "mistral.mistral-large-2402-v1:0"});
        assert_eq!(
            outbound_format(Service::Aws, ApiFormat::OpenAi, &mistral),
            ApiFormat::MistralText
        );
        let image = serde_json::json!({"prompt": "a fox"});
        assert_eq!(
            outbound_format(Service::OpenAi, ApiFormat::OpenAiImage, &image),
            ApiFormat::OpenAiImage
        );
    }

    #[test]
    fn identity_prefers_token_over_ip() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            "Bearer user-token".parse().unwrap(),
        );
        let (identity, token) = resolve_identity(&headers, "1.2.3.4");
        assert_eq!(identity, QueueIdentity::Token("user-token".to_string()));
        assert_eq!(token.as_deref(), Some("user-token"));

        let (identity, token) = resolve_identity(&HeaderMap::new(), "1.2.3.4");
        assert_eq!(identity, QueueIdentity::Ip("1.2.3.4".to_string()));
        assert!(token.is_none());
    }
}

//! Provider auth mutators: key selection plus whatever credential wiring the
//! provider wants (bearer headers, query keys, SigV4 envelopes, OAuth).

use bytes::Bytes;
use kproxy_common::{ApiFormat, ProxyError, Service};
use kproxy_keys::key::KeyExtra;
use kproxy_keys::{gcp_oauth, sigv4};
use serde_json::Value;

use crate::manager::RequestManager;
use crate::request::SignedRequest;
use crate::state::AppState;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const VERTEX_ANTHROPIC_VERSION: &str = "vertex-2023-10-16";
const AZURE_API_VERSION: &str = "2024-02-01";
/// Outputs above this need the long-output beta header on Anthropic.
const LONG_OUTPUT_THRESHOLD: u64 = 4096;

pub async fn apply(state: &AppState, manager: &mut RequestManager) -> Result<(), ProxyError> {
    let service = manager.request().service;
    let model = manager.request().model.clone();
    let key = state.pool.get_for(service, &model).await?;
    manager.assign_key(key.clone());

    match service {
        Service::OpenAi => {
            manager.set_header("authorization", format!("Bearer {}", key.secret));
            if let KeyExtra::OpenAi {
                organization_id: Some(org),
                ..
            } = &key.extra
            {
                manager.set_header("openai-organization", org.clone());
            }
            manager.set_path(openai_path(manager.request().outbound_format));
        }
        Service::Anthropic => {
            manager.set_header("x-api-key", key.secret.clone());
            manager.set_header("anthropic-version", ANTHROPIC_VERSION);
            if manager.request().output_tokens > LONG_OUTPUT_THRESHOLD {
                manager.set_header("anthropic-beta", "max-tokens-3-5-sonnet-2024-07-15");
            }
            let path = match manager.request().outbound_format {
                ApiFormat::AnthropicText => {
                    apply_preamble_if_required(manager, &key.extra);
                    "/v1/complete"
                }
                _ => "/v1/messages",
            };
            manager.set_path(path);
        }
        Service::Mistral => {
            manager.set_header("authorization", format!("Bearer {}", key.secret));
            manager.set_path("/v1/chat/completions");
        }
        Service::GoogleAi => {
            let verb = if manager.request().streaming {
                "streamGenerateContent"
            } else {
                "generateContent"
            };
            let stream_suffix = if manager.request().streaming {
                "&alt=sse"
            } else {
                ""
            };
            manager.set_path(format!(
                "/v1beta/models/{model}:{verb}?key={}{stream_suffix}",
                urlencoding::encode(&key.secret)
            ));
        }
        Service::Azure => {
            let KeyExtra::Azure {
                deployment_id,
                api_key,
                ..
            } = &key.extra
            else {
                return Err(ProxyError::UpstreamFatal(
                    "azure key missing deployment".to_string(),
                ));
            };
            manager.set_header("api-key", api_key.clone());
            let endpoint = match manager.request().outbound_format {
                ApiFormat::OpenAiImage => "images/generations",
                _ => "chat/completions",
            };
            manager.set_path(format!(
                "/openai/deployments/{deployment_id}/{endpoint}?api-version={AZURE_API_VERSION}"
            ));
        }
        Service::Aws => sign_aws(manager, &key.extra)?,
        Service::Gcp => sign_gcp(state, manager, &key).await?,
    }
    Ok(())
}

fn openai_path(format: ApiFormat) -> &'static str {
    match format {
        ApiFormat::OpenAiText => "/v1/completions",
        ApiFormat::OpenAiImage => "/v1/images/generations",
        _ => "/v1/chat/completions",
    }
}

/// Keys flagged `requires_preamble` only accept prompts opening with a human
/// turn on the legacy text API.
fn apply_preamble_if_required(manager: &mut RequestManager, extra: &KeyExtra) {
    let KeyExtra::Anthropic {
        requires_preamble: true,
        ..
    } = extra
    else {
        return;
    };
    let Some(prompt) = manager.request().body.get("prompt").and_then(Value::as_str) else {
        return;
    };
    if prompt.trim_start().starts_with("Human:") || prompt.starts_with("\n\nHuman:") {
        return;
    }
    let mut body = manager.request().body.clone();
    body["prompt"] = Value::String(format!("\n\nHuman:{prompt}"));
    manager.replace_body(body);
}

fn sign_aws(manager: &mut RequestManager, extra: &KeyExtra) -> Result<(), ProxyError> {
    let KeyExtra::Aws {
        access_key_id,
        secret_access_key,
        region,
        ..
    } = extra
    else {
        return Err(ProxyError::UpstreamFatal(
            "aws key missing credentials".to_string(),
        ));
    };

    let request = manager.request();
    let verb = if request.streaming {
        "invoke-with-response-stream"
    } else {
        "invoke"
    };
    let host = format!("bedrock-runtime.{region}.amazonaws.com");
    let path = format!("/model/{}/{verb}", urlencoding::encode(&request.model));
    let payload = serde_json::to_vec(&request.body)
        .map_err(|err| ProxyError::UpstreamFatal(format!("body serialize: {err}")))?;

    let extra_headers = vec![
        ("content-type".to_string(), "application/json".to_string()),
        ("accept".to_string(), "application/json".to_string()),
    ];
    let signed = sigv4::sign(&sigv4::SigningParams {
        access_key_id,
        secret_access_key,
        region,
        service: "bedrock",
        method: "POST",
        host: &host,
        path: &path,
        query: "",
        headers: &extra_headers,
        payload: &payload,
        timestamp: time::OffsetDateTime::now_utc(),
    })
    .map_err(|err| ProxyError::UpstreamFatal(err.to_string()))?;

    manager.set_signed_request(SignedRequest {
        method: "POST",
        hostname: host,
        path,
        headers: signed.headers,
        body: Bytes::from(payload),
    });
    Ok(())
}

async fn sign_gcp(
    state: &AppState,
    manager: &mut RequestManager,
    key: &kproxy_keys::Key,
) -> Result<(), ProxyError> {
    let KeyExtra::Gcp {
        project_id, region, ..
    } = &key.extra
    else {
        return Err(ProxyError::UpstreamFatal(
            "gcp key missing service account".to_string(),
        ));
    };
    let provider = state
        .pool
        .provider(Service::Gcp)
        .ok_or_else(|| ProxyError::UpstreamFatal("gcp provider not registered".to_string()))?;
    // Suspends while the cached OAuth token is validated or refreshed.
    let token =
        gcp_oauth::ensure_access_token(state.probe_client.as_ref(), provider.as_ref(), key)
            .await?;

    let request = manager.request();
    let verb = if request.streaming {
        "streamRawPredict"
    } else {
        "rawPredict"
    };
    let host = format!("{region}-aiplatform.googleapis.com");
    let path = format!(
        "/v1/projects/{project_id}/locations/{region}/publishers/anthropic/models/{}:{verb}",
        request.model
    );

    // Vertex puts the model in the URL and versions the payload itself.
    let mut body = request.body.clone();
    if let Some(object) = body.as_object_mut() {
        object.remove("model");
        object.insert(
            "anthropic_version".to_string(),
            Value::String(VERTEX_ANTHROPIC_VERSION.to_string()),
        );
    }
    let payload = serde_json::to_vec(&body)
        .map_err(|err| ProxyError::UpstreamFatal(format!("body serialize: {err}")))?;
    manager.replace_body(body);

    manager.set_signed_request(SignedRequest {
        method: "POST",
        hostname: host,
        path,
        headers: vec![
            ("authorization".to_string(), format!("Bearer {token}")),
            ("content-type".to_string(), "application/json".to_string()),
        ],
        body: Bytes::from(payload),
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::StubFailClient;
    use crate::queue::RequestQueue;
    use crate::request::ProxyRequest;
    use kproxy_common::{OpenResolver, ProxyConfigPatch, QueueIdentity};
    use kproxy_keys::key::Key;
    use kproxy_keys::{EventHub, KeyPool};
    use std::sync::Arc;

    async fn state_with_key(service: Service, secret: &str) -> AppState {
        let events = EventHub::new(8);
        let pool = Arc::new(KeyPool::with_all_providers(events.clone(), false));
        pool.provider(service)
            .unwrap()
            .insert_keys(vec![Key::parse(service, secret).unwrap()])
            .await;
        let queue = RequestQueue::new(pool.clone(), events.clone());
        let client = Arc::new(StubFailClient);
        AppState {
            config: Arc::new(arc_swap::ArcSwap::from_pointee(
                ProxyConfigPatch::default().into_config().unwrap(),
            )),
            pool,
            queue,
            users: Arc::new(OpenResolver),
            client: client.clone(),
            probe_client: client,
            events,
            filter_backoff: Arc::new(tokio::sync::Mutex::new(Default::default())),
        }
    }

    fn request_for(service: Service, format: ApiFormat, model: &str) -> ProxyRequest {
        let mut request = ProxyRequest::new(
            QueueIdentity::Ip("1.1.1.1".to_string()),
            None,
            "1.1.1.1".to_string(),
            format,
            format,
            service,
            Vec::new(),
            serde_json::json!({
                "model": model,
                "messages": [{"role": "user", "content": "hi"}],
                "max_tokens": 32,
            }),
        );
        request.model = model.to_string();
        request.model_family = kproxy_common::model_family(service, model).unwrap();
        request
    }

    #[tokio::test]
    async fn anthropic_auth_sets_key_and_version_headers() {
        let state = state_with_key(Service::Anthropic, "sk-ant-secret").await;
        let request = request_for(
            Service::Anthropic,
            ApiFormat::AnthropicChat,
            "claude-3-5-sonnet-20240620",
        );
        let mut manager = RequestManager::new(request);

        apply(&state, &mut manager).await.unwrap();

        let headers = &manager.request().headers;
        assert!(headers.iter().any(|(n, v)| n == "x-api-key" && v == "sk-ant-secret"));
        assert!(
            headers
                .iter()
                .any(|(n, v)| n == "anthropic-version" && v == ANTHROPIC_VERSION)
        );
        assert_eq!(manager.request().path, "/v1/messages");
        assert!(manager.request().key.is_some());

        // Revert leaves only the key assignment behind.
        manager.revert();
        assert!(manager.request().headers.is_empty());
        assert!(manager.request().path.is_empty());
        assert!(manager.request().key.is_some());
    }

    #[tokio::test]
    async fn aws_auth_records_signed_envelope() {
        let state = state_with_key(Service::Aws, "AKIAEXAMPLE:secretkey:us-east-1").await;
        let request = request_for(
            Service::Aws,
            ApiFormat::AnthropicChat,
            "anthropic.claude-3-5-sonnet-20240620-v1:0",
        );
        let mut manager = RequestManager::new(request);

        apply(&state, &mut manager).await.unwrap();

        let signed = manager.request().signed_request.as_ref().unwrap();
        assert_eq!(signed.hostname, "bedrock-runtime.us-east-1.amazonaws.com");
        assert!(signed.path.ends_with("/invoke"));
        assert!(
            signed
                .headers
                .iter()
                .any(|(name, value)| name == "authorization"
                    && value.starts_with("AWS4-HMAC-SHA256"))
        );

        manager.revert();
        assert!(manager.request().signed_request.is_none());
    }

    #[tokio::test]
    async fn no_key_available_surfaces() {
        let state = state_with_key(Service::Anthropic, "sk-ant-secret").await;
        // Disable the only key first.
        let hash = state
            .pool
            .provider(Service::Anthropic)
            .unwrap()
            .list()
            .await[0]
            .hash
            .clone();
        state.pool.disable(Service::Anthropic, &hash, false).await;

        let request = request_for(
            Service::Anthropic,
            ApiFormat::AnthropicChat,
            "claude-3-5-sonnet-20240620",
        );
        let mut manager = RequestManager::new(request);
        let err = apply(&state, &mut manager).await.unwrap_err();
        assert!(matches!(err, ProxyError::NoKeyAvailable(_)));
    }
}

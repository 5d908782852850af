//! Per-attempt, reversible transforms. Everything here goes through the
//! request manager so a retryable failure can unwind to the
//! transformed-but-unauthenticated state.

mod auth;

use kproxy_common::ProxyError;

use crate::manager::RequestManager;
use crate::state::AppState;

/// Headers that must never reach an upstream: client identity, CORS/fetch
/// metadata, and infrastructure headers added by CDNs and load balancers.
const STRIPPED_HEADERS: [&str; 14] = [
    "origin",
    "referer",
    "cookie",
    "host",
    "connection",
    "content-length",
    "authorization",
    "x-api-key",
    "api-key",
    "x-forwarded-for",
    "x-forwarded-host",
    "x-forwarded-proto",
    "x-real-ip",
    "cf-connecting-ip",
];

/// Run the full mutator chain: strip → provider auth → body finalizer.
pub async fn apply(state: &AppState, manager: &mut RequestManager) -> Result<(), ProxyError> {
    strip_headers(manager);
    auth::apply(state, manager).await?;
    finalize_body(manager)?;
    Ok(())
}

fn strip_headers(manager: &mut RequestManager) {
    for name in STRIPPED_HEADERS {
        manager.remove_header(name);
    }
    let prefixed: Vec<String> = manager
        .request()
        .headers
        .iter()
        .map(|(name, _)| name.clone())
        .filter(|name| {
            let lower = name.to_ascii_lowercase();
            lower.starts_with("sec-") || lower.starts_with("cf-") || lower.starts_with("cdn-")
        })
        .collect();
    for name in prefixed {
        manager.remove_header(&name);
    }
}

/// Serialize the (possibly signed) body and pin the content headers. For
/// signed requests the envelope already fixed the bytes; the content length
/// recorded here must agree with it.
fn finalize_body(manager: &mut RequestManager) -> Result<(), ProxyError> {
    let length = match &manager.request().signed_request {
        Some(signed) => signed.body.len(),
        None => {
            let bytes = serde_json::to_vec(&manager.request().body)
                .map_err(|err| ProxyError::UpstreamFatal(format!("body serialize: {err}")))?;
            bytes.len()
        }
    };
    manager.set_header("content-type", "application/json");
    manager.set_header("content-length", length.to_string());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::ProxyRequest;
    use kproxy_common::{ApiFormat, QueueIdentity, Service};

    #[test]
    fn strip_removes_identity_and_fetch_headers() {
        let request = ProxyRequest::new(
            QueueIdentity::Ip("1.2.3.4".to_string()),
            None,
            "1.2.3.4".to_string(),
            ApiFormat::OpenAi,
            ApiFormat::OpenAi,
            Service::OpenAi,
            vec![
                ("Origin".to_string(), "https://site".to_string()),
                ("Sec-Fetch-Mode".to_string(), "cors".to_string()),
                ("X-Forwarded-For".to_string(), "9.9.9.9".to_string()),
                ("Accept".to_string(), "application/json".to_string()),
            ],
            serde_json::json!({}),
        );
        let mut manager = RequestManager::new(request);
        strip_headers(&mut manager);

        let names: Vec<&str> = manager
            .request()
            .headers
            .iter()
            .map(|(name, _)| name.as_str())
            .collect();
        assert_eq!(names, vec!["Accept"]);

        // And the strip is reversible like any other mutation.
        manager.revert();
        assert_eq!(manager.request().headers.len(), 4);
    }
}

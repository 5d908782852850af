//! Builds the concrete upstream HTTP request from a mutated proxy request.

use bytes::Bytes;
use kproxy_common::{ProxyError, Service};

use crate::client::UpstreamRequest;
use crate::request::ProxyRequest;

fn base_url(service: Service) -> Option<&'static str> {
    match service {
        Service::OpenAi => Some("https://api.openai.com"),
        Service::Anthropic => Some("https://api.anthropic.com"),
        Service::GoogleAi => Some("https://generativelanguage.googleapis.com"),
        Service::Mistral => Some("https://api.mistral.ai"),
        // Azure hosts depend on the key; AWS and GCP go through the signed
        // envelope.
        Service::Azure | Service::Aws | Service::Gcp => None,
    }
}

pub fn build(request: &ProxyRequest) -> Result<UpstreamRequest, ProxyError> {
    if let Some(signed) = &request.signed_request {
        return Ok(UpstreamRequest {
            method: signed.method,
            url: format!("https://{}{}", signed.hostname, signed.path),
            headers: signed.headers.clone(),
            body: Some(signed.body.clone()),
            stream: request.streaming,
        });
    }

    let host = match request.service {
        Service::Azure => {
            let key = request.key.as_ref().ok_or_else(|| {
                ProxyError::UpstreamFatal("dispatch without an assigned key".to_string())
            })?;
            match &key.extra {
                kproxy_keys::KeyExtra::Azure { resource_name, .. } => {
                    format!("https://{resource_name}.openai.azure.com")
                }
                _ => {
                    return Err(ProxyError::UpstreamFatal(
                        "azure dispatch with a non-azure key".to_string(),
                    ));
                }
            }
        }
        service => base_url(service)
            .ok_or_else(|| {
                ProxyError::UpstreamFatal(format!("{service} requires a signed request"))
            })?
            .to_string(),
    };

    let body = serde_json::to_vec(&request.body)
        .map_err(|err| ProxyError::UpstreamFatal(format!("body serialize: {err}")))?;
    Ok(UpstreamRequest {
        method: "POST",
        url: format!("{host}{}", request.path),
        headers: request.headers.clone(),
        body: Some(Bytes::from(body)),
        stream: request.streaming,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::SignedRequest;
    use kproxy_common::{ApiFormat, QueueIdentity};

    fn request(service: Service) -> ProxyRequest {
        ProxyRequest::new(
            QueueIdentity::Ip("1.1.1.1".to_string()),
            None,
            "1.1.1.1".to_string(),
            ApiFormat::OpenAi,
            ApiFormat::OpenAi,
            service,
            vec![("authorization".to_string(), "Bearer sk".to_string())],
            serde_json::json!({"model": "gpt-4o"}),
        )
    }

    #[test]
    fn plain_dispatch_concatenates_base_and_path() {
        let mut req = request(Service::OpenAi);
        req.path = "/v1/chat/completions".to_string();
        let upstream = build(&req).unwrap();
        assert_eq!(upstream.url, "https://api.openai.com/v1/chat/completions");
        assert_eq!(upstream.method, "POST");
    }

    #[test]
    fn signed_envelope_wins_over_path() {
        let mut req = request(Service::Aws);
        req.signed_request = Some(SignedRequest {
            method: "POST",
            hostname: "bedrock-runtime.us-east-1.amazonaws.com".to_string(),
            path: "/model/m/invoke".to_string(),
            headers: vec![("authorization".to_string(), "AWS4-...".to_string())],
            body: Bytes::from_static(b"{}"),
        });
        let upstream = build(&req).unwrap();
        assert_eq!(
            upstream.url,
            "https://bedrock-runtime.us-east-1.amazonaws.com/model/m/invoke"
        );
        assert_eq!(upstream.headers.len(), 1);
    }

    #[test]
    fn aws_without_signature_is_an_error() {
        let req = request(Service::Aws);
        assert!(build(&req).is_err());
    }
}

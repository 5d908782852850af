//! Uniform upstream error classification (§ response handling).
//!
//! One table for every provider; provider-specific error codes are sniffed
//! out of the response body and the `x-amzn-errortype` header.

use kproxy_common::Service;
use serde_json::Value;

/// What the response handler should do with an upstream result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Success,
    /// Upstream rejected the prompt itself; surface as a client 400.
    BadPrompt(String),
    /// Transient for the key: mark rate-limited, revert and re-enqueue.
    RetryRateLimited,
    /// Anthropic/AWS "prompt must start with" behaviour: flag and retry.
    RetryPreamble,
    /// Key cannot take image input: flag and retry on another key.
    RetryVision,
    /// Credential invalid or revoked: disable + revoke, surface transient.
    KeyRevoked,
    /// Key quota/billing exhausted: disable (not revoked), surface.
    KeyQuotaExhausted,
    /// Not retryable, not key-fatal: surface to the client.
    Surface { status: u16, message: String },
}

pub fn classify(
    service: Service,
    status: u16,
    headers: &[(String, String)],
    body: &Value,
) -> Verdict {
    if (200..300).contains(&status) {
        return Verdict::Success;
    }
    let text = error_text(body);
    let code = error_code(body);
    let amzn_type = header_get(headers, "x-amzn-errortype").unwrap_or("");

    match status {
        400 => classify_400(service, &text, &code, amzn_type),
        401 => Verdict::KeyRevoked,
        403 => {
            if amzn_type.contains("Throttling") {
                return Verdict::RetryRateLimited;
            }
            if text.contains("access to the model with the specified model ID")
                || text.contains("model is not accessible")
            {
                return Verdict::Surface {
                    status,
                    message: text,
                };
            }
            Verdict::KeyRevoked
        }
        404 => Verdict::Surface {
            status,
            message: if text.is_empty() {
                "the requested model was not found for the assigned key".to_string()
            } else {
                text
            },
        },
        429 => classify_429(&text, &code),
        503 => Verdict::Surface {
            status,
            message: "upstream is overloaded; try again shortly".to_string(),
        },
        _ => Verdict::Surface {
            status,
            message: text,
        },
    }
}

fn classify_400(service: Service, text: &str, code: &str, amzn_type: &str) -> Verdict {
    if code.contains("content_policy") || code.contains("content_filter") {
        return Verdict::BadPrompt(text.to_string());
    }
    if code.contains("billing") || text.contains("billing hard limit") {
        return Verdict::KeyQuotaExhausted;
    }
    if matches!(service, Service::Anthropic | Service::Aws | Service::Gcp)
        && (text.contains("prompt must start with") || text.contains("must begin with"))
    {
        return Verdict::RetryPreamble;
    }
    if text.contains("image") && (text.contains("not allowed") || text.contains("not supported")) {
        return Verdict::RetryVision;
    }
    if amzn_type.contains("Validation") && text.contains("max_tokens") {
        // Malformed body the proxy produced; surface it rather than retry.
        return Verdict::Surface {
            status: 400,
            message: text.to_string(),
        };
    }
    Verdict::Surface {
        status: 400,
        message: text.to_string(),
    }
}

fn classify_429(text: &str, code: &str) -> Verdict {
    if code.contains("insufficient_quota")
        || text.contains("exceeded your current quota")
        || text.contains("credit balance")
    {
        return Verdict::KeyQuotaExhausted;
    }
    if text.contains("daily") || code.contains("daily") {
        return Verdict::Surface {
            status: 429,
            message: text.to_string(),
        };
    }
    Verdict::RetryRateLimited
}

/// Classify an in-band streaming error event by its provider error type.
pub fn classify_stream_error(error_type: &str, message: &str) -> Verdict {
    match error_type {
        "overloaded_error" | "rate_limit_error" => Verdict::RetryRateLimited,
        kind if kind.contains("throttling") || kind.contains("Throttling") => {
            Verdict::RetryRateLimited
        }
        "authentication_error" | "permission_error" => Verdict::KeyRevoked,
        _ => Verdict::Surface {
            status: 502,
            message: format!("{error_type}: {message}"),
        },
    }
}

fn error_text(body: &Value) -> String {
    for pointer in [
        "/error/message",
        "/message",
        "/error",
        "/detail",
    ] {
        if let Some(text) = body.pointer(pointer).and_then(Value::as_str) {
            return text.to_string();
        }
    }
    body.as_str().map(str::to_string).unwrap_or_default()
}

fn error_code(body: &Value) -> String {
    for pointer in ["/error/code", "/error/type", "/code", "/type"] {
        if let Some(code) = body.pointer(pointer).and_then(Value::as_str) {
            return code.to_string();
        }
    }
    String::new()
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

    #[test]
    fn rate_limit_is_retryable() {
        let body = serde_json::json!({"error": {"message": "slow down", "type": "rate_limit_error"}});
        assert_eq!(
            classify(Service::Anthropic, 429, &[], &body),
            Verdict::RetryRateLimited
        );
    }

    #[test]
    fn quota_exhaustion_is_terminal_for_the_key() {
        let body = serde_json::json!({
            "error": {"message": "You exceeded your current quota", "code": "insufficient_quota"}
        });
        assert_eq!(
            classify(Service::OpenAi, 429, &[], &body),
            Verdict::KeyQuotaExhausted
        );
    }

    #[test]
    fn unauthorized_revokes() {
        let body = serde_json::json!({"error": {"message": "Incorrect API key provided"}});
        assert_eq!(classify(Service::OpenAi, 401, &[], &body), Verdict::KeyRevoked);
    }

    #[test]
    fn aws_throttling_header_is_retryable() {
        let headers = vec![(
            "x-amzn-errortype".to_string(),
            "ThrottlingException:http://internal".to_string(),
        )];
        let body = serde_json::json!({"message": "Too many requests"});
        assert_eq!(
            classify(Service::Aws, 403, &headers, &body),
            Verdict::RetryRateLimited
        );
    }

    #[test]
    fn model_access_403_surfaces_without_disabling() {
        let body = serde_json::json!({
            "message": "You don't have access to the model with the specified model ID."
        });
        assert!(matches!(
            classify(Service::Aws, 403, &[], &body),
            Verdict::Surface { status: 403, .. }
        ));
    }

    #[test]
    fn preamble_complaint_triggers_retry() {
        let body = serde_json::json!({
            "error": {"message": "prompt must start with \"\\n\\nHuman:\" turn"}
        });
        assert_eq!(
            classify(Service::Anthropic, 400, &[], &body),
            Verdict::RetryPreamble
        );
    }

    #[test]
    fn content_filter_rejection_is_client_fault() {
        let body = serde_json::json!({
            "error": {"message": "flagged", "code": "content_policy_violation"}
        });
        assert!(matches!(
            classify(Service::OpenAi, 400, &[], &body),
            Verdict::BadPrompt(_)
        ));
    }

    #[test]
    fn overloaded_stream_event_is_retryable() {
        assert_eq!(
            classify_stream_error("overloaded_error", "busy"),
            Verdict::RetryRateLimited
        );
        assert!(matches!(
            classify_stream_error("api_error", "oops"),
            Verdict::Surface { .. }
        ));
    }
}

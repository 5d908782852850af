use crate::model::ModelFamily;

/// Enumerated error kinds surfaced by the proxy pipeline.
///
/// Kinds, not types: every stage speaks this one enum so the response handler
/// can route retryable failures without downcasting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BadRequest,
    Forbidden,
    TooManyRequests,
    NoKeyAvailable,
    RetryableUpstream,
    KeyInvalid,
    KeyQuotaExceeded,
    UpstreamFatal,
    ClientAborted,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProxyError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("too many requests in queue for this user")]
    TooManyRequests,
    #[error("no keys available for model family {0}")]
    NoKeyAvailable(ModelFamily),
    #[error("upstream rejected the attempt: {0}")]
    RetryableUpstream(String),
    #[error("the assigned key was revoked upstream; please try again")]
    KeyInvalid,
    #[error("the assigned key has exhausted its quota")]
    KeyQuotaExceeded,
    #[error("upstream error: {0}")]
    UpstreamFatal(String),
    #[error("client aborted the request")]
    ClientAborted,
}

impl ProxyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProxyError::BadRequest(_) => ErrorKind::BadRequest,
            ProxyError::Forbidden(_) => ErrorKind::Forbidden,
            ProxyError::TooManyRequests => ErrorKind::TooManyRequests,
            ProxyError::NoKeyAvailable(_) => ErrorKind::NoKeyAvailable,
            ProxyError::RetryableUpstream(_) => ErrorKind::RetryableUpstream,
            ProxyError::KeyInvalid => ErrorKind::KeyInvalid,
            ProxyError::KeyQuotaExceeded => ErrorKind::KeyQuotaExceeded,
            ProxyError::UpstreamFatal(_) => ErrorKind::UpstreamFatal,
            ProxyError::ClientAborted => ErrorKind::ClientAborted,
        }
    }

    /// HTTP status the client should see when this error is surfaced.
    pub fn status(&self) -> u16 {
        match self.kind() {
            ErrorKind::BadRequest => 400,
            ErrorKind::Forbidden => 403,
            ErrorKind::TooManyRequests => 429,
            ErrorKind::NoKeyAvailable => 402,
            // Revoked keys surface as a transient condition: the client did
            // nothing wrong and a retry will land on a different key.
            ErrorKind::KeyInvalid => 503,
            ErrorKind::KeyQuotaExceeded => 503,
            ErrorKind::RetryableUpstream | ErrorKind::UpstreamFatal => 500,
            ErrorKind::ClientAborted => 499,
        }
    }

    /// Only the response classifier produces retryable errors; everything
    /// else surfaces immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::RetryableUpstream)
    }
}

/// Strip hostnames from DNS resolution errors so upstream topology is not
/// leaked to clients.
pub fn redact_hostnames(message: &str) -> String {
    message
        .split_whitespace()
        .map(|word| {
            let bare = word.trim_matches(|c: char| !c.is_ascii_alphanumeric());
            if looks_like_host(bare) { "[redacted]" } else { word }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn looks_like_host(word: &str) -> bool {
    word.split('.').count() >= 3
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_flag_is_narrow() {
        assert!(ProxyError::RetryableUpstream("429".into()).is_retryable());
        assert!(!ProxyError::KeyInvalid.is_retryable());
        assert!(!ProxyError::UpstreamFatal("boom".into()).is_retryable());
    }

    #[test]
    fn statuses_match_taxonomy() {
        assert_eq!(ProxyError::NoKeyAvailable(ModelFamily::Gpt4o).status(), 402);
        assert_eq!(ProxyError::TooManyRequests.status(), 429);
        assert_eq!(ProxyError::BadRequest("x".into()).status(), 400);
    }

    #[test]
    fn hostnames_are_redacted() {
        let out = redact_hostnames("getaddrinfo ENOTFOUND api.openai.com");
        assert!(!out.contains("api.openai.com"));
        assert!(out.contains("[redacted]"));
    }
}

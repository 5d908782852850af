use serde::{Deserialize, Serialize};

/// Identity a queued request is attributed to for fairness accounting.
///
/// Resolution order: user token if present, else the alternate identity
/// header, else the client IP.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueIdentity {
    Token(String),
    Header(String),
    Ip(String),
}

impl QueueIdentity {
    /// Short form safe to include in logs (tokens are truncated).
    pub fn redacted(&self) -> String {
        match self {
            QueueIdentity::Token(token) => {
                let head: String = token.chars().take(8).collect();
                format!("token:{head}…")
            }
            QueueIdentity::Header(value) => format!("header:{value}"),
            QueueIdentity::Ip(ip) => format!("ip:{ip}"),
        }
    }
}

impl std::fmt::Display for QueueIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.redacted())
    }
}

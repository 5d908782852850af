use crate::model::ModelFamily;

/// Identity resolved from a client token by the external user subsystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedUser {
    pub token: String,
    pub nickname: Option<String>,
}

/// Seam to the out-of-scope user/gatekeeper subsystem.
///
/// The proxy core only needs token resolution and per-family quota answers;
/// session management, challenges and persistence live elsewhere.
pub trait UserResolver: Send + Sync {
    fn resolve(&self, token: &str) -> Option<ResolvedUser>;

    /// Remaining token quota for this user and family. `None` means no limit.
    fn remaining_quota(&self, token: &str, family: ModelFamily) -> Option<u64>;

    /// Record consumed tokens after a completed request.
    fn record_usage(&self, token: &str, family: ModelFamily, tokens: u64);
}

/// Resolver used when the proxy runs without a user subsystem: every token is
/// accepted verbatim and never rate-limited.
#[derive(Debug, Default)]
pub struct OpenResolver;

impl UserResolver for OpenResolver {
    fn resolve(&self, token: &str) -> Option<ResolvedUser> {
        Some(ResolvedUser {
            token: token.to_string(),
            nickname: None,
        })
    }

    fn remaining_quota(&self, _token: &str, _family: ModelFamily) -> Option<u64> {
        None
    }

    fn record_usage(&self, _token: &str, _family: ModelFamily, _tokens: u64) {}
}

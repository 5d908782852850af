use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ProxyConfigError {
    #[error("missing required config field: {0}")]
    MissingField(&'static str),
}

/// Final, merged configuration snapshot used by the running process.
///
/// Merge order: CLI > ENV > defaults. The snapshot is immutable; the process
/// reads it through an `ArcSwap` so replacement never blocks readers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    /// Comma-separated credential strings, one field per provider (§6.3).
    pub openai_keys: Option<String>,
    pub anthropic_keys: Option<String>,
    pub aws_credentials: Option<String>,
    pub gcp_credentials: Option<String>,
    pub azure_credentials: Option<String>,
    pub google_ai_keys: Option<String>,
    pub mistral_keys: Option<String>,
    /// Origin/Referer substrings that are rejected before enqueue.
    pub blocked_origins: Vec<String>,
    /// Prompt substrings that trip the content filter.
    pub blocked_phrases: Vec<String>,
    pub max_context_tokens: Option<u32>,
    pub max_output_tokens: Option<u32>,
    pub allow_vision: bool,
    /// When false, Bedrock keys with invocation logging enabled are
    /// ineligible for selection.
    pub allow_aws_logging: bool,
    /// Master switch for the recurring background key checkers.
    pub check_keys: bool,
    /// Optional outbound proxy for upstream egress.
    pub proxy: Option<String>,
}

/// Optional layer used for merging configuration sources.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub openai_keys: Option<String>,
    pub anthropic_keys: Option<String>,
    pub aws_credentials: Option<String>,
    pub gcp_credentials: Option<String>,
    pub azure_credentials: Option<String>,
    pub google_ai_keys: Option<String>,
    pub mistral_keys: Option<String>,
    pub blocked_origins: Option<Vec<String>>,
    pub blocked_phrases: Option<Vec<String>>,
    pub max_context_tokens: Option<u32>,
    pub max_output_tokens: Option<u32>,
    pub allow_vision: Option<bool>,
    pub allow_aws_logging: Option<bool>,
    pub check_keys: Option<bool>,
    pub proxy: Option<String>,
}

impl ProxyConfigPatch {
    pub fn overlay(&mut self, other: ProxyConfigPatch) {
        macro_rules! take {
            ($field:ident) => {
                if other.$field.is_some() {
                    self.$field = other.$field;
                }
            };
        }
        take!(host);
        take!(port);
        take!(openai_keys);
        take!(anthropic_keys);
        take!(aws_credentials);
        take!(gcp_credentials);
        take!(azure_credentials);
        take!(google_ai_keys);
        take!(mistral_keys);
        take!(blocked_origins);
        take!(blocked_phrases);
        take!(max_context_tokens);
        take!(max_output_tokens);
        take!(allow_vision);
        take!(allow_aws_logging);
        take!(check_keys);
        take!(proxy);
    }

    pub fn into_config(self) -> Result<ProxyConfig, ProxyConfigError> {
        Ok(ProxyConfig {
            host: self.host.unwrap_or_else(|| "0.0.0.0".to_string()),
            port: self.port.unwrap_or(7860),
            openai_keys: self.openai_keys,
            anthropic_keys: self.anthropic_keys,
            aws_credentials: self.aws_credentials,
            gcp_credentials: self.gcp_credentials,
            azure_credentials: self.azure_credentials,
            google_ai_keys: self.google_ai_keys,
            mistral_keys: self.mistral_keys,
            blocked_origins: self.blocked_origins.unwrap_or_default(),
            blocked_phrases: self.blocked_phrases.unwrap_or_default(),
            max_context_tokens: self.max_context_tokens,
            max_output_tokens: self.max_output_tokens,
            allow_vision: self.allow_vision.unwrap_or(true),
            allow_aws_logging: self.allow_aws_logging.unwrap_or(false),
            check_keys: self.check_keys.unwrap_or(true),
            proxy: self.proxy,
        })
    }
}

impl From<ProxyConfig> for ProxyConfigPatch {
    fn from(value: ProxyConfig) -> Self {
        Self {
            host: Some(value.host),
            port: Some(value.port),
            openai_keys: value.openai_keys,
            anthropic_keys: value.anthropic_keys,
            aws_credentials: value.aws_credentials,
            gcp_credentials: value.gcp_credentials,
            azure_credentials: value.azure_credentials,
            google_ai_keys: value.google_ai_keys,
            mistral_keys: value.mistral_keys,
            blocked_origins: Some(value.blocked_origins),
            blocked_phrases: Some(value.blocked_phrases),
            max_context_tokens: value.max_context_tokens,
            max_output_tokens: value.max_output_tokens,
            allow_vision: Some(value.allow_vision),
            allow_aws_logging: Some(value.allow_aws_logging),
            check_keys: Some(value.check_keys),
            proxy: value.proxy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_prefers_later_layer() {
        let mut base = ProxyConfigPatch {
            port: Some(7860),
            openai_keys: Some("sk-a".to_string()),
            ..Default::default()
        };
        base.overlay(ProxyConfigPatch {
            port: Some(9000),
            ..Default::default()
        });
        let config = base.into_config().unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.openai_keys.as_deref(), Some("sk-a"));
    }
}

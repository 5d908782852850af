use std::collections::{BTreeMap, BTreeSet};

use kproxy_common::{ModelFamily, ProxyError, Service};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// One provider credential plus its runtime state.
///
/// The concrete secret is carried in `secret` (and, for composite
/// credentials, in parsed fields of `extra`); [`Key::redacted`] clears all of
/// it before a key leaves the pool in a listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Key {
    pub hash: String,
    pub service: Service,
    pub model_families: BTreeSet<ModelFamily>,
    pub is_disabled: bool,
    pub is_revoked: bool,
    pub prompt_count: u64,
    /// Epoch ms; 0 means never.
    pub last_used: u64,
    pub last_checked: u64,
    pub rate_limited_at: u64,
    pub rate_limited_until: u64,
    pub token_counts: BTreeMap<ModelFamily, u64>,
    pub secret: String,
    pub extra: KeyExtra,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AwsLoggingStatus {
    Unknown,
    Disabled,
    Enabled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyExtra {
    OpenAi {
        is_trial: bool,
        is_over_quota: bool,
        organization_id: Option<String>,
        /// Header-derived reset windows, ms.
        rate_limit_requests_reset: u64,
        rate_limit_tokens_reset: u64,
        model_ids: BTreeSet<String>,
    },
    Anthropic {
        tier: Option<String>,
        is_pozzed: bool,
        is_over_quota: bool,
        requires_preamble: bool,
        allows_multimodality: bool,
    },
    Aws {
        access_key_id: String,
        secret_access_key: String,
        region: String,
        logging_status: AwsLoggingStatus,
        model_ids: BTreeSet<String>,
        inference_profile_ids: BTreeSet<String>,
    },
    Gcp {
        project_id: String,
        client_email: String,
        region: String,
        /// Base64 PKCS#8, PEM markers stripped (§6.3).
        private_key: String,
        access_token: String,
        access_token_expires_at: u64,
        sonnet_enabled: bool,
        haiku_enabled: bool,
        sonnet35_enabled: bool,
    },
    Azure {
        resource_name: String,
        deployment_id: String,
        api_key: String,
        content_filtering: bool,
        model_ids: BTreeSet<String>,
    },
    GoogleAi,
    Mistral,
}

impl Key {
    /// Parse one credential string in the provider's bit-exact format.
    pub fn parse(service: Service, raw: &str) -> Result<Self, ProxyError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ProxyError::BadRequest(format!(
                "empty {service} credential"
            )));
        }
        let extra = match service {
            Service::OpenAi => KeyExtra::OpenAi {
                is_trial: false,
                is_over_quota: false,
                organization_id: None,
                rate_limit_requests_reset: 0,
                rate_limit_tokens_reset: 0,
                model_ids: BTreeSet::new(),
            },
            Service::Anthropic => KeyExtra::Anthropic {
                tier: None,
                is_pozzed: false,
                is_over_quota: false,
                requires_preamble: false,
                allows_multimodality: true,
            },
            Service::Aws => {
                let [access_key_id, secret_access_key, region] = split_composite(service, raw)?;
                KeyExtra::Aws {
                    access_key_id,
                    secret_access_key,
                    region,
                    logging_status: AwsLoggingStatus::Unknown,
                    model_ids: BTreeSet::new(),
                    inference_profile_ids: BTreeSet::new(),
                }
            }
            Service::Gcp => {
                let [project_id, client_email, region, private_key] =
                    split_composite(service, raw)?;
                KeyExtra::Gcp {
                    project_id,
                    client_email,
                    region,
                    private_key,
                    access_token: String::new(),
                    access_token_expires_at: 0,
                    sonnet_enabled: true,
                    haiku_enabled: true,
                    sonnet35_enabled: false,
                }
            }
            Service::Azure => {
                let [resource_name, deployment_id, api_key] = split_composite(service, raw)?;
                KeyExtra::Azure {
                    resource_name,
                    deployment_id,
                    api_key,
                    content_filtering: false,
                    model_ids: BTreeSet::new(),
                }
            }
            Service::GoogleAi => KeyExtra::GoogleAi,
            Service::Mistral => KeyExtra::Mistral,
        };

        Ok(Self {
            hash: derive_hash(service, raw, None),
            service,
            model_families: default_families(service),
            is_disabled: false,
            is_revoked: false,
            prompt_count: 0,
            last_used: 0,
            last_checked: 0,
            rate_limited_at: 0,
            rate_limited_until: 0,
            token_counts: BTreeMap::new(),
            secret: raw.to_string(),
            extra,
        })
    }

    /// Parse a comma-separated credential list, skipping blanks.
    pub fn parse_list(service: Service, raw: &str) -> Result<Vec<Self>, ProxyError> {
        raw.split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| Self::parse(service, part))
            .collect()
    }

    /// Sibling record for an additional OpenAI organization discovered by the
    /// checker. Usage is tracked independently per organization.
    pub fn clone_for_org(&self, organization_id: &str) -> Self {
        let mut sibling = self.clone();
        sibling.hash = derive_hash(self.service, &self.secret, Some(organization_id));
        sibling.prompt_count = 0;
        sibling.token_counts = BTreeMap::new();
        if let KeyExtra::OpenAi {
            organization_id: org,
            ..
        } = &mut sibling.extra
        {
            *org = Some(organization_id.to_string());
        }
        sibling
    }

    /// Copy with every piece of secret material cleared, for listings.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        copy.secret = String::new();
        match &mut copy.extra {
            KeyExtra::Aws {
                secret_access_key, ..
            } => secret_access_key.clear(),
            KeyExtra::Gcp {
                private_key,
                access_token,
                ..
            } => {
                private_key.clear();
                access_token.clear();
            }
            KeyExtra::Azure { api_key, .. } => api_key.clear(),
            _ => {}
        }
        copy
    }

    pub fn is_rate_limited(&self, now_ms: u64) -> bool {
        now_ms < self.rate_limited_until
    }

    pub fn serves_family(&self, family: ModelFamily) -> bool {
        self.model_families.contains(&family)
    }

    pub fn family_tokens(&self, family: ModelFamily) -> u64 {
        self.token_counts.get(&family).copied().unwrap_or(0)
    }

    pub fn merge(&mut self, patch: KeyPatch) {
        if let Some(families) = patch.model_families {
            self.model_families = families;
        }
        if let Some(extra) = patch.extra {
            self.extra = extra;
        }
        if let Some(disabled) = patch.is_disabled {
            self.is_disabled = disabled;
        }
        if let Some(revoked) = patch.is_revoked {
            self.is_revoked = revoked;
            if revoked {
                self.is_disabled = true;
            }
        }
    }
}

/// Partial update applied through `KeyProvider::update`.
#[derive(Debug, Clone, Default)]
pub struct KeyPatch {
    pub model_families: Option<BTreeSet<ModelFamily>>,
    pub extra: Option<KeyExtra>,
    pub is_disabled: Option<bool>,
    pub is_revoked: Option<bool>,
}

fn split_composite<const N: usize>(
    service: Service,
    raw: &str,
) -> Result<[String; N], ProxyError> {
    let parts: Vec<&str> = raw.splitn(N, ':').collect();
    if parts.len() != N || parts.iter().any(|part| part.is_empty()) {
        return Err(ProxyError::BadRequest(format!(
            "malformed {service} credential: expected {N} colon-separated fields"
        )));
    }
    parts
        .into_iter()
        .map(str::to_string)
        .collect::<Vec<_>>()
        .try_into()
        .map_err(|_| {
            ProxyError::BadRequest(format!("malformed {service} credential"))
        })
}

fn default_families(service: Service) -> BTreeSet<ModelFamily> {
    let families: &[ModelFamily] = match service {
        Service::OpenAi => &[ModelFamily::Turbo],
        Service::Anthropic => &[ModelFamily::Claude],
        Service::Aws => &[ModelFamily::AwsClaude],
        Service::Gcp => &[ModelFamily::GcpClaude],
        Service::Azure => &[ModelFamily::AzureTurbo, ModelFamily::AzureGpt4],
        Service::GoogleAi => &[ModelFamily::GeminiPro],
        Service::Mistral => &[
            ModelFamily::MistralTiny,
            ModelFamily::MistralSmall,
            ModelFamily::MistralMedium,
            ModelFamily::MistralLarge,
        ],
    };
    families.iter().copied().collect()
}

/// Short stable identifier derived from the secret (plus the organization id
/// for OpenAI siblings). The secret itself never appears in logs.
fn derive_hash(service: Service, secret: &str, org: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    if let Some(org) = org {
        hasher.update(b"|");
        hasher.update(org.as_bytes());
    }
    let digest = hasher.finalize();
    let prefix = match service {
        Service::OpenAi => "oai",
        Service::Anthropic => "ant",
        Service::Aws => "aws",
        Service::Gcp => "gcp",
        Service::Azure => "azu",
        Service::GoogleAi => "gai",
        Service::Mistral => "mis",
    };
    let hex: String = digest
        .iter()
        .take(4)
        .map(|byte| format!("{byte:02x}"))
        .collect();
    format!("{prefix}-{hex}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aws_composite_parses() {
        let key = Key::parse(Service::Aws, "AKIAXXXX:secret:us-east-1").unwrap();
        match &key.extra {
            KeyExtra::Aws {
                access_key_id,
                region,
                ..
            } => {
                assert_eq!(access_key_id, "AKIAXXXX");
                assert_eq!(region, "us-east-1");
            }
            other => panic!("unexpected extra: {other:?}"),
        }
        assert!(key.hash.starts_with("aws-"));
    }

    #[test]
    fn malformed_composite_is_rejected() {
        assert!(Key::parse(Service::Gcp, "only:three:parts").is_err());
        assert!(Key::parse(Service::Azure, "res::key").is_err());
    }

    #[test]
    fn list_parsing_skips_blanks() {
        let keys = Key::parse_list(Service::OpenAi, "sk-a, sk-b, ,sk-c").unwrap();
        assert_eq!(keys.len(), 3);
        // Hashes are distinct and stable.
        assert_ne!(keys[0].hash, keys[1].hash);
        assert_eq!(
            keys[0].hash,
            Key::parse(Service::OpenAi, "sk-a").unwrap().hash
        );
    }

    #[test]
    fn org_clone_rederives_hash_and_resets_usage() {
        let mut key = Key::parse(Service::OpenAi, "sk-a").unwrap();
        key.prompt_count = 10;
        let sibling = key.clone_for_org("org-123");
        assert_ne!(sibling.hash, key.hash);
        assert_eq!(sibling.secret, key.secret);
        assert_eq!(sibling.prompt_count, 0);
        match &sibling.extra {
            KeyExtra::OpenAi {
                organization_id, ..
            } => assert_eq!(organization_id.as_deref(), Some("org-123")),
            other => panic!("unexpected extra: {other:?}"),
        }
    }

    #[test]
    fn redacted_clears_all_secret_material() {
        let key = Key::parse(Service::Gcp, "proj:mail@x.iam:us-east5:QUJDRA").unwrap();
        let redacted = key.redacted();
        assert!(redacted.secret.is_empty());
        match &redacted.extra {
            KeyExtra::Gcp {
                private_key,
                client_email,
                ..
            } => {
                assert!(private_key.is_empty());
                assert_eq!(client_email, "mail@x.iam");
            }
            other => panic!("unexpected extra: {other:?}"),
        }
    }

    #[test]
    fn revoking_through_merge_implies_disabled() {
        let mut key = Key::parse(Service::Anthropic, "sk-ant-x").unwrap();
        key.merge(KeyPatch {
            is_revoked: Some(true),
            ..Default::default()
        });
        assert!(key.is_disabled);
        assert!(key.is_revoked);
    }
}

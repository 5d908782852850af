use std::collections::BTreeSet;

use async_trait::async_trait;
use kproxy_common::ModelFamily;

use crate::checker::{ProbeClient, ProbeOutcome, ProbeRequest, ProbeResponse, ProviderProbe};
use crate::key::{Key, KeyExtra, KeyPatch};

const BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const PROBE_MODEL: &str = "claude-3-5-sonnet-20240620";
const OPUS_MODEL: &str = "claude-3-opus-20240229";
/// 1x1 transparent PNG.
const PROBE_IMAGE_B64: &str =
    "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mNkYPhfDwAChwGA60e6kgAAAABJRU5ErkJggg==";

pub struct AnthropicProbe;

#[async_trait]
impl ProviderProbe for AnthropicProbe {
    async fn check_key(&self, client: &dyn ProbeClient, key: &Key) -> ProbeOutcome {
        // Baseline probe: a compliance canary that also proves the key works.
        let canary = serde_json::json!({
            "model": PROBE_MODEL,
            "max_tokens": 16,
            "system": "Respond only with the word PONG.",
            "messages": [{"role": "user", "content": "ping"}],
        });
        let response = match self.post_messages(client, key, canary).await {
            Ok(response) => response,
            Err(outcome) => return outcome,
        };
        if let Some(outcome) = classify_status(&response) {
            return outcome;
        }
        let is_pozzed = !response.body_text().to_ascii_uppercase().contains("PONG");
        let requires_preamble = response.status == 400
            && response.body_text().contains("prompt must start with");

        let mut families: BTreeSet<ModelFamily> = BTreeSet::new();
        families.insert(ModelFamily::Claude);

        // Opus access is probed separately; a 404 just means no opus.
        let opus = serde_json::json!({
            "model": OPUS_MODEL,
            "max_tokens": 1,
            "messages": [{"role": "user", "content": "hi"}],
        });
        if let Ok(response) = self.post_messages(client, key, opus).await
            && response.status == 200
        {
            families.insert(ModelFamily::ClaudeOpus);
        }

        // Multimodality: a one-pixel image either passes validation or draws
        // a vision-specific 400.
        let vision = serde_json::json!({
            "model": PROBE_MODEL,
            "max_tokens": 1,
            "messages": [{"role": "user", "content": [
                {"type": "image", "source": {
                    "type": "base64", "media_type": "image/png", "data": PROBE_IMAGE_B64,
                }},
                {"type": "text", "text": "describe"},
            ]}],
        });
        let allows_multimodality = match self.post_messages(client, key, vision).await {
            Ok(response) => response.status == 200,
            Err(_) => true,
        };

        let tier = response
            .headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("anthropic-ratelimit-requests-limit"))
            .and_then(|(_, value)| value.parse::<u64>().ok())
            .map(|limit| {
                if limit >= 4000 {
                    "scale".to_string()
                } else if limit >= 1000 {
                    "build".to_string()
                } else {
                    "free".to_string()
                }
            });

        ProbeOutcome::Healthy {
            patch: KeyPatch {
                model_families: Some(families),
                extra: Some(KeyExtra::Anthropic {
                    tier,
                    is_pozzed,
                    is_over_quota: false,
                    requires_preamble,
                    allows_multimodality,
                }),
                ..Default::default()
            },
            siblings: Vec::new(),
        }
    }
}

impl AnthropicProbe {
    async fn post_messages(
        &self,
        client: &dyn ProbeClient,
        key: &Key,
        body: serde_json::Value,
    ) -> Result<ProbeResponse, ProbeOutcome> {
        let request = ProbeRequest::post(
            format!("{BASE_URL}/v1/messages"),
            body.to_string().into_bytes(),
        )
        .header("x-api-key", key.secret.clone())
        .header("anthropic-version", API_VERSION)
        .header("content-type", "application/json");
        client
            .send(request)
            .await
            .map_err(|err| ProbeOutcome::NetworkError(err.0))
    }
}

/// Terminal statuses shared by every probe call. `None` means the response
/// carries probe-specific signal and should be inspected further.
fn classify_status(response: &ProbeResponse) -> Option<ProbeOutcome> {
    match response.status {
        200 | 400 => None,
        401 | 403 => {
            if response.body_text().contains("permission") {
                Some(ProbeOutcome::Unknown {
                    status: response.status,
                    detail: response.body_text(),
                })
            } else {
                Some(ProbeOutcome::Revoked)
            }
        }
        429 => {
            if response.body_text().contains("credit balance") {
                Some(ProbeOutcome::QuotaExhausted)
            } else {
                Some(ProbeOutcome::RateLimited)
            }
        }
        status if status >= 500 => Some(ProbeOutcome::RateLimited),
        status => Some(ProbeOutcome::Unknown {
            status,
            detail: response.body_text(),
        }),
    }
}

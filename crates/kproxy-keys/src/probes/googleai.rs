use std::collections::BTreeSet;

use async_trait::async_trait;
use kproxy_common::{ModelFamily, Service, model_family};

use crate::checker::{ProbeClient, ProbeOutcome, ProbeRequest, ProviderProbe};
use crate::key::{Key, KeyPatch};

const BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// One models-list call; families are categorized by name. No recurring
/// checks for this provider.
pub struct GoogleAiProbe;

#[async_trait]
impl ProviderProbe for GoogleAiProbe {
    async fn check_key(&self, client: &dyn ProbeClient, key: &Key) -> ProbeOutcome {
        let request = ProbeRequest::get(format!(
            "{BASE_URL}/v1beta/models?key={}",
            urlencoding::encode(&key.secret)
        ));
        let response = match client.send(request).await {
            Ok(response) => response,
            Err(err) => return ProbeOutcome::NetworkError(err.0),
        };
        match response.status {
            200 => {}
            400 | 401 | 403 => {
                let body = response.body_text();
                if body.contains("API_KEY_INVALID") || response.status != 400 {
                    return ProbeOutcome::Revoked;
                }
                return ProbeOutcome::Unknown {
                    status: response.status,
                    detail: body,
                };
            }
            429 => return ProbeOutcome::RateLimited,
            status => {
                return ProbeOutcome::Unknown {
                    status,
                    detail: response.body_text(),
                };
            }
        }

        let mut families: BTreeSet<ModelFamily> = BTreeSet::new();
        if let Some(json) = response.json()
            && let Some(models) = json.get("models").and_then(|m| m.as_array())
        {
            for model in models {
                if let Some(name) = model.get("name").and_then(|n| n.as_str())
                    && let Some(family) = model_family(Service::GoogleAi, name)
                {
                    families.insert(family);
                }
            }
        }
        if families.is_empty() {
            families.insert(ModelFamily::GeminiPro);
        }

        ProbeOutcome::Healthy {
            patch: KeyPatch {
                model_families: Some(families),
                ..Default::default()
            },
            siblings: Vec::new(),
        }
    }
}

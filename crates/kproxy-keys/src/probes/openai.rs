use std::collections::BTreeSet;

use async_trait::async_trait;
use kproxy_common::{ModelFamily, Service, model_family};

use crate::checker::{ProbeClient, ProbeOutcome, ProbeRequest, ProviderProbe};
use crate::key::{Key, KeyExtra, KeyPatch};

const BASE_URL: &str = "https://api.openai.com";
/// Trial keys are capped well below this request-per-minute limit.
const TRIAL_RPM_CEILING: u64 = 250;

pub struct OpenAiProbe;

#[async_trait]
impl ProviderProbe for OpenAiProbe {
    async fn check_key(&self, client: &dyn ProbeClient, key: &Key) -> ProbeOutcome {
        let org = match &key.extra {
            KeyExtra::OpenAi {
                organization_id, ..
            } => organization_id.clone(),
            _ => None,
        };

        // 1. Discover which model snapshots this key can invoke.
        let mut request = ProbeRequest::get(format!("{BASE_URL}/v1/models"))
            .header("authorization", format!("Bearer {}", key.secret));
        if let Some(org) = &org {
            request = request.header("openai-organization", org.clone());
        }
        let response = match client.send(request).await {
            Ok(response) => response,
            Err(err) => return ProbeOutcome::NetworkError(err.0),
        };
        match response.status {
            200 => {}
            401 | 403 => return ProbeOutcome::Revoked,
            429 => {
                if response.body_text().contains("insufficient_quota") {
                    return ProbeOutcome::QuotaExhausted;
                }
                return ProbeOutcome::RateLimited;
            }
            status => {
                return ProbeOutcome::Unknown {
                    status,
                    detail: response.body_text(),
                };
            }
        }

        let mut model_ids: BTreeSet<String> = BTreeSet::new();
        if let Some(json) = response.json()
            && let Some(data) = json.get("data").and_then(|d| d.as_array())
        {
            for entry in data {
                if let Some(id) = entry.get("id").and_then(|id| id.as_str()) {
                    model_ids.insert(id.to_string());
                }
            }
        }
        let mut families: BTreeSet<ModelFamily> = model_ids
            .iter()
            .filter_map(|id| model_family(Service::OpenAi, id))
            .collect();
        families.insert(ModelFamily::Turbo);

        // 2. A cheap completion validates the key can actually generate and
        //    exposes the rate-limit ceiling used for trial detection.
        let body = serde_json::json!({
            "model": "gpt-3.5-turbo",
            "messages": [{"role": "user", "content": "hi"}],
            "max_tokens": 1,
        });
        let mut request = ProbeRequest::post(
            format!("{BASE_URL}/v1/chat/completions"),
            body.to_string().into_bytes(),
        )
        .header("authorization", format!("Bearer {}", key.secret))
        .header("content-type", "application/json");
        if let Some(org) = &org {
            request = request.header("openai-organization", org.clone());
        }
        let completion = match client.send(request).await {
            Ok(response) => response,
            Err(err) => return ProbeOutcome::NetworkError(err.0),
        };
        let mut is_trial = false;
        match completion.status {
            200 => {
                let rpm = completion
                    .headers
                    .iter()
                    .find(|(name, _)| name.eq_ignore_ascii_case("x-ratelimit-limit-requests"))
                    .and_then(|(_, value)| value.parse::<u64>().ok());
                is_trial = rpm.is_some_and(|limit| limit <= TRIAL_RPM_CEILING);
            }
            401 | 403 => return ProbeOutcome::Revoked,
            429 => {
                if completion.body_text().contains("insufficient_quota") {
                    return ProbeOutcome::QuotaExhausted;
                }
                return ProbeOutcome::RateLimited;
            }
            status => {
                return ProbeOutcome::Unknown {
                    status,
                    detail: completion.body_text(),
                };
            }
        }

        // 3. Organization discovery; a key in several orgs becomes several
        //    pool entries that track usage independently.
        let mut siblings = Vec::new();
        if org.is_none() {
            let request = ProbeRequest::get(format!("{BASE_URL}/v1/organizations"))
                .header("authorization", format!("Bearer {}", key.secret));
            if let Ok(response) = client.send(request).await
                && response.status == 200
                && let Some(json) = response.json()
                && let Some(data) = json.get("data").and_then(|d| d.as_array())
            {
                for entry in data {
                    let is_default = entry
                        .get("is_default")
                        .and_then(|v| v.as_bool())
                        .unwrap_or(false);
                    if is_default {
                        continue;
                    }
                    if let Some(id) = entry.get("id").and_then(|id| id.as_str()) {
                        let mut sibling = key.clone_for_org(id);
                        sibling.model_families = families.clone();
                        siblings.push(sibling);
                    }
                }
            }
        }

        ProbeOutcome::Healthy {
            patch: KeyPatch {
                model_families: Some(families),
                extra: Some(KeyExtra::OpenAi {
                    is_trial,
                    is_over_quota: false,
                    organization_id: org,
                    rate_limit_requests_reset: 0,
                    rate_limit_tokens_reset: 0,
                    model_ids,
                }),
                ..Default::default()
            },
            siblings,
        }
    }
}

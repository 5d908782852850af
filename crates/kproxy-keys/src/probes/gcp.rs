use std::collections::BTreeSet;

use async_trait::async_trait;
use kproxy_common::ModelFamily;

use crate::checker::{ProbeClient, ProbeOutcome, ProbeRequest, ProviderProbe};
use crate::gcp_oauth;
use crate::key::{Key, KeyExtra, KeyPatch};

const SONNET: &str = "claude-3-sonnet@20240229";
const SONNET35: &str = "claude-3-5-sonnet@20240620";
const HAIKU: &str = "claude-3-haiku@20240307";

pub struct GcpProbe;

#[async_trait]
impl ProviderProbe for GcpProbe {
    async fn check_key(&self, client: &dyn ProbeClient, key: &Key) -> ProbeOutcome {
        let KeyExtra::Gcp {
            project_id, region, ..
        } = &key.extra
        else {
            return ProbeOutcome::Unknown {
                status: 0,
                detail: "not a GCP credential".to_string(),
            };
        };

        let (token, expires_at) = match gcp_oauth::mint_token(client, key).await {
            Ok(minted) => minted,
            Err(err) => return ProbeOutcome::NetworkError(err.to_string()),
        };

        // All Claude variants are probed in one pass; per-variant flags gate
        // selection afterwards.
        let mut sonnet_enabled = false;
        let mut sonnet35_enabled = false;
        let mut haiku_enabled = false;
        for (model, flag) in [
            (SONNET, &mut sonnet_enabled),
            (SONNET35, &mut sonnet35_enabled),
            (HAIKU, &mut haiku_enabled),
        ] {
            let url = format!(
                "https://{region}-aiplatform.googleapis.com/v1/projects/{project_id}/locations/{region}/publishers/anthropic/models/{model}:rawPredict"
            );
            // Malformed on purpose; a validation 400 proves variant access.
            let body = serde_json::json!({
                "anthropic_version": "vertex-2023-10-16",
                "max_tokens": -1,
                "messages": [{"role": "user", "content": "hi"}],
            });
            let request = ProbeRequest::post(url, body.to_string().into_bytes())
                .header("authorization", format!("Bearer {token}"))
                .header("content-type", "application/json");
            let response = match client.send(request).await {
                Ok(response) => response,
                Err(err) => return ProbeOutcome::NetworkError(err.0),
            };
            match response.status {
                200 | 429 => *flag = true,
                400 if response.body_text().contains("max_tokens") => *flag = true,
                401 => return ProbeOutcome::Revoked,
                403 if response.body_text().contains("PERMISSION_DENIED") => {}
                _ => {}
            }
        }

        if !sonnet_enabled && !sonnet35_enabled && !haiku_enabled {
            return ProbeOutcome::QuotaExhausted;
        }

        let mut families: BTreeSet<ModelFamily> = BTreeSet::new();
        families.insert(ModelFamily::GcpClaude);

        let KeyExtra::Gcp {
            project_id,
            client_email,
            region,
            private_key,
            ..
        } = key.extra.clone()
        else {
            return ProbeOutcome::Unknown {
                status: 0,
                detail: "not a GCP credential".to_string(),
            };
        };

        ProbeOutcome::Healthy {
            patch: KeyPatch {
                model_families: Some(families),
                extra: Some(KeyExtra::Gcp {
                    project_id,
                    client_email,
                    region,
                    private_key,
                    access_token: token,
                    access_token_expires_at: expires_at,
                    sonnet_enabled,
                    haiku_enabled,
                    sonnet35_enabled,
                }),
                ..Default::default()
            },
            siblings: Vec::new(),
        }
    }
}

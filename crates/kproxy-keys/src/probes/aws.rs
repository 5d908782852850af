use std::collections::BTreeSet;

use async_trait::async_trait;
use kproxy_common::{ModelFamily, Service, model_family};

use crate::checker::{ProbeClient, ProbeOutcome, ProbeRequest, ProbeResponse, ProviderProbe};
use crate::key::{AwsLoggingStatus, Key, KeyExtra, KeyPatch};
use crate::sigv4::{self, SigningParams};

/// Bedrock model ids worth probing. A 400 validation error on the malformed
/// payload proves invoke access; 403 proves the opposite.
const CANDIDATE_MODELS: [&str; 6] = [
    "anthropic.claude-3-5-sonnet-20240620-v1:0",
    "anthropic.claude-3-opus-20240229-v1:0",
    "anthropic.claude-3-sonnet-20240229-v1:0",
    "anthropic.claude-3-haiku-20240307-v1:0",
    "mistral.mistral-large-2402-v1:0",
    "mistral.mixtral-8x7b-instruct-v0:1",
];

pub struct AwsProbe;

#[async_trait]
impl ProviderProbe for AwsProbe {
    async fn check_key(&self, client: &dyn ProbeClient, key: &Key) -> ProbeOutcome {
        let KeyExtra::Aws {
            access_key_id,
            secret_access_key,
            region,
            ..
        } = &key.extra
        else {
            return ProbeOutcome::Unknown {
                status: 0,
                detail: "not an AWS credential".to_string(),
            };
        };
        let creds = Creds {
            access_key_id,
            secret_access_key,
            region,
        };

        let mut model_ids: BTreeSet<String> = BTreeSet::new();
        for model in CANDIDATE_MODELS {
            let host = format!("bedrock-runtime.{region}.amazonaws.com");
            let path = format!("/model/{}/invoke", urlencoding::encode(model));
            // Intentionally malformed: a validation complaint about
            // max_tokens is the cheapest possible proof of model access.
            let payload = br#"{"max_tokens":-1}"#.to_vec();
            let response =
                match signed_request(client, &creds, "POST", &host, &path, payload).await {
                    Ok(response) => response,
                    Err(outcome) => return outcome,
                };
            let body = response.body_text();
            match response.status {
                400 if body.contains("max_tokens") => {
                    model_ids.insert(model.to_string());
                }
                403 if body.contains("security token") || body.contains("InvalidSignature") => {
                    return ProbeOutcome::Revoked;
                }
                403 => {
                    // "You don't have access to the model with the specified
                    // model ID": key is fine, model is not enabled.
                }
                429 | 503 => {
                    // Saturated but reachable counts as accessible.
                    model_ids.insert(model.to_string());
                }
                _ => {}
            }
        }

        if model_ids.is_empty() {
            return ProbeOutcome::QuotaExhausted;
        }

        let mut families: BTreeSet<ModelFamily> = model_ids
            .iter()
            .filter_map(|id| model_family(Service::Aws, id))
            .collect();
        if families.is_empty() {
            families.insert(ModelFamily::AwsClaude);
        }

        // Invocation logging policy: a key that ships prompts to CloudWatch
        // is only eligible when the operator allows it.
        let logging_status = self.check_logging(client, &creds).await;
        let inference_profile_ids = self.list_inference_profiles(client, &creds).await;

        ProbeOutcome::Healthy {
            patch: KeyPatch {
                model_families: Some(families),
                extra: Some(KeyExtra::Aws {
                    access_key_id: creds.access_key_id.to_string(),
                    secret_access_key: creds.secret_access_key.to_string(),
                    region: creds.region.to_string(),
                    logging_status,
                    model_ids,
                    inference_profile_ids,
                }),
                ..Default::default()
            },
            siblings: Vec::new(),
        }
    }
}

struct Creds<'a> {
    access_key_id: &'a str,
    secret_access_key: &'a str,
    region: &'a str,
}

impl AwsProbe {
    async fn check_logging(&self, client: &dyn ProbeClient, creds: &Creds<'_>) -> AwsLoggingStatus {
        let host = format!("bedrock.{}.amazonaws.com", creds.region);
        let response =
            signed_request(client, creds, "GET", &host, "/logging/modelinvocations", Vec::new())
                .await;
        match response {
            Ok(response) if response.status == 200 => {
                let delivery_enabled = response
                    .json()
                    .and_then(|json| {
                        json.pointer("/loggingConfig/textDataDeliveryEnabled")
                            .and_then(|v| v.as_bool())
                    })
                    .unwrap_or(false);
                if delivery_enabled {
                    AwsLoggingStatus::Enabled
                } else {
                    AwsLoggingStatus::Disabled
                }
            }
            Ok(response) if response.status == 404 => AwsLoggingStatus::Disabled,
            _ => AwsLoggingStatus::Unknown,
        }
    }

    async fn list_inference_profiles(
        &self,
        client: &dyn ProbeClient,
        creds: &Creds<'_>,
    ) -> BTreeSet<String> {
        let host = format!("bedrock.{}.amazonaws.com", creds.region);
        let mut ids = BTreeSet::new();
        if let Ok(response) =
            signed_request(client, creds, "GET", &host, "/inference-profiles", Vec::new()).await
            && response.status == 200
            && let Some(json) = response.json()
            && let Some(summaries) = json
                .get("inferenceProfileSummaries")
                .and_then(|v| v.as_array())
        {
            for summary in summaries {
                if let Some(id) = summary
                    .get("inferenceProfileId")
                    .and_then(|id| id.as_str())
                {
                    ids.insert(id.to_string());
                }
            }
        }
        ids
    }
}

async fn signed_request(
    client: &dyn ProbeClient,
    creds: &Creds<'_>,
    method: &'static str,
    host: &str,
    path: &str,
    payload: Vec<u8>,
) -> Result<ProbeResponse, ProbeOutcome> {
    let extra_headers = vec![("content-type".to_string(), "application/json".to_string())];
    let signed = sigv4::sign(&SigningParams {
        access_key_id: creds.access_key_id,
        secret_access_key: creds.secret_access_key,
        region: creds.region,
        service: "bedrock",
        method,
        host,
        path,
        query: "",
        headers: &extra_headers,
        payload: &payload,
        timestamp: time::OffsetDateTime::now_utc(),
    })
    .map_err(|err| ProbeOutcome::NetworkError(err.to_string()))?;

    let mut request = ProbeRequest {
        method,
        url: format!("https://{host}{path}"),
        headers: Vec::new(),
        body: (!payload.is_empty()).then_some(payload),
    };
    for (name, value) in signed.headers {
        // `host` is set by the HTTP client from the URL.
        if name != "host" {
            request.headers.push((name, value));
        }
    }
    client
        .send(request)
        .await
        .map_err(|err| ProbeOutcome::NetworkError(err.0))
}

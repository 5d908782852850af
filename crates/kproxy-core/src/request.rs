use bytes::Bytes;
use kproxy_common::{ApiFormat, ModelFamily, QueueIdentity, Service};
use kproxy_keys::Key;
use serde_json::Value;
use tokio::time::Instant;
use uuid::Uuid;

/// Pre-computed HTTP envelope for providers that sign whole requests
/// (AWS SigV4, GCP OAuth). When present, dispatch uses it verbatim.
#[derive(Debug, Clone)]
pub struct SignedRequest {
    pub method: &'static str,
    pub hostname: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

/// One in-flight client request.
///
/// Preprocessors run exactly once over this struct before enqueue; mutators
/// run on every dequeue and may only touch it through the request manager.
#[derive(Debug)]
pub struct ProxyRequest {
    pub id: Uuid,
    pub identity: QueueIdentity,
    pub user_token: Option<String>,
    pub client_ip: String,
    pub inbound_format: ApiFormat,
    pub outbound_format: ApiFormat,
    pub service: Service,
    pub model: String,
    pub model_family: ModelFamily,
    /// Headers destined for the upstream call (mutated per attempt).
    pub headers: Vec<(String, String)>,
    /// Upstream path (mutated per attempt for providers without signing).
    pub path: String,
    pub body: Value,
    pub key: Option<Key>,
    pub signed_request: Option<SignedRequest>,
    pub streaming: bool,
    pub start_time: Instant,
    pub start_ms: u64,
    pub queue_out_time: Option<Instant>,
    pub retry_count: u32,
    pub prompt_tokens: u64,
    pub output_tokens: u64,
}

impl ProxyRequest {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identity: QueueIdentity,
        user_token: Option<String>,
        client_ip: String,
        inbound_format: ApiFormat,
        outbound_format: ApiFormat,
        service: Service,
        headers: Vec<(String, String)>,
        body: Value,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            identity,
            user_token,
            client_ip,
            inbound_format,
            outbound_format,
            service,
            model: String::new(),
            model_family: ModelFamily::Turbo,
            headers,
            path: String::new(),
            body,
            key: None,
            signed_request: None,
            streaming: false,
            start_time: Instant::now(),
            start_ms: kproxy_keys::clock::now_ms(),
            queue_out_time: None,
            retry_count: 0,
            prompt_tokens: 0,
            output_tokens: 0,
        }
    }

    /// Scheduling weight: enqueue time plus a light penalty for large
    /// prompts, so one giant request cannot starve a partition.
    pub fn queue_weight(&self, tokens_punishment_factor: u64) -> u64 {
        self.start_ms + tokens_punishment_factor * (self.prompt_tokens + self.output_tokens)
    }
}

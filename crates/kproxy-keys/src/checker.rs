//! Background key health/capability checker.
//!
//! One checker task per provider. Keys are probed once at startup (bounded
//! concurrency), then re-probed on an interval for providers with recurring
//! checks enabled. `recheck()` on the provider wakes the loop immediately.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;

use crate::clock::now_ms;
use crate::events::Event;
use crate::key::{Key, KeyPatch};
use crate::provider::KeyProvider;

/// Minimum spacing between probes of the same key.
pub const MIN_CHECK_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);
/// Reschedule delay after a rate-limited or failed probe.
const SHORT_RETRY: Duration = Duration::from_secs(60);
/// Idle sleep between scheduler passes.
const PASS_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ProbeRequest {
    pub method: &'static str,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl ProbeRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET",
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn post(url: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            method: "POST",
            url: url.into(),
            headers: Vec::new(),
            body: Some(body),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone)]
pub struct ProbeResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl ProbeResponse {
    pub fn json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.body).ok()
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Clone)]
pub struct ProbeError(pub String);

impl std::fmt::Display for ProbeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "probe transport error: {}", self.0)
    }
}

impl std::error::Error for ProbeError {}

/// Minimal HTTP seam so probes (and the OAuth exchange) can run against a
/// stubbed upstream in tests.
#[async_trait]
pub trait ProbeClient: Send + Sync {
    async fn send(&self, request: ProbeRequest) -> Result<ProbeResponse, ProbeError>;
}

/// What a provider probe concluded about one key.
#[derive(Debug)]
pub enum ProbeOutcome {
    /// Healthy; merge the patch and optionally adopt discovered siblings.
    Healthy {
        patch: KeyPatch,
        siblings: Vec<Key>,
    },
    /// Credential is invalid or revoked.
    Revoked,
    /// Quota or billing exhausted; disabled but not revoked.
    QuotaExhausted,
    /// Probe itself was rate limited; try again shortly.
    RateLimited,
    /// Transport-level failure; try again shortly.
    NetworkError(String),
    /// Unrecognized status; logged and rescheduled normally.
    Unknown { status: u16, detail: String },
}

/// Provider-specific probe strategy.
#[async_trait]
pub trait ProviderProbe: Send + Sync {
    async fn check_key(&self, client: &dyn ProbeClient, key: &Key) -> ProbeOutcome;
}

pub struct KeyChecker {
    provider: Arc<KeyProvider>,
    probe: Arc<dyn ProviderProbe>,
    client: Arc<dyn ProbeClient>,
    /// Keys rescheduled for a short retry after a failed probe. Scheduling
    /// state stays out of the Key record itself.
    retry_at: tokio::sync::Mutex<std::collections::HashMap<String, u64>>,
}

impl KeyChecker {
    pub fn new(
        provider: Arc<KeyProvider>,
        probe: Arc<dyn ProviderProbe>,
        client: Arc<dyn ProbeClient>,
    ) -> Self {
        Self {
            provider,
            probe,
            client,
            retry_at: tokio::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }

    /// Spawn the background loop. The task runs for the life of the process.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&self) {
        let wake = self.provider.checker_wake();
        let recurring = self.provider.tuning().recurring_checks;
        loop {
            let checked = self.run_pass().await;
            let has_retries = !self.retry_at.lock().await.is_empty();
            if checked == 0 && !recurring && !has_retries {
                // Initial pass done; sleep until an explicit recheck.
                wake.notified().await;
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(PASS_INTERVAL) => {}
                _ = wake.notified() => {}
            }
        }
    }

    /// Probe every key currently due. Returns how many keys were probed.
    async fn run_pass(&self) -> usize {
        let now = now_ms();
        let interval_ms = MIN_CHECK_INTERVAL.as_millis() as u64;
        let recurring = self.provider.tuning().recurring_checks;
        let retries = self.retry_at.lock().await.clone();
        let due: Vec<Key> = self
            .provider
            .snapshot()
            .await
            .into_iter()
            .filter(|key| !key.is_revoked)
            .filter(|key| {
                key.last_checked == 0
                    || (recurring && now.saturating_sub(key.last_checked) >= interval_ms)
                    || retries.get(&key.hash).is_some_and(|at| *at <= now)
            })
            .collect();
        if due.is_empty() {
            return 0;
        }

        let batch = self.provider.tuning().probe_batch.max(1);
        for chunk in due.chunks(batch) {
            let mut join_set = tokio::task::JoinSet::new();
            for key in chunk.iter().cloned() {
                let probe = self.probe.clone();
                let client = self.client.clone();
                join_set.spawn(async move {
                    let outcome = probe.check_key(client.as_ref(), &key).await;
                    (key, outcome)
                });
            }
            while let Some(joined) = join_set.join_next().await {
                let Ok((key, outcome)) = joined else {
                    continue;
                };
                self.apply_outcome(&key, outcome).await;
            }
            // Light jitter between batches so a large pool does not probe in
            // lockstep.
            let jitter = rand::rng().random_range(50..250);
            tokio::time::sleep(Duration::from_millis(jitter)).await;
        }
        due.len()
    }

    async fn apply_outcome(&self, key: &Key, outcome: ProbeOutcome) {
        let service = self.provider.service();
        if !matches!(
            outcome,
            ProbeOutcome::RateLimited | ProbeOutcome::NetworkError(_)
        ) {
            self.retry_at.lock().await.remove(&key.hash);
        }
        match outcome {
            ProbeOutcome::Healthy { patch, siblings } => {
                self.provider.update(&key.hash, patch).await;
                if !siblings.is_empty() {
                    self.provider.adopt(siblings).await;
                }
                self.provider
                    .events()
                    .emit(Event::KeyChecked {
                        at_ms: now_ms(),
                        service,
                        hash: key.hash.clone(),
                    })
                    .await;
            }
            ProbeOutcome::Revoked => {
                self.provider.update(&key.hash, KeyPatch::default()).await;
                self.provider.disable(&key.hash, true).await;
            }
            ProbeOutcome::QuotaExhausted => {
                self.provider.update(&key.hash, KeyPatch::default()).await;
                self.provider.disable(&key.hash, false).await;
            }
            ProbeOutcome::RateLimited => {
                self.schedule_retry(&key.hash).await;
            }
            ProbeOutcome::NetworkError(detail) => {
                tracing::warn!(%service, hash = %key.hash, %detail, "key probe failed");
                self.schedule_retry(&key.hash).await;
            }
            ProbeOutcome::Unknown { status, detail } => {
                tracing::warn!(
                    %service,
                    hash = %key.hash,
                    status,
                    %detail,
                    "key probe returned unrecognized status"
                );
                self.provider.update(&key.hash, KeyPatch::default()).await;
            }
        }
    }

    /// Stamp `last_checked`, then queue a short retry instead of waiting out
    /// the full interval.
    async fn schedule_retry(&self, hash: &str) {
        self.provider.update(hash, KeyPatch::default()).await;
        self.retry_at
            .lock()
            .await
            .insert(hash.to_string(), now_ms() + SHORT_RETRY.as_millis() as u64);
    }
}

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use kproxy_common::{ModelFamily, ProxyError, Service, model_family};
use tokio::sync::{Notify, RwLock};

use crate::clock::now_ms;
use crate::events::{Event, EventHub};
use crate::key::{AwsLoggingStatus, Key, KeyExtra, KeyPatch};
use crate::prioritizer::prioritize;

/// Per-provider design constants (§6.4 of the upstream interface notes).
#[derive(Debug, Clone, Copy)]
pub struct ProviderTuning {
    pub service: Service,
    /// Post-selection throttle preventing immediate reassignment.
    pub key_reuse_delay: Duration,
    /// Lockout applied by `mark_rate_limited`.
    pub rate_limit_lockout: Duration,
    pub recurring_checks: bool,
    /// Concurrent probes the checker may run against this provider.
    pub probe_batch: usize,
}

impl ProviderTuning {
    pub fn for_service(service: Service) -> Self {
        let (reuse_ms, lockout_ms) = match service {
            Service::OpenAi => (1000, 10_000),
            Service::Anthropic => (500, 2000),
            Service::Aws => (250, 5000),
            Service::Gcp => (500, 4000),
            Service::Azure => (500, 4000),
            Service::GoogleAi => (500, 2000),
            Service::Mistral => (500, 2000),
        };
        Self {
            service,
            key_reuse_delay: Duration::from_millis(reuse_ms),
            rate_limit_lockout: Duration::from_millis(lockout_ms),
            recurring_checks: matches!(
                service,
                Service::OpenAi | Service::Anthropic | Service::Aws
            ),
            probe_batch: if service == Service::Aws { 2 } else { 4 },
        }
    }
}

/// Owns every key for one provider. All mutation goes through these methods;
/// callers only ever see copies.
pub struct KeyProvider {
    tuning: ProviderTuning,
    allow_aws_logging: bool,
    keys: RwLock<Vec<Key>>,
    events: EventHub,
    checker_wake: Arc<Notify>,
}

impl KeyProvider {
    pub fn new(tuning: ProviderTuning, allow_aws_logging: bool, events: EventHub) -> Self {
        Self {
            tuning,
            allow_aws_logging,
            keys: RwLock::new(Vec::new()),
            events,
            checker_wake: Arc::new(Notify::new()),
        }
    }

    pub fn service(&self) -> Service {
        self.tuning.service
    }

    pub fn tuning(&self) -> &ProviderTuning {
        &self.tuning
    }

    pub fn events(&self) -> &EventHub {
        &self.events
    }

    pub fn checker_wake(&self) -> Arc<Notify> {
        self.checker_wake.clone()
    }

    pub async fn insert_keys(&self, new_keys: Vec<Key>) {
        let mut keys = self.keys.write().await;
        for key in new_keys {
            if !keys.iter().any(|existing| existing.hash == key.hash) {
                keys.push(key);
            }
        }
    }

    pub async fn key_count(&self) -> usize {
        self.keys.read().await.len()
    }

    /// Full copies including secrets, for the checker and signing mutators.
    pub(crate) async fn snapshot(&self) -> Vec<Key> {
        self.keys.read().await.clone()
    }

    /// Select a key for `model`, stamp `last_used`, and apply the reuse
    /// throttle so the same key is not immediately reassigned. Returns a
    /// copy; pool state can only be changed through this provider.
    pub async fn get(&self, model: &str) -> Result<Key, ProxyError> {
        let family = model_family(self.tuning.service, model).ok_or_else(|| {
            ProxyError::BadRequest(format!(
                "model {model} is not served by {}",
                self.tuning.service
            ))
        })?;
        let now = now_ms();

        let mut keys = self.keys.write().await;
        let chosen_hash = {
            let mut candidates: Vec<&Key> = keys
                .iter()
                .filter(|key| self.eligible(key, model, family))
                .collect();
            if candidates.is_empty() {
                return Err(ProxyError::NoKeyAvailable(family));
            }
            let tiebreaker = service_tiebreaker(self.tuning.service, model);
            prioritize(
                &mut candidates,
                now,
                tiebreaker
                    .as_deref()
                    .map(|tiebreak| tiebreak as &dyn Fn(&Key, &Key) -> Ordering),
            );
            candidates[0].hash.clone()
        };

        let Some(key) = keys.iter_mut().find(|key| key.hash == chosen_hash) else {
            return Err(ProxyError::NoKeyAvailable(family));
        };
        key.last_used = now;
        let throttled_until = now + self.tuning.key_reuse_delay.as_millis() as u64;
        key.rate_limited_until = key.rate_limited_until.max(throttled_until);
        Ok(key.clone())
    }

    /// Secret-free snapshot for listings and the models route.
    pub async fn list(&self) -> Vec<Key> {
        self.keys.read().await.iter().map(Key::redacted).collect()
    }

    /// Idempotent disable; `revoke` marks the key permanently unusable.
    pub async fn disable(&self, hash: &str, revoke: bool) {
        let mut keys = self.keys.write().await;
        let Some(key) = keys.iter_mut().find(|key| key.hash == hash) else {
            return;
        };
        let was_disabled = key.is_disabled;
        let was_revoked = key.is_revoked;
        key.is_disabled = true;
        key.is_revoked = key.is_revoked || revoke;
        if was_disabled && key.is_revoked == was_revoked {
            return;
        }
        let event = Event::KeyDisabled {
            at_ms: now_ms(),
            service: self.tuning.service,
            hash: hash.to_string(),
            revoked: key.is_revoked,
        };
        drop(keys);
        self.events.emit(event).await;
    }

    /// Merge a patch and stamp `last_checked`.
    pub async fn update(&self, hash: &str, patch: KeyPatch) {
        let mut keys = self.keys.write().await;
        if let Some(key) = keys.iter_mut().find(|key| key.hash == hash) {
            key.merge(patch);
            key.last_checked = now_ms();
        }
    }

    /// Register checker-discovered sibling keys (OpenAI organizations).
    pub async fn adopt(&self, siblings: Vec<Key>) {
        self.insert_keys(siblings).await;
    }

    pub async fn increment_usage(&self, hash: &str, model: &str, tokens: u64) {
        let Some(family) = model_family(self.tuning.service, model) else {
            return;
        };
        let mut keys = self.keys.write().await;
        if let Some(key) = keys.iter_mut().find(|key| key.hash == hash) {
            key.prompt_count += 1;
            *key.token_counts.entry(family).or_insert(0) += tokens;
        }
    }

    pub async fn mark_rate_limited(&self, hash: &str) {
        let lockout = self.tuning.rate_limit_lockout.as_millis() as u64;
        self.apply_lockout(hash, lockout).await;
    }

    /// OpenAI: lockout derived from `x-ratelimit-*-reset` headers, floored at
    /// ten seconds.
    pub async fn update_rate_limits(&self, hash: &str, requests_reset_ms: u64, tokens_reset_ms: u64) {
        {
            let mut keys = self.keys.write().await;
            if let Some(key) = keys.iter_mut().find(|key| key.hash == hash)
                && let KeyExtra::OpenAi {
                    rate_limit_requests_reset,
                    rate_limit_tokens_reset,
                    ..
                } = &mut key.extra
            {
                *rate_limit_requests_reset = requests_reset_ms;
                *rate_limit_tokens_reset = tokens_reset_ms;
            }
        }
        let lockout = requests_reset_ms.max(tokens_reset_ms).max(10_000);
        self.apply_lockout(hash, lockout).await;
    }

    async fn apply_lockout(&self, hash: &str, lockout_ms: u64) {
        let now = now_ms();
        let until = now + lockout_ms;
        let mut found = false;
        {
            let mut keys = self.keys.write().await;
            if let Some(key) = keys.iter_mut().find(|key| key.hash == hash) {
                key.rate_limited_at = now;
                key.rate_limited_until = until;
                found = true;
            }
        }
        if found {
            self.events
                .emit(Event::KeyRateLimited {
                    at_ms: now,
                    service: self.tuning.service,
                    hash: hash.to_string(),
                    until_ms: until,
                })
                .await;
        }
    }

    /// Remaining time until any key in `family` becomes usable. Zero when an
    /// enabled key is free right now, and zero when the family has no enabled
    /// keys at all (the request will fail downstream with `NoKeyAvailable`).
    pub async fn get_lockout_period(&self, family: ModelFamily) -> Duration {
        let now = now_ms();
        let keys = self.keys.read().await;
        let mut shortest: Option<u64> = None;
        let mut any_enabled = false;
        for key in keys.iter() {
            if key.is_disabled || !key.serves_family(family) {
                continue;
            }
            any_enabled = true;
            if !key.is_rate_limited(now) {
                return Duration::ZERO;
            }
            let remaining = key.rate_limited_until - now;
            shortest = Some(shortest.map_or(remaining, |cur| cur.min(remaining)));
        }
        if !any_enabled {
            return Duration::ZERO;
        }
        Duration::from_millis(shortest.unwrap_or(0))
    }

    /// Reset health state on every key and wake the background checker.
    pub async fn recheck(&self) {
        {
            let mut keys = self.keys.write().await;
            for key in keys.iter_mut() {
                key.last_checked = 0;
                key.is_disabled = false;
                key.is_revoked = false;
            }
        }
        self.checker_wake.notify_one();
    }

    fn eligible(&self, key: &Key, model: &str, family: ModelFamily) -> bool {
        if key.is_disabled || !key.serves_family(family) {
            return false;
        }
        match &key.extra {
            KeyExtra::OpenAi {
                is_over_quota,
                model_ids,
                ..
            } => !is_over_quota && (model_ids.is_empty() || model_ids.contains(model)),
            KeyExtra::Anthropic { is_over_quota, .. } => !is_over_quota,
            KeyExtra::Aws {
                logging_status,
                model_ids,
                inference_profile_ids,
                ..
            } => {
                if !self.allow_aws_logging && *logging_status == AwsLoggingStatus::Enabled {
                    return false;
                }
                if model_ids.is_empty() && inference_profile_ids.is_empty() {
                    // Not probed yet; trust the configured families.
                    return true;
                }
                model_ids.contains(strip_profile_prefix(model))
                    || inference_profile_ids.contains(model)
            }
            KeyExtra::Gcp {
                sonnet_enabled,
                haiku_enabled,
                sonnet35_enabled,
                ..
            } => {
                let bare = model.split('@').next().unwrap_or(model);
                if bare.contains("3-5-sonnet") {
                    *sonnet35_enabled
                } else if bare.contains("sonnet") {
                    *sonnet_enabled
                } else if bare.contains("haiku") {
                    *haiku_enabled
                } else {
                    true
                }
            }
            KeyExtra::Azure { .. } | KeyExtra::GoogleAi | KeyExtra::Mistral => true,
        }
    }
}

/// Region-prefixed inference profile ids ("us.anthropic...") reduce to the
/// bare model id for availability checks.
fn strip_profile_prefix(model: &str) -> &str {
    model
        .split_once('.')
        .filter(|(prefix, _)| prefix.len() == 2)
        .map(|(_, rest)| rest)
        .unwrap_or(model)
}

type BoxedTiebreaker = Box<dyn Fn(&Key, &Key) -> Ordering + Send>;

fn service_tiebreaker(service: Service, model: &str) -> Option<BoxedTiebreaker> {
    match service {
        Service::OpenAi => Some(Box::new(|a: &Key, b: &Key| {
            let trial = |key: &Key| match &key.extra {
                KeyExtra::OpenAi { is_trial, .. } => *is_trial,
                _ => false,
            };
            trial(a).cmp(&trial(b))
        })),
        Service::Aws => {
            let model = model.to_string();
            Some(Box::new(move |a: &Key, b: &Key| {
                let has_profile = |key: &Key| match &key.extra {
                    KeyExtra::Aws {
                        inference_profile_ids,
                        ..
                    } => inference_profile_ids.contains(&model),
                    _ => false,
                };
                has_profile(b).cmp(&has_profile(a))
            }))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(service: Service) -> KeyProvider {
        KeyProvider::new(ProviderTuning::for_service(service), false, EventHub::new(8))
    }

    #[tokio::test]
    async fn get_applies_reuse_throttle() {
        let pool = provider(Service::Anthropic);
        pool.insert_keys(vec![Key::parse(Service::Anthropic, "sk-a").unwrap()])
            .await;

        let before = now_ms();
        let key = pool.get("claude-3-5-sonnet-20240620").await.unwrap();
        assert!(!key.is_disabled);
        assert!(key.serves_family(ModelFamily::Claude));
        assert!(key.rate_limited_until >= before + 500);
    }

    #[tokio::test]
    async fn get_prefers_non_trial_openai_keys() {
        let pool = provider(Service::OpenAi);
        let mut trial = Key::parse(Service::OpenAi, "sk-trial").unwrap();
        if let KeyExtra::OpenAi { is_trial, .. } = &mut trial.extra {
            *is_trial = true;
        }
        trial.last_used = 0;
        let mut paid = Key::parse(Service::OpenAi, "sk-paid").unwrap();
        paid.last_used = 5;
        pool.insert_keys(vec![trial, paid.clone()]).await;

        let key = pool.get("gpt-3.5-turbo").await.unwrap();
        assert_eq!(key.hash, paid.hash);
    }

    #[tokio::test]
    async fn disabled_keys_are_never_selected() {
        let pool = provider(Service::Anthropic);
        let mut key = Key::parse(Service::Anthropic, "sk-a").unwrap();
        key.is_disabled = true;
        pool.insert_keys(vec![key]).await;

        let err = pool.get("claude-3-5-sonnet-20240620").await.unwrap_err();
        assert!(matches!(err, ProxyError::NoKeyAvailable(ModelFamily::Claude)));
    }

    #[tokio::test]
    async fn lockout_period_reflects_rate_limits() {
        let pool = provider(Service::Anthropic);
        pool.insert_keys(vec![
            Key::parse(Service::Anthropic, "sk-a").unwrap(),
            Key::parse(Service::Anthropic, "sk-b").unwrap(),
        ])
        .await;

        assert_eq!(
            pool.get_lockout_period(ModelFamily::Claude).await,
            Duration::ZERO
        );

        let list = pool.list().await;
        pool.mark_rate_limited(&list[0].hash).await;
        // One key still free.
        assert_eq!(
            pool.get_lockout_period(ModelFamily::Claude).await,
            Duration::ZERO
        );

        pool.mark_rate_limited(&list[1].hash).await;
        let lockout = pool.get_lockout_period(ModelFamily::Claude).await;
        assert!(lockout > Duration::ZERO);
        assert!(lockout <= Duration::from_millis(2000));
    }

    #[tokio::test]
    async fn lockout_period_is_zero_without_enabled_keys() {
        let pool = provider(Service::Anthropic);
        assert_eq!(
            pool.get_lockout_period(ModelFamily::Claude).await,
            Duration::ZERO
        );
    }

    #[tokio::test]
    async fn disable_is_idempotent() {
        let hub = EventHub::new(8);
        let mut rx = hub.subscribe();
        let pool = KeyProvider::new(ProviderTuning::for_service(Service::Anthropic), false, hub);
        pool.insert_keys(vec![Key::parse(Service::Anthropic, "sk-a").unwrap()])
            .await;
        let hash = pool.list().await[0].hash.clone();

        pool.disable(&hash, false).await;
        pool.disable(&hash, false).await;

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
        assert!(pool.list().await[0].is_disabled);
    }

    #[tokio::test]
    async fn usage_accrues_per_family() {
        let pool = provider(Service::OpenAi);
        pool.insert_keys(vec![Key::parse(Service::OpenAi, "sk-a").unwrap()])
            .await;
        let hash = pool.list().await[0].hash.clone();

        pool.increment_usage(&hash, "gpt-3.5-turbo", 42).await;
        pool.increment_usage(&hash, "gpt-3.5-turbo", 8).await;

        let key = &pool.list().await[0];
        assert_eq!(key.prompt_count, 2);
        assert_eq!(key.family_tokens(ModelFamily::Turbo), 50);
    }

    #[tokio::test]
    async fn openai_header_lockout_is_floored() {
        let pool = provider(Service::OpenAi);
        pool.insert_keys(vec![Key::parse(Service::OpenAi, "sk-a").unwrap()])
            .await;
        let hash = pool.list().await[0].hash.clone();

        let before = now_ms();
        pool.update_rate_limits(&hash, 200, 450).await;
        let key = &pool.list().await[0];
        assert!(key.rate_limited_until >= before + 10_000);
    }

    #[tokio::test]
    async fn recheck_resets_health_state() {
        let pool = provider(Service::Anthropic);
        pool.insert_keys(vec![Key::parse(Service::Anthropic, "sk-a").unwrap()])
            .await;
        let hash = pool.list().await[0].hash.clone();
        pool.disable(&hash, true).await;

        pool.recheck().await;
        let key = &pool.list().await[0];
        assert!(!key.is_disabled);
        assert!(!key.is_revoked);
        assert_eq!(key.last_checked, 0);
    }

    #[tokio::test]
    async fn aws_logging_keys_filtered_when_disallowed() {
        let pool = provider(Service::Aws);
        let mut logging = Key::parse(Service::Aws, "AKIA1:s1:us-east-1").unwrap();
        if let KeyExtra::Aws { logging_status, .. } = &mut logging.extra {
            *logging_status = AwsLoggingStatus::Enabled;
        }
        pool.insert_keys(vec![logging]).await;

        let err = pool
            .get("anthropic.claude-3-5-sonnet-20240620-v1:0")
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::NoKeyAvailable(_)));
    }
}

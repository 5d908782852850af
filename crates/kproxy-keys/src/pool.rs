use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use kproxy_common::{ModelFamily, ProxyError, Service, service_for_family, service_for_model};

use crate::events::EventHub;
use crate::key::{Key, KeyPatch};
use crate::provider::{KeyProvider, ProviderTuning};

/// Service-agnostic aggregator. Routes every call to the owning provider,
/// resolved from the model string (or the family for lockout queries).
pub struct KeyPool {
    providers: HashMap<Service, Arc<KeyProvider>>,
    events: EventHub,
}

impl KeyPool {
    pub fn new(events: EventHub) -> Self {
        Self {
            providers: HashMap::new(),
            events,
        }
    }

    /// Construct with one provider per supported service.
    pub fn with_all_providers(events: EventHub, allow_aws_logging: bool) -> Self {
        let mut pool = Self::new(events.clone());
        for service in [
            Service::OpenAi,
            Service::Anthropic,
            Service::Aws,
            Service::Gcp,
            Service::Azure,
            Service::GoogleAi,
            Service::Mistral,
        ] {
            pool.register(Arc::new(KeyProvider::new(
                ProviderTuning::for_service(service),
                allow_aws_logging,
                events.clone(),
            )));
        }
        pool
    }

    pub fn register(&mut self, provider: Arc<KeyProvider>) {
        self.providers.insert(provider.service(), provider);
    }

    pub fn events(&self) -> &EventHub {
        &self.events
    }

    pub fn provider(&self, service: Service) -> Option<Arc<KeyProvider>> {
        self.providers.get(&service).cloned()
    }

    pub fn providers(&self) -> impl Iterator<Item = &Arc<KeyProvider>> {
        self.providers.values()
    }

    fn provider_for_model(&self, model: &str) -> Result<&Arc<KeyProvider>, ProxyError> {
        let service = service_for_model(model)
            .ok_or_else(|| ProxyError::BadRequest(format!("unknown model: {model}")))?;
        self.providers
            .get(&service)
            .ok_or_else(|| ProxyError::BadRequest(format!("no provider for {service}")))
    }

    pub async fn get(&self, model: &str) -> Result<Key, ProxyError> {
        self.provider_for_model(model)?.get(model).await
    }

    /// Provider-scoped selection when the route already fixes the service
    /// (the same Claude snapshot id exists on three services).
    pub async fn get_for(&self, service: Service, model: &str) -> Result<Key, ProxyError> {
        let provider = self
            .providers
            .get(&service)
            .ok_or_else(|| ProxyError::BadRequest(format!("no provider for {service}")))?;
        provider.get(model).await
    }

    pub async fn list(&self) -> Vec<Key> {
        let mut all = Vec::new();
        for provider in self.providers.values() {
            all.extend(provider.list().await);
        }
        all
    }

    pub async fn disable(&self, service: Service, hash: &str, revoke: bool) {
        if let Some(provider) = self.providers.get(&service) {
            provider.disable(hash, revoke).await;
        }
    }

    pub async fn update(&self, service: Service, hash: &str, patch: KeyPatch) {
        if let Some(provider) = self.providers.get(&service) {
            provider.update(hash, patch).await;
        }
    }

    pub async fn increment_usage(&self, service: Service, hash: &str, model: &str, tokens: u64) {
        if let Some(provider) = self.providers.get(&service) {
            provider.increment_usage(hash, model, tokens).await;
        }
    }

    pub async fn mark_rate_limited(&self, service: Service, hash: &str) {
        if let Some(provider) = self.providers.get(&service) {
            provider.mark_rate_limited(hash).await;
        }
    }

    pub async fn update_rate_limits(
        &self,
        service: Service,
        hash: &str,
        requests_reset_ms: u64,
        tokens_reset_ms: u64,
    ) {
        if let Some(provider) = self.providers.get(&service) {
            provider
                .update_rate_limits(hash, requests_reset_ms, tokens_reset_ms)
                .await;
        }
    }

    /// Scheduler gate: zero means the family can dispatch now.
    pub async fn get_lockout_period(&self, family: ModelFamily) -> Duration {
        match self.providers.get(&service_for_family(family)) {
            Some(provider) => provider.get_lockout_period(family).await,
            None => Duration::ZERO,
        }
    }

    pub async fn recheck(&self) {
        for provider in self.providers.values() {
            provider.recheck().await;
        }
    }
}

//! Cached models listing, rebuilt at most once a minute per provider from
//! the enabled keys' discovered model ids.

use std::collections::{BTreeSet, HashMap};

use kproxy_common::Service;
use kproxy_keys::key::KeyExtra;
use kproxy_keys::{Key, KeyPool};
use serde_json::Value;
use tokio::sync::Mutex;

const CACHE_TTL_MS: u64 = 60_000;

/// Models shown when no key has been probed yet.
fn default_models(service: Service) -> &'static [&'static str] {
    match service {
        Service::OpenAi => &["gpt-3.5-turbo", "gpt-4o", "gpt-4o-2024-05-13"],
        Service::Anthropic => &[
            "claude-3-5-sonnet-20240620",
            "claude-3-opus-20240229",
            "claude-3-haiku-20240307",
        ],
        Service::Aws => &[
            "anthropic.claude-3-5-sonnet-20240620-v1:0",
            "anthropic.claude-3-haiku-20240307-v1:0",
        ],
        Service::Gcp => &["claude-3-5-sonnet@20240620", "claude-3-haiku@20240307"],
        Service::Azure => &["gpt-4o", "gpt-35-turbo"],
        Service::GoogleAi => &["gemini-1.5-pro", "gemini-1.5-flash"],
        Service::Mistral => &["mistral-large-2402", "open-mixtral-8x7b"],
    }
}

#[derive(Default)]
pub struct ModelsCache {
    entries: Mutex<HashMap<Service, (u64, Value)>>,
}

impl ModelsCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn list(&self, pool: &KeyPool, service: Service) -> Value {
        let now = kproxy_keys::clock::now_ms();
        {
            let entries = self.entries.lock().await;
            if let Some((built_at, body)) = entries.get(&service)
                && now.saturating_sub(*built_at) < CACHE_TTL_MS
            {
                return body.clone();
            }
        }

        let body = self.build(pool, service).await;
        self.entries
            .lock()
            .await
            .insert(service, (now, body.clone()));
        body
    }

    async fn build(&self, pool: &KeyPool, service: Service) -> Value {
        let keys = match pool.provider(service) {
            Some(provider) => provider.list().await,
            None => Vec::new(),
        };
        let mut ids: BTreeSet<String> = keys
            .iter()
            .filter(|key| !key.is_disabled)
            .flat_map(discovered_ids)
            .collect();
        if ids.is_empty() {
            ids = default_models(service)
                .iter()
                .map(|id| id.to_string())
                .collect();
        }
        let created = (kproxy_keys::clock::now_ms() / 1000) as i64;
        match service {
            Service::Anthropic => serde_json::json!({
                "data": ids
                    .into_iter()
                    .map(|id| serde_json::json!({
                        "id": id.clone(),
                        "type": "model",
                        "display_name": id,
                    }))
                    .collect::<Vec<_>>(),
                "has_more": false,
            }),
            Service::GoogleAi => serde_json::json!({
                "models": ids
                    .into_iter()
                    .map(|id| serde_json::json!({
                        "name": format!("models/{id}"),
                        "supportedGenerationMethods": ["generateContent", "streamGenerateContent"],
                    }))
                    .collect::<Vec<_>>(),
            }),
            _ => serde_json::to_value(kproxy_protocol::openai::ModelList::new(ids, created))
                .unwrap_or(Value::Null),
        }
    }
}

fn discovered_ids(key: &Key) -> Vec<String> {
    match &key.extra {
        KeyExtra::OpenAi { model_ids, .. } | KeyExtra::Azure { model_ids, .. } => {
            model_ids.iter().cloned().collect()
        }
        KeyExtra::Aws {
            model_ids,
            inference_profile_ids,
            ..
        } => model_ids
            .iter()
            .chain(inference_profile_ids.iter())
            .cloned()
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kproxy_keys::EventHub;
    use std::sync::Arc;

    #[tokio::test]
    async fn falls_back_to_defaults_and_caches() {
        let pool = Arc::new(KeyPool::with_all_providers(EventHub::new(8), false));
        let cache = ModelsCache::new();

        let first = cache.list(&pool, Service::Anthropic).await;
        assert!(first["data"].as_array().unwrap().len() >= 2);

        // A key inserted after the build is invisible until the TTL lapses.
        pool.provider(Service::Anthropic)
            .unwrap()
            .insert_keys(vec![
                Key::parse(Service::Anthropic, "sk-ant-cached").unwrap(),
            ])
            .await;
        let second = cache.list(&pool, Service::Anthropic).await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn openai_listing_uses_openai_shape() {
        let pool = Arc::new(KeyPool::with_all_providers(EventHub::new(8), false));
        let cache = ModelsCache::new();
        let body = cache.list(&pool, Service::OpenAi).await;
        assert_eq!(body["object"], "list");
        assert!(body["data"][0]["id"].is_string());
    }
}

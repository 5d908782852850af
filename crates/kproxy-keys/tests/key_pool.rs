use std::time::Duration;

use kproxy_common::{ModelFamily, ProxyError, Service};
use kproxy_keys::key::Key;
use kproxy_keys::{Event, EventHub, KeyPool};

fn pool_with_anthropic_keys() -> KeyPool {
    KeyPool::with_all_providers(EventHub::new(32), false)
}

#[tokio::test]
async fn get_returns_eligible_key_and_throttles() {
    let pool = pool_with_anthropic_keys();
    let provider = pool.provider(Service::Anthropic).unwrap();
    provider
        .insert_keys(vec![
            Key::parse(Service::Anthropic, "sk-ant-aaaaaaaa").unwrap(),
            Key::parse(Service::Anthropic, "sk-ant-bbbbbbbb").unwrap(),
        ])
        .await;

    let key = pool.get("claude-3-5-sonnet-20240620").await.unwrap();
    assert!(!key.is_disabled);
    assert!(key.serves_family(ModelFamily::Claude));

    // Second selection within the reuse window must pick the other key.
    let second = pool.get("claude-3-5-sonnet-20240620").await.unwrap();
    assert_ne!(second.hash, key.hash);
}

#[tokio::test]
async fn rotation_under_rate_limit_prefers_free_key() {
    let pool = pool_with_anthropic_keys();
    let provider = pool.provider(Service::Anthropic).unwrap();
    provider
        .insert_keys(vec![
            Key::parse(Service::Anthropic, "sk-ant-aaaaaaaa").unwrap(),
            Key::parse(Service::Anthropic, "sk-ant-bbbbbbbb").unwrap(),
        ])
        .await;

    let first = pool.get("claude-3-5-sonnet-20240620").await.unwrap();
    pool.mark_rate_limited(Service::Anthropic, &first.hash).await;

    let second = pool.get("claude-3-5-sonnet-20240620").await.unwrap();
    assert_ne!(second.hash, first.hash);

    // The rate-limited key carries the 2 s Anthropic lockout.
    let listed = provider
        .list()
        .await
        .into_iter()
        .find(|key| key.hash == first.hash)
        .unwrap();
    assert!(listed.rate_limited_until >= listed.rate_limited_at + 2000);
}

#[tokio::test]
async fn lockout_period_partitions_are_independent() {
    let pool = pool_with_anthropic_keys();
    let anthropic = pool.provider(Service::Anthropic).unwrap();
    let openai = pool.provider(Service::OpenAi).unwrap();
    anthropic
        .insert_keys(vec![Key::parse(Service::Anthropic, "sk-ant-aaaaaaaa").unwrap()])
        .await;
    openai
        .insert_keys(vec![Key::parse(Service::OpenAi, "sk-aaaaaaaa").unwrap()])
        .await;

    let claude_key = pool.get("claude-3-5-sonnet-20240620").await.unwrap();
    pool.mark_rate_limited(Service::Anthropic, &claude_key.hash)
        .await;

    assert!(pool.get_lockout_period(ModelFamily::Claude).await > Duration::ZERO);
    assert_eq!(
        pool.get_lockout_period(ModelFamily::Turbo).await,
        Duration::ZERO
    );
}

#[tokio::test]
async fn no_key_available_when_family_not_served() {
    let pool = pool_with_anthropic_keys();
    let err = pool.get("claude-3-opus-20240229").await.unwrap_err();
    assert!(matches!(
        err,
        ProxyError::NoKeyAvailable(ModelFamily::ClaudeOpus)
    ));
}

#[tokio::test]
async fn listings_never_contain_secrets() {
    let pool = pool_with_anthropic_keys();
    pool.provider(Service::Aws)
        .unwrap()
        .insert_keys(vec![
            Key::parse(Service::Aws, "AKIAEXAMPLE:topsecret:us-east-1").unwrap(),
        ])
        .await;

    for key in pool.list().await {
        assert!(key.secret.is_empty());
        let as_json = serde_json::to_string(&key).unwrap();
        assert!(!as_json.contains("topsecret"));
    }
}

#[tokio::test]
async fn disable_events_are_broadcast() {
    let hub = EventHub::new(32);
    let mut rx = hub.subscribe();
    let pool = KeyPool::with_all_providers(hub, false);
    let provider = pool.provider(Service::Anthropic).unwrap();
    provider
        .insert_keys(vec![Key::parse(Service::Anthropic, "sk-ant-aaaaaaaa").unwrap()])
        .await;
    let hash = provider.list().await[0].hash.clone();

    pool.disable(Service::Anthropic, &hash, true).await;

    let event = rx.recv().await.unwrap();
    match event {
        Event::KeyDisabled {
            revoked, service, ..
        } => {
            assert!(revoked);
            assert_eq!(service, Service::Anthropic);
        }
        other => panic!("unexpected event: {other:?}"),
    }

    let listed = provider.list().await;
    assert!(listed[0].is_disabled && listed[0].is_revoked);
}

#[tokio::test]
async fn pool_routes_by_model_pattern() {
    let pool = pool_with_anthropic_keys();
    pool.provider(Service::Aws)
        .unwrap()
        .insert_keys(vec![
            Key::parse(Service::Aws, "AKIAEXAMPLE:secret:us-east-1").unwrap(),
        ])
        .await;

    let key = pool
        .get("anthropic.claude-3-5-sonnet-20240620-v1:0")
        .await
        .unwrap();
    assert_eq!(key.service, Service::Aws);
}

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use kproxy_common::{OpenResolver, ProxyConfig, Service};
use kproxy_core::{AppState, ProxyEngine, RequestQueue, WreqUpstreamClient};
use kproxy_keys::key::Key;
use kproxy_keys::probes::probe_for;
use kproxy_keys::{EventHub, KeyChecker, KeyPool, TracingSink};

mod cli;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = cli::Cli::parse()
        .into_patch()
        .into_config()
        .context("invalid configuration")?;

    let events = EventHub::new(256);
    events.add_sink(Arc::new(TracingSink)).await;

    let pool = Arc::new(KeyPool::with_all_providers(
        events.clone(),
        config.allow_aws_logging,
    ));
    load_keys(&pool, &config).await?;

    let client = Arc::new(
        WreqUpstreamClient::new(config.proxy.as_deref())
            .context("building the upstream HTTP client")?,
    );

    if config.check_keys {
        for provider in pool.providers() {
            if let Some(probe) = probe_for(provider.service()) {
                KeyChecker::new(provider.clone(), probe, client.clone()).spawn();
            }
        }
    }

    let queue = RequestQueue::new(pool.clone(), events.clone());
    queue.spawn_loops();

    let state = AppState {
        config: Arc::new(arc_swap::ArcSwap::from_pointee(config.clone())),
        pool,
        queue,
        users: Arc::new(OpenResolver),
        client: client.clone(),
        probe_client: client,
        events,
        filter_backoff: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
    };
    let engine = Arc::new(ProxyEngine::new(state));

    let app = kproxy_router::proxy_router(engine)
        .into_make_service_with_connect_info::<SocketAddr>();

    let bind = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    tracing::info!(%bind, "kproxy listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn load_keys(pool: &KeyPool, config: &ProxyConfig) -> Result<()> {
    let sources = [
        (Service::OpenAi, &config.openai_keys),
        (Service::Anthropic, &config.anthropic_keys),
        (Service::Aws, &config.aws_credentials),
        (Service::Gcp, &config.gcp_credentials),
        (Service::Azure, &config.azure_credentials),
        (Service::GoogleAi, &config.google_ai_keys),
        (Service::Mistral, &config.mistral_keys),
    ];
    for (service, raw) in sources {
        let Some(raw) = raw else { continue };
        let keys = Key::parse_list(service, raw)
            .with_context(|| format!("parsing {service} credentials"))?;
        if keys.is_empty() {
            continue;
        }
        let count = keys.len();
        if let Some(provider) = pool.provider(service) {
            provider.insert_keys(keys).await;
            tracing::info!(%service, count, "loaded credentials");
        }
    }
    Ok(())
}

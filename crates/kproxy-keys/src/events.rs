//! Operational event fan-out.
//!
//! Subsystems emit events into a hub; subscribers (and optional async sinks,
//! e.g. a persistence layer supplied by the host process) consume them. The
//! hub never blocks emitters on a slow sink.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use kproxy_common::{ModelFamily, Service};
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, broadcast};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    KeyDisabled {
        at_ms: u64,
        service: Service,
        hash: String,
        revoked: bool,
    },
    KeyRateLimited {
        at_ms: u64,
        service: Service,
        hash: String,
        until_ms: u64,
    },
    KeyChecked {
        at_ms: u64,
        service: Service,
        hash: String,
    },
    RequestQueued {
        at_ms: u64,
        id: String,
        family: ModelFamily,
        position: usize,
    },
    RequestKilled {
        at_ms: u64,
        id: String,
        family: ModelFamily,
        waited_ms: u64,
    },
    RequestCompleted {
        at_ms: u64,
        id: String,
        family: ModelFamily,
        key_hash: Option<String>,
        prompt_tokens: u64,
        output_tokens: u64,
        retries: u32,
    },
}

pub trait EventSink: Send + Sync {
    fn write<'a>(&'a self, event: &'a Event) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}

#[derive(Clone)]
pub struct EventHub {
    inner: Arc<Inner>,
}

struct Inner {
    tx: broadcast::Sender<Event>,
    sinks: RwLock<Vec<Arc<dyn EventSink>>>,
}

impl EventHub {
    pub fn new(buffer: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer);
        Self {
            inner: Arc::new(Inner {
                tx,
                sinks: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.tx.subscribe()
    }

    pub async fn add_sink(&self, sink: Arc<dyn EventSink>) {
        self.inner.sinks.write().await.push(sink);
    }

    pub async fn emit(&self, event: Event) {
        let _ = self.inner.tx.send(event.clone());
        let sinks = self.inner.sinks.read().await.clone();
        for sink in sinks {
            let event = event.clone();
            tokio::spawn(async move {
                sink.write(&event).await;
            });
        }
    }
}

/// Sink that forwards events to the tracing subscriber.
#[derive(Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn write<'a>(&'a self, event: &'a Event) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            match event {
                Event::KeyDisabled {
                    service,
                    hash,
                    revoked,
                    ..
                } => {
                    tracing::warn!(%service, %hash, revoked, "key disabled");
                }
                Event::KeyRateLimited {
                    service,
                    hash,
                    until_ms,
                    ..
                } => {
                    tracing::info!(%service, %hash, until_ms, "key rate limited");
                }
                Event::KeyChecked { service, hash, .. } => {
                    tracing::debug!(%service, %hash, "key checked");
                }
                Event::RequestQueued {
                    id,
                    family,
                    position,
                    ..
                } => {
                    tracing::debug!(%id, %family, position, "request queued");
                }
                Event::RequestKilled {
                    id,
                    family,
                    waited_ms,
                    ..
                } => {
                    tracing::warn!(%id, %family, waited_ms, "request killed after queue timeout");
                }
                Event::RequestCompleted {
                    id,
                    family,
                    prompt_tokens,
                    output_tokens,
                    retries,
                    ..
                } => {
                    tracing::info!(
                        %id,
                        %family,
                        prompt_tokens,
                        output_tokens,
                        retries,
                        "request completed"
                    );
                }
            }
        })
    }
}

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use kproxy_common::{ProxyConfig, UserResolver};
use kproxy_keys::{EventHub, KeyPool, ProbeClient};
use tokio::sync::Mutex;

use crate::client::UpstreamClient;
use crate::queue::RequestQueue;

/// Shared process state. Every field is independently shareable; cloning the
/// state clones a handle, never data.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ArcSwap<ProxyConfig>>,
    pub pool: Arc<KeyPool>,
    pub queue: Arc<RequestQueue>,
    pub users: Arc<dyn UserResolver>,
    pub client: Arc<dyn UpstreamClient>,
    pub probe_client: Arc<dyn ProbeClient>,
    pub events: EventHub,
    /// Per-IP exponential backoff state for the content filter:
    /// strikes and the epoch-ms the block lifts.
    pub filter_backoff: Arc<Mutex<HashMap<String, (u32, u64)>>>,
}

impl AppState {
    pub fn config(&self) -> Arc<ProxyConfig> {
        self.config.load_full()
    }
}

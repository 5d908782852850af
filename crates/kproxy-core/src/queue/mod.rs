//! The request queue and scheduler.
//!
//! One global ordered list, partitioned on demand by model family. A single
//! scheduler tick drains partitions whose key pools are not locked out,
//! picking the cost-weighted earliest deadline first. Streaming requests get
//! join comments and heartbeats while they wait.

mod estimator;
mod heartbeat;

pub use heartbeat::{
    HEARTBEAT_INTERVAL, JOIN_TIMEOUT, LOAD_THRESHOLD, MAX_HEARTBEAT_STRIKES, StreamHandle,
    heartbeat_payload_size,
};

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use estimator::Estimator;
use kproxy_common::{ModelFamily, ProxyError, QueueIdentity};
use kproxy_keys::clock::now_ms;
use kproxy_keys::{Event, EventHub, KeyPool};
use tokio::sync::{Mutex, oneshot};
use tokio::time::Instant;
use uuid::Uuid;

use crate::request::ProxyRequest;

pub const SCHEDULER_TICK: Duration = Duration::from_millis(50);
pub const USER_CONCURRENCY_LIMIT: usize = 1;
const CLEANUP_INTERVAL: Duration = Duration::from_secs(20);
const MAX_QUEUE_AGE: Duration = Duration::from_secs(5 * 60);
const SAMPLE_WINDOW: Duration = Duration::from_secs(5 * 60);
const WAIT_TIME_INTERVAL: Duration = Duration::from_secs(3);
/// Milliseconds of scheduling penalty per prompt+output token.
const TOKENS_PUNISHMENT_FACTOR: u64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Grant {
    Dispatch,
    Killed,
}

struct Waiting {
    id: Uuid,
    identity: QueueIdentity,
    family: ModelFamily,
    weight: u64,
    /// Original request start, for the age-based kill.
    started_at: Instant,
    /// This enqueue (a retry re-enters here), for wait sampling.
    enqueued_at: Instant,
    grant: oneshot::Sender<Grant>,
    heartbeat: Option<tokio::task::JoinHandle<()>>,
}

struct Inner {
    waiting: Vec<Waiting>,
    /// Completed (family, enqueued, dequeued) triples, pruned to the window.
    samples: Vec<(ModelFamily, Instant, Instant)>,
    estimators: HashMap<ModelFamily, Estimator>,
}

pub struct RequestQueue {
    inner: Mutex<Inner>,
    load: AtomicUsize,
    pool: Arc<KeyPool>,
    events: EventHub,
}

impl RequestQueue {
    pub fn new(pool: Arc<KeyPool>, events: EventHub) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                waiting: Vec::new(),
                samples: Vec::new(),
                estimators: HashMap::new(),
            }),
            load: AtomicUsize::new(0),
            pool,
            events,
        })
    }

    /// Start the scheduler, cleaner and estimator loops.
    pub fn spawn_loops(self: &Arc<Self>) {
        let queue = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SCHEDULER_TICK);
            loop {
                tick.tick().await;
                queue.scheduler_pass().await;
            }
        });
        let queue = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(CLEANUP_INTERVAL);
            loop {
                tick.tick().await;
                queue.cleaner_pass().await;
            }
        });
        let queue = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(WAIT_TIME_INTERVAL);
            loop {
                tick.tick().await;
                queue.estimator_pass().await;
            }
        });
    }

    pub fn load(&self) -> usize {
        self.load.load(Ordering::Relaxed)
    }

    pub async fn partition_len(&self, family: ModelFamily) -> usize {
        self.inner
            .lock()
            .await
            .waiting
            .iter()
            .filter(|entry| entry.family == family)
            .count()
    }

    pub async fn estimated_wait(&self, family: ModelFamily) -> Duration {
        let inner = self.inner.lock().await;
        Duration::from_millis(
            inner
                .estimators
                .get(&family)
                .map(Estimator::estimate_ms)
                .unwrap_or(0),
        )
    }

    /// Add a request to the queue. The returned ticket resolves when the
    /// scheduler grants dispatch; dropping it removes the entry.
    ///
    /// `rejoin` marks a retry re-entering the queue: the identity limit is
    /// not re-checked (the entry is the same logical request) and no join
    /// comment is written (the stream is already open and heartbeating).
    pub async fn enqueue(
        self: &Arc<Self>,
        request: &ProxyRequest,
        stream: Option<&StreamHandle>,
        rejoin: bool,
    ) -> Result<QueueTicket, ProxyError> {
        let (grant_tx, grant_rx) = oneshot::channel();
        let position;
        let wait_estimate;
        {
            let mut inner = self.inner.lock().await;

            if !rejoin {
                let in_queue = inner
                    .waiting
                    .iter()
                    .filter(|entry| entry.identity == request.identity)
                    .count();
                if in_queue >= USER_CONCURRENCY_LIMIT {
                    return Err(ProxyError::TooManyRequests);
                }
                if !request.streaming && inner.waiting.len() >= LOAD_THRESHOLD {
                    return Err(ProxyError::BadRequest(
                        "proxy is under heavy load; enable streaming to queue this request"
                            .to_string(),
                    ));
                }
            }

            let heartbeat = stream
                .map(|handle| self.clone().spawn_heartbeat(request.id, handle.clone()));
            position = inner
                .waiting
                .iter()
                .filter(|entry| entry.family == request.model_family)
                .count()
                + 1;
            wait_estimate = Duration::from_millis(
                inner
                    .estimators
                    .get(&request.model_family)
                    .map(Estimator::estimate_ms)
                    .unwrap_or(0),
            );
            inner.waiting.push(Waiting {
                id: request.id,
                identity: request.identity.clone(),
                family: request.model_family,
                weight: request.queue_weight(TOKENS_PUNISHMENT_FACTOR),
                started_at: request.start_time,
                enqueued_at: Instant::now(),
                grant: grant_tx,
                heartbeat,
            });
            self.load.store(inner.waiting.len(), Ordering::Relaxed);
        }
        self.events
            .emit(Event::RequestQueued {
                at_ms: now_ms(),
                id: request.id.to_string(),
                family: request.model_family,
                position,
            })
            .await;

        let ticket = QueueTicket {
            id: request.id,
            rx: Some(grant_rx),
            queue: self.clone(),
            settled: false,
        };

        if !rejoin && let Some(handle) = stream {
            // Suspends while the join comment drains to the client.
            handle.send_join(position, wait_estimate).await?;
        }
        Ok(ticket)
    }

    fn spawn_heartbeat(
        self: Arc<Self>,
        id: Uuid,
        handle: StreamHandle,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut strikes = 0u32;
            loop {
                tokio::time::sleep(HEARTBEAT_INTERVAL).await;
                if handle.is_closed() {
                    self.remove(id).await;
                    return;
                }
                if handle.try_heartbeat(self.load()) {
                    strikes = 0;
                } else {
                    strikes += 1;
                    if strikes >= MAX_HEARTBEAT_STRIKES {
                        handle.destroy();
                        self.remove(id).await;
                        return;
                    }
                }
            }
        })
    }

    /// Remove a queued entry (client abort, unresponsive stream, ticket
    /// drop). Returns true when the entry was still queued.
    pub async fn remove(&self, id: Uuid) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(at) = inner.waiting.iter().position(|entry| entry.id == id) else {
            return false;
        };
        let entry = inner.waiting.remove(at);
        self.load.store(inner.waiting.len(), Ordering::Relaxed);
        drop(inner);
        if let Some(heartbeat) = entry.heartbeat {
            heartbeat.abort();
        }
        true
    }

    async fn scheduler_pass(&self) {
        let families: Vec<ModelFamily> = {
            let inner = self.inner.lock().await;
            let mut families: Vec<ModelFamily> =
                inner.waiting.iter().map(|entry| entry.family).collect();
            families.sort_unstable();
            families.dedup();
            families
        };

        for family in families {
            if self.pool.get_lockout_period(family).await != Duration::ZERO {
                continue;
            }
            let entry = {
                let mut inner = self.inner.lock().await;
                let chosen = inner
                    .waiting
                    .iter()
                    .enumerate()
                    .filter(|(_, entry)| entry.family == family)
                    .min_by_key(|(_, entry)| entry.weight)
                    .map(|(at, _)| at);
                let Some(at) = chosen else { continue };
                let entry = inner.waiting.remove(at);
                let now = Instant::now();
                inner.samples.push((family, entry.enqueued_at, now));
                self.load.store(inner.waiting.len(), Ordering::Relaxed);
                entry
            };
            if let Some(heartbeat) = entry.heartbeat {
                heartbeat.abort();
            }
            // A closed receiver means the client vanished between ticks.
            let _ = entry.grant.send(Grant::Dispatch);
        }
    }

    async fn cleaner_pass(&self) {
        let now = Instant::now();
        let killed: Vec<Waiting> = {
            let mut inner = self.inner.lock().await;
            let mut killed = Vec::new();
            let mut index = 0;
            while index < inner.waiting.len() {
                if now.duration_since(inner.waiting[index].started_at) > MAX_QUEUE_AGE {
                    killed.push(inner.waiting.remove(index));
                } else {
                    index += 1;
                }
            }
            inner
                .samples
                .retain(|(_, _, finished)| now.duration_since(*finished) <= SAMPLE_WINDOW);
            self.load.store(inner.waiting.len(), Ordering::Relaxed);
            killed
        };
        for entry in killed {
            let waited = now.duration_since(entry.started_at);
            if let Some(heartbeat) = entry.heartbeat {
                heartbeat.abort();
            }
            let _ = entry.grant.send(Grant::Killed);
            self.events
                .emit(Event::RequestKilled {
                    at_ms: now_ms(),
                    id: entry.id.to_string(),
                    family: entry.family,
                    waited_ms: waited.as_millis() as u64,
                })
                .await;
        }
    }

    async fn estimator_pass(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;

        let mut families: Vec<ModelFamily> = inner
            .waiting
            .iter()
            .map(|entry| entry.family)
            .chain(inner.samples.iter().map(|(family, _, _)| *family))
            .chain(inner.estimators.keys().copied())
            .collect();
        families.sort_unstable();
        families.dedup();

        for family in families {
            let samples: Vec<f64> = inner
                .samples
                .iter()
                .filter(|(sample_family, _, finished)| {
                    *sample_family == family && now.duration_since(*finished) <= SAMPLE_WINDOW
                })
                .map(|(_, started, finished)| {
                    finished.duration_since(*started).as_millis() as f64
                })
                .collect();
            let recent_average = (!samples.is_empty())
                .then(|| samples.iter().sum::<f64>() / samples.len() as f64);
            let longest_current = inner
                .waiting
                .iter()
                .filter(|entry| entry.family == family)
                .map(|entry| now.duration_since(entry.started_at).as_millis() as f64)
                .fold(0.0f64, f64::max);
            inner
                .estimators
                .entry(family)
                .or_default()
                .tick(recent_average, longest_current);
        }
    }
}

/// Handle to a queued request. Await [`QueueTicket::granted`] for dispatch;
/// dropping an unresolved ticket removes the entry from the queue.
pub struct QueueTicket {
    id: Uuid,
    rx: Option<oneshot::Receiver<Grant>>,
    queue: Arc<RequestQueue>,
    settled: bool,
}

impl QueueTicket {
    pub async fn granted(mut self) -> Result<(), ProxyError> {
        let Some(rx) = self.rx.take() else {
            return Err(ProxyError::ClientAborted);
        };
        let outcome = rx.await;
        self.settled = true;
        match outcome {
            Ok(Grant::Dispatch) => Ok(()),
            Ok(Grant::Killed) => Err(ProxyError::UpstreamFatal(
                "request spent too long in the queue".to_string(),
            )),
            Err(_) => Err(ProxyError::ClientAborted),
        }
    }
}

impl Drop for QueueTicket {
    fn drop(&mut self) {
        if !self.settled {
            let queue = self.queue.clone();
            let id = self.id;
            tokio::spawn(async move {
                queue.remove(id).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kproxy_common::{ApiFormat, Service};
    use kproxy_keys::key::Key;

    fn request(identity: &str, streaming: bool) -> ProxyRequest {
        let mut request = ProxyRequest::new(
            QueueIdentity::Token(identity.to_string()),
            Some(identity.to_string()),
            "127.0.0.1".to_string(),
            ApiFormat::OpenAi,
            ApiFormat::AnthropicChat,
            Service::Anthropic,
            Vec::new(),
            serde_json::json!({"model": "claude-3-5-sonnet-20240620"}),
        );
        request.model = "claude-3-5-sonnet-20240620".to_string();
        request.model_family = ModelFamily::Claude;
        request.streaming = streaming;
        request
    }

    async fn queue_with_key() -> Arc<RequestQueue> {
        let events = EventHub::new(32);
        let pool = Arc::new(KeyPool::with_all_providers(events.clone(), false));
        pool.provider(Service::Anthropic)
            .unwrap()
            .insert_keys(vec![Key::parse(Service::Anthropic, "sk-ant-aaaaaaaa").unwrap()])
            .await;
        RequestQueue::new(pool, events)
    }

    #[tokio::test]
    async fn second_request_from_same_identity_is_rejected() {
        let queue = queue_with_key().await;
        let first = request("user-a", false);
        let second = request("user-a", false);

        let _ticket = queue.enqueue(&first, None, false).await.unwrap();
        let err = queue.enqueue(&second, None, false).await.unwrap_err();
        assert!(matches!(err, ProxyError::TooManyRequests));

        // A different identity is unaffected.
        let third = request("user-b", false);
        assert!(queue.enqueue(&third, None, false).await.is_ok());
    }

    #[tokio::test]
    async fn rejoin_skips_identity_limit() {
        let queue = queue_with_key().await;
        let first = request("user-a", false);
        let _ticket = queue.enqueue(&first, None, false).await.unwrap();

        let mut retry = request("user-a", false);
        retry.retry_count = 1;
        assert!(queue.enqueue(&retry, None, true).await.is_ok());
    }

    #[tokio::test]
    async fn scheduler_grants_cheapest_weight_first() {
        let queue = queue_with_key().await;

        let mut heavy = request("user-a", false);
        heavy.prompt_tokens = 100_000;
        heavy.output_tokens = 4_096;
        let mut light = request("user-b", false);
        light.prompt_tokens = 10;
        // Same arrival instant, so the token penalty decides.
        light.start_ms = heavy.start_ms;

        let heavy_ticket = queue.enqueue(&heavy, None, false).await.unwrap();
        let light_ticket = queue.enqueue(&light, None, false).await.unwrap();

        queue.scheduler_pass().await;
        // Only one grant per family per pass.
        let granted = tokio::time::timeout(Duration::from_millis(100), light_ticket.granted())
            .await
            .unwrap();
        assert!(granted.is_ok());
        let pending = tokio::time::timeout(Duration::from_millis(50), heavy_ticket.granted()).await;
        assert!(pending.is_err(), "heavy request granted too early");
    }

    #[tokio::test]
    async fn locked_out_family_is_not_scheduled() {
        let events = EventHub::new(32);
        let pool = Arc::new(KeyPool::with_all_providers(events.clone(), false));
        let provider = pool.provider(Service::Anthropic).unwrap();
        provider
            .insert_keys(vec![Key::parse(Service::Anthropic, "sk-ant-aaaaaaaa").unwrap()])
            .await;
        let hash = provider.list().await[0].hash.clone();
        provider.mark_rate_limited(&hash).await;

        let queue = RequestQueue::new(pool, events);
        let ticket = queue
            .enqueue(&request("user-a", false), None, false)
            .await
            .unwrap();
        queue.scheduler_pass().await;
        let pending = tokio::time::timeout(Duration::from_millis(50), ticket.granted()).await;
        assert!(pending.is_err(), "granted despite family lockout");
    }

    #[tokio::test]
    async fn dropping_ticket_removes_entry() {
        let queue = queue_with_key().await;
        let first = request("user-a", false);
        let ticket = queue.enqueue(&first, None, false).await.unwrap();
        drop(ticket);
        // Removal happens on a spawned task.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.partition_len(ModelFamily::Claude).await, 0);

        // Identity slot is free again.
        let second = request("user-a", false);
        assert!(queue.enqueue(&second, None, false).await.is_ok());
    }

    #[tokio::test]
    async fn join_comment_is_written_for_streams() {
        let queue = queue_with_key().await;
        let (handle, mut rx) = StreamHandle::new(8);
        let streaming = request("user-a", true);
        let _ticket = queue.enqueue(&streaming, Some(&handle), false).await.unwrap();

        let joined = rx.recv().await.unwrap();
        let text = String::from_utf8_lossy(&joined);
        assert!(text.starts_with(": joining queue at position 1"));
    }

    #[tokio::test]
    async fn overload_rejects_non_streaming() {
        let queue = queue_with_key().await;
        let mut tickets = Vec::new();
        for index in 0..LOAD_THRESHOLD {
            let queued = request(&format!("user-{index}"), true);
            tickets.push(queue.enqueue(&queued, None, false).await.unwrap());
        }
        let err = queue
            .enqueue(&request("late-user", false), None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::BadRequest(_)));

        // Streaming requests are still admitted.
        assert!(
            queue
                .enqueue(&request("stream-user", true), None, false)
                .await
                .is_ok()
        );
    }
}

//! SSE keep-alive machinery for queued streaming requests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use base64::Engine;
use bytes::Bytes;
use kproxy_common::ProxyError;
use kproxy_protocol::sse::{SseFrame, encode_frame};
use rand::RngCore;
use tokio::sync::mpsc;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
/// Kernel-buffer drain deadline for the initial join comment.
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(5);
/// Consecutive undeliverable heartbeats before the connection is destroyed.
pub const MAX_HEARTBEAT_STRIKES: u32 = 3;
/// Queue length beyond which non-streaming requests are refused and
/// heartbeat padding starts growing.
pub const LOAD_THRESHOLD: usize = 50;

const MIN_PAYLOAD: usize = 16;
const MAX_PAYLOAD: usize = 4096;
const PAYLOAD_SCALE_FACTOR: usize = 2;

/// Padding size for one heartbeat comment. Under load the padding grows
/// quadratically so slow readers are detected (and disconnected) sooner.
pub fn heartbeat_payload_size(load: usize) -> usize {
    if load <= LOAD_THRESHOLD {
        return MIN_PAYLOAD;
    }
    let over = load - LOAD_THRESHOLD;
    MAX_PAYLOAD.min(MIN_PAYLOAD + over * over * PAYLOAD_SCALE_FACTOR * PAYLOAD_SCALE_FACTOR)
}

fn heartbeat_frame(load: usize) -> Bytes {
    let size = heartbeat_payload_size(load);
    let mut raw = vec![0u8; size];
    rand::rng().fill_bytes(&mut raw);
    let padding = base64::engine::general_purpose::STANDARD.encode(&raw);
    Bytes::from(format!(": {}\n\n", &padding[..size]))
}

/// Writer half of a client SSE response. The queue writes join comments and
/// heartbeats through it while the request waits; the response handler writes
/// data frames through it after dispatch.
#[derive(Clone)]
pub struct StreamHandle {
    tx: mpsc::Sender<Bytes>,
    aborted: Arc<AtomicBool>,
}

impl StreamHandle {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(buffer);
        (
            Self {
                tx,
                aborted: Arc::new(AtomicBool::new(false)),
            },
            rx,
        )
    }

    pub fn is_closed(&self) -> bool {
        self.aborted.load(Ordering::Relaxed) || self.tx.is_closed()
    }

    /// Mark the connection dead. Subsequent sends fail with `ClientAborted`.
    pub fn destroy(&self) {
        self.aborted.store(true, Ordering::Relaxed);
    }

    /// Initial "joining queue" comment. A client that cannot drain this
    /// within [`JOIN_TIMEOUT`] is treated as unresponsive.
    pub async fn send_join(&self, position: usize, wait: Duration) -> Result<(), ProxyError> {
        let comment = format!(
            ": joining queue at position {position}, estimated wait {}s\n\n",
            wait.as_secs()
        );
        match tokio::time::timeout(JOIN_TIMEOUT, self.send_bytes(Bytes::from(comment))).await {
            Ok(result) => result,
            Err(_) => {
                self.destroy();
                Err(ProxyError::ClientAborted)
            }
        }
    }

    /// Non-blocking heartbeat write; `false` means the client's buffer is
    /// full (or the connection is gone).
    pub fn try_heartbeat(&self, load: usize) -> bool {
        if self.is_closed() {
            return false;
        }
        self.tx.try_send(heartbeat_frame(load)).is_ok()
    }

    pub async fn send_frame(&self, frame: &SseFrame) -> Result<(), ProxyError> {
        self.send_bytes(Bytes::from(encode_frame(frame))).await
    }

    pub async fn send_bytes(&self, bytes: Bytes) -> Result<(), ProxyError> {
        if self.aborted.load(Ordering::Relaxed) {
            return Err(ProxyError::ClientAborted);
        }
        self.tx
            .send(bytes)
            .await
            .map_err(|_| ProxyError::ClientAborted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_is_flat_below_threshold() {
        assert_eq!(heartbeat_payload_size(0), MIN_PAYLOAD);
        assert_eq!(heartbeat_payload_size(LOAD_THRESHOLD), MIN_PAYLOAD);
    }

    #[test]
    fn payload_grows_quadratically_then_saturates() {
        let just_over = heartbeat_payload_size(LOAD_THRESHOLD + 1);
        assert_eq!(just_over, MIN_PAYLOAD + 4);
        assert_eq!(heartbeat_payload_size(LOAD_THRESHOLD + 1000), MAX_PAYLOAD);
    }

    #[tokio::test]
    async fn heartbeats_fail_once_buffer_is_full() {
        let (handle, _rx) = StreamHandle::new(2);
        assert!(handle.try_heartbeat(0));
        assert!(handle.try_heartbeat(0));
        // Receiver never drains; third write has no room.
        assert!(!handle.try_heartbeat(0));
    }

    #[tokio::test]
    async fn destroyed_handle_rejects_sends() {
        let (handle, _rx) = StreamHandle::new(4);
        handle.destroy();
        let err = handle.send_bytes(Bytes::from_static(b"x")).await.unwrap_err();
        assert!(matches!(err, ProxyError::ClientAborted));
        assert!(!handle.try_heartbeat(0));
    }
}

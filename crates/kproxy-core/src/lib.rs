//! The proxy pipeline: preprocess → enqueue → dequeue → mutate → dispatch →
//! response-handle, with reversible per-attempt mutations so a failed attempt
//! can be retried transparently.

pub mod classify;
pub mod client;
pub mod dispatch;
pub mod engine;
pub mod handle;
pub mod manager;
pub mod mutate;
pub mod preprocess;
pub mod queue;
pub mod request;
pub mod state;
pub mod tokens;

pub use classify::Verdict;
pub use client::{
    UpstreamClient, UpstreamFailure, UpstreamRequest, UpstreamResponse, UpstreamResponseBody,
    WreqUpstreamClient,
};
pub use engine::ProxyEngine;
pub use handle::{CompletedResponse, Outcome, StreamSession};
pub use manager::RequestManager;
pub use queue::{RequestQueue, StreamHandle};
pub use request::{ProxyRequest, SignedRequest};
pub use state::AppState;

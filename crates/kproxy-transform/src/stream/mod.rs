//! Streaming translation pipeline.
//!
//! Upstream bytes are decoded (SSE lines or AWS event-stream frames) by the
//! core crate; each event payload lands here. A [`StreamAdapter`] turns
//! provider events into internal chunks, a [`StreamEmitter`] renders chunks
//! in the client's format, and a [`StreamAggregator`] concurrently assembles
//! the canonical final response for post-stream accounting.

mod adapt;
mod aggregate;
mod emit;

pub use adapt::StreamAdapter;
pub use aggregate::StreamAggregator;
pub use emit::StreamEmitter;

use kproxy_protocol::openai::ChatCompletionChunk;

/// One decoded upstream streaming event, normalized to the internal model.
#[derive(Debug, Clone)]
pub enum StreamItem {
    Chunk(ChatCompletionChunk),
    /// Upstream signalled end-of-stream.
    Done,
    /// Provider emitted an in-band error event; classification happens in the
    /// response handler.
    UpstreamError { error_type: String, message: String },
}

//! Schema translation between API formats.
//!
//! Requests are translated once, before enqueue. Responses are translated on
//! the way back out. Streaming goes through the internal event model (the
//! OpenAI chat completion chunk): one adapter per upstream format produces
//! chunks, one emitter/aggregator per client format consumes them, so the
//! pipeline needs N + M pieces instead of N × M transformers.

pub mod error;
pub mod request;
pub mod response;
pub mod spoof;
pub mod stream;

pub use error::TransformError;
pub use request::transform_request;
pub use response::transform_response;
pub use stream::{StreamAdapter, StreamAggregator, StreamEmitter, StreamItem};

pub(crate) fn map_anthropic_stop_reason(reason: &str) -> &'static str {
    match reason {
        "max_tokens" => "length",
        "end_turn" | "stop_sequence" => "stop",
        _ => "stop",
    }
}

pub(crate) fn map_openai_finish_reason(reason: &str) -> &'static str {
    match reason {
        "length" => "max_tokens",
        _ => "end_turn",
    }
}

pub(crate) fn map_google_finish_reason(reason: &str) -> &'static str {
    match reason {
        "MAX_TOKENS" => "length",
        "SAFETY" | "RECITATION" => "content_filter",
        _ => "stop",
    }
}

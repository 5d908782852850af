//! Error rendering for both response modes. Errors become spoofed
//! completions so chat frontends show them in-line.

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use kproxy_common::{ApiFormat, ProxyError};
use kproxy_core::StreamHandle;
use kproxy_transform::spoof;

pub fn error_response(format: ApiFormat, error: &ProxyError) -> Response {
    let status = StatusCode::from_u16(error.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = spoof::spoof_completion(format, &error.to_string());
    let mut response = (status, body.to_string()).into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

/// After SSE headers are out, errors are written as a spoofed event sequence
/// followed by the format's terminator.
pub async fn stream_error(handle: &StreamHandle, format: ApiFormat, error: &ProxyError) {
    for frame in spoof::spoof_stream(format, &error.to_string()) {
        if handle.send_frame(&frame).await.is_err() {
            return;
        }
    }
}

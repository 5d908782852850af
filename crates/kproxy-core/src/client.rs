//! Upstream egress.
//!
//! The engine talks to providers through [`UpstreamClient`]; the one real
//! implementation wraps `wreq` (with transparent response decompression via
//! client features). The same client object also serves the checker's
//! [`ProbeClient`] seam so probes, OAuth exchanges and live traffic share a
//! connection pool.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use kproxy_common::redact_hostnames;
use kproxy_keys::{ProbeClient, ProbeError, ProbeRequest, ProbeResponse};
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: &'static str,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
    pub stream: bool,
}

#[derive(Debug)]
pub enum UpstreamResponseBody {
    Full(Bytes),
    /// Chunks as they arrive; an `Err` item ends the stream.
    Stream(mpsc::Receiver<Result<Bytes, String>>),
}

#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: UpstreamResponseBody,
}

impl UpstreamResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Transport-level failure: no HTTP response was obtained. Hostnames are
/// redacted before the message can reach a client.
#[derive(Debug, Clone)]
pub struct UpstreamFailure {
    pub message: String,
    pub timed_out: bool,
}

impl UpstreamFailure {
    fn from_error(err: &wreq::Error) -> Self {
        Self {
            message: redact_hostnames(&err.to_string()),
            timed_out: err.is_timeout(),
        }
    }
}

impl std::fmt::Display for UpstreamFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "upstream transport failure: {}", self.message)
    }
}

#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse, UpstreamFailure>;
}

pub struct WreqUpstreamClient {
    client: wreq::Client,
    stream_idle_timeout: Duration,
}

impl WreqUpstreamClient {
    pub fn new(proxy: Option<&str>) -> Result<Self, wreq::Error> {
        let mut builder = wreq::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30 * 60));
        if let Some(proxy) = proxy.filter(|value| !value.trim().is_empty()) {
            builder = builder.proxy(wreq::Proxy::all(proxy)?);
        }
        Ok(Self {
            client: builder.build()?,
            stream_idle_timeout: Duration::from_secs(60),
        })
    }

    fn build(&self, request: &UpstreamRequest) -> Result<wreq::RequestBuilder, UpstreamFailure> {
        let method = match request.method {
            "GET" => wreq::Method::GET,
            "PUT" => wreq::Method::PUT,
            "DELETE" => wreq::Method::DELETE,
            _ => wreq::Method::POST,
        };
        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }
        Ok(builder)
    }
}

#[async_trait]
impl UpstreamClient for WreqUpstreamClient {
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse, UpstreamFailure> {
        let want_stream = request.stream;
        let response = self
            .build(&request)?
            .send()
            .await
            .map_err(|err| UpstreamFailure::from_error(&err))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();

        // Error responses are buffered whole so the classifier can read them.
        if !want_stream || !(200..300).contains(&status) {
            let body = response
                .bytes()
                .await
                .map_err(|err| UpstreamFailure::from_error(&err))?;
            return Ok(UpstreamResponse {
                status,
                headers,
                body: UpstreamResponseBody::Full(body),
            });
        }

        let idle = self.stream_idle_timeout;
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            loop {
                let next = tokio::time::timeout(idle, stream.next()).await;
                match next {
                    Ok(Some(Ok(chunk))) => {
                        if tx.send(Ok(chunk)).await.is_err() {
                            return;
                        }
                    }
                    Ok(Some(Err(err))) => {
                        let _ = tx.send(Err(redact_hostnames(&err.to_string()))).await;
                        return;
                    }
                    Ok(None) => return,
                    Err(_) => {
                        let _ = tx.send(Err("stream idle timeout".to_string())).await;
                        return;
                    }
                }
            }
        });
        Ok(UpstreamResponse {
            status,
            headers,
            body: UpstreamResponseBody::Stream(rx),
        })
    }
}

#[async_trait]
impl ProbeClient for WreqUpstreamClient {
    async fn send(&self, request: ProbeRequest) -> Result<ProbeResponse, ProbeError> {
        let upstream = UpstreamRequest {
            method: request.method,
            url: request.url,
            headers: request.headers,
            body: request.body.map(Bytes::from),
            stream: false,
        };
        let response = UpstreamClient::send(self, upstream)
            .await
            .map_err(|failure| ProbeError(failure.message))?;
        let body = match response.body {
            UpstreamResponseBody::Full(bytes) => bytes,
            UpstreamResponseBody::Stream(_) => Bytes::new(),
        };
        Ok(ProbeResponse {
            status: response.status,
            headers: response.headers,
            body,
        })
    }
}

/// Test stub that fails every call; used where the upstream must not be
/// reached at all.
pub struct StubFailClient;

#[async_trait]
impl UpstreamClient for StubFailClient {
    async fn send(&self, _request: UpstreamRequest) -> Result<UpstreamResponse, UpstreamFailure> {
        Err(UpstreamFailure {
            message: "no upstream in this configuration".to_string(),
            timed_out: false,
        })
    }
}

#[async_trait]
impl ProbeClient for StubFailClient {
    async fn send(&self, _request: ProbeRequest) -> Result<ProbeResponse, ProbeError> {
        Err(ProbeError("no upstream in this configuration".to_string()))
    }
}

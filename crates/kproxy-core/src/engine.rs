//! Request lifecycle orchestration: preprocess once, then loop through
//! enqueue → dequeue → mutate → dispatch → response-handle until the request
//! completes, fails terminally, or is aborted.

use kproxy_common::ProxyError;
use tokio::time::Instant;

use crate::handle::{self, CompletedResponse, Outcome, StreamSession};
use crate::manager::RequestManager;
use crate::queue::StreamHandle;
use crate::request::ProxyRequest;
use crate::state::AppState;
use crate::{dispatch, mutate, preprocess};

pub struct ProxyEngine {
    state: AppState,
}

impl ProxyEngine {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Drive one request to completion. For streaming requests, frames are
    /// written through `stream` as they materialize and the returned body is
    /// the aggregated final response (for accounting and logging only).
    pub async fn handle(
        &self,
        mut request: ProxyRequest,
        stream: Option<StreamHandle>,
    ) -> Result<CompletedResponse, ProxyError> {
        preprocess::run(&self.state, &mut request).await?;
        if request.streaming && stream.is_none() {
            return Err(ProxyError::BadRequest(
                "streaming request without a stream channel".to_string(),
            ));
        }

        let mut session = request
            .streaming
            .then(|| StreamSession::new(request.inbound_format));
        let mut manager = RequestManager::new(request);

        loop {
            if let Some(handle) = &stream
                && handle.is_closed()
            {
                return Err(ProxyError::ClientAborted);
            }

            let rejoin = manager.request().retry_count > 0;
            let ticket = self
                .state
                .queue
                .enqueue(manager.request(), stream.as_ref(), rejoin)
                .await?;
            ticket.granted().await?;
            manager.scheduling_mut().queue_out_time = Some(Instant::now());

            // Mutator failures surface immediately; only the response
            // classifier may trigger a retry.
            mutate::apply(&self.state, &mut manager).await?;
            let upstream_request = dispatch::build(manager.request())?;
            let result = self.state.client.send(upstream_request).await;

            let stream_ctx = match (&stream, &mut session) {
                (Some(handle), Some(session)) => Some((handle, &mut *session)),
                _ => None,
            };
            match handle::process(&self.state, &mut manager, result, stream_ctx).await? {
                Outcome::Done(response) => return Ok(response),
                Outcome::Retry => {
                    let retry = manager.scheduling_mut();
                    retry.retry_count += 1;
                    tracing::info!(
                        id = %retry.id,
                        retries = retry.retry_count,
                        family = %retry.model_family,
                        "re-enqueueing after retryable upstream failure"
                    );
                }
            }
        }
    }
}

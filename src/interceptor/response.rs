//! Authentication failure detection and recovery

use crate::coordinator::{RefreshCoordinator, RefreshHandle};
use crate::error::{ClientError, Result};
use crate::transport::SharedTransport;
use crate::types::{ApiRequest, ApiResponse, ClientOptions};
use std::sync::Arc;

/// Turns trigger-status responses into a refresh followed by one replay.
///
/// For each request:
///
/// ```text
/// response ──▶ not a trigger status ─────────────────────────────▶ pass through
///    │
///    └──▶ trigger ──▶ retry budget spent ─────────────────────────▶ AuthRetryFailed
///                 └─▶ start_or_join ──▶ owner:  refresh ─┬─▶ replay ─▶ (loop)
///                                   └─▶ joiner: wait ────┘
/// ```
///
/// The budget lives on the request itself (`ApiRequest::retry_count`), so a
/// replay that is rejected again can never start another cycle once the
/// budget is spent.
#[derive(Clone)]
pub struct ResponseInterceptor {
    coordinator: RefreshCoordinator,
    transport: SharedTransport,
    options: Arc<ClientOptions>,
}

impl ResponseInterceptor {
    /// Create an interceptor
    #[must_use]
    pub fn new(
        coordinator: RefreshCoordinator,
        transport: SharedTransport,
        options: Arc<ClientOptions>,
    ) -> Self {
        Self {
            coordinator,
            transport,
            options,
        }
    }

    /// Inspect the outcome of sending `request` and recover from auth failures.
    ///
    /// Transport errors pass through untouched.
    ///
    /// # Errors
    ///
    /// - `ClientError::AuthRefreshFailed` if the refresh this request started
    ///   or joined failed
    /// - `ClientError::AuthRetryFailed` if the replay was rejected again
    /// - `ClientError::Transport` if the replay itself failed on the wire
    /// - `ClientError::RequestCancelled` if the client shut down meanwhile
    pub async fn intercept(
        &self,
        request: ApiRequest,
        outcome: Result<ApiResponse>,
    ) -> Result<ApiResponse> {
        let mut request = request;
        let mut response = outcome?;

        loop {
            let status = response.status_code();
            if request.skip_auth || !self.options.is_trigger(status) {
                return Ok(response);
            }

            if request.retry_count >= self.options.max_auth_retries {
                if request.retry_count == 0 {
                    // Replays disabled; the caller sees the server's answer
                    return Ok(response);
                }
                tracing::warn!(
                    request_id = %request.id(),
                    status,
                    retries = request.retry_count,
                    "Request still rejected after token refresh"
                );
                return Err(ClientError::auth_retry_failed(status));
            }

            let replay = self.recover(request.for_replay()).await?;
            response = self.transport.send(&replay).await?;
            request = replay;
        }
    }

    /// Obtain a fresh token for `replay`, either by driving the refresh or by
    /// waiting on the one already in flight.
    async fn recover(&self, replay: ApiRequest) -> Result<ApiRequest> {
        match self.coordinator.start_or_join(replay) {
            RefreshHandle::Owner(owner, mut replay) => {
                let sent_with = replay.authorization().map(str::to_string);
                let token = owner.run_detached(sent_with).await?;
                replay.set_bearer(self.coordinator.token_type(), &token)?;
                Ok(replay)
            }
            RefreshHandle::Joiner(pending) => pending.wait().await,
        }
    }
}

impl std::fmt::Debug for ResponseInterceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseInterceptor")
            .field("coordinator", &self.coordinator)
            .field("trigger_statuses", &self.options.trigger_statuses)
            .field("max_auth_retries", &self.options.max_auth_retries)
            .finish_non_exhaustive()
    }
}

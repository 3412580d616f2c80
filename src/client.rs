//! `AuthClient`: the caller-facing authenticated HTTP client
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         AuthClient                           │
//! │                                                              │
//! │  ┌────────────────────┐            ┌─────────────────────┐   │
//! │  │ RequestInterceptor │            │ ResponseInterceptor │   │
//! │  │ • attach token     │            │ • detect 401        │   │
//! │  │ • park if refreshing│           │ • refresh / join    │   │
//! │  └─────────┬──────────┘            │ • replay once       │   │
//! │            │                       └──────────┬──────────┘   │
//! │            │      ┌────────────────────┐      │              │
//! │            └─────▶│ RefreshCoordinator │◀─────┘              │
//! │                   │ (Arc<Mutex<state>>)│                     │
//! │                   └────────────────────┘                     │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each client owns its own coordinator, so independent clients in one
//! process never share refresh state. Clones of one client do.
//!
//! # Example
//!
//! ```no_run
//! use auth_refresh_client::{AuthClient, ClientOptions};
//! use auth_refresh_client::auth::{HttpTokenRefresher, MemoryTokenStorage};
//! use std::sync::Arc;
//!
//! # async fn example() -> auth_refresh_client::Result<()> {
//! let options = ClientOptions::builder()
//!     .base_url("https://api.example.com/v1")
//!     .build();
//! let storage = Arc::new(MemoryTokenStorage::with_tokens(Some("access"), Some("refresh")));
//! let refresher = Arc::new(
//!     HttpTokenRefresher::builder("https://auth.example.com/oauth/token").build()?,
//! );
//!
//! let client = AuthClient::new(options, storage, refresher)?;
//! let me: serde_json::Value = client.get("/me").await?.json()?;
//! println!("{me}");
//!
//! client.shutdown();
//! # Ok(())
//! # }
//! ```

use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::auth::{SharedTokenRefresher, SharedTokenStorage};
use crate::coordinator::{CoordinatorSettings, RefreshCoordinator};
use crate::error::{ClientError, Result};
use crate::interceptor::{RequestInterceptor, ResponseInterceptor};
use crate::transport::{ReqwestTransport, SharedTransport};
use crate::types::{ApiRequest, ApiResponse, ClientOptions};

/// Authenticated HTTP client with single-flight token refresh
///
/// Every request either resolves with a response or fails with one of the
/// [`ClientError`] kinds; the refresh machinery is never visible to callers.
/// Cloning is cheap and clones share refresh state and shutdown.
#[derive(Clone)]
pub struct AuthClient {
    options: Arc<ClientOptions>,
    transport: SharedTransport,
    coordinator: RefreshCoordinator,
    request_interceptor: RequestInterceptor,
    response_interceptor: ResponseInterceptor,
    /// Cancelled by `shutdown`; aborts every in-flight call
    cancellation_token: CancellationToken,
}

impl AuthClient {
    /// Create a client that sends requests with reqwest
    ///
    /// # Errors
    /// Returns `ClientError::InvalidConfig` if the options are invalid
    pub fn new(
        options: ClientOptions,
        storage: SharedTokenStorage,
        refresher: SharedTokenRefresher,
    ) -> Result<Self> {
        let transport = Arc::new(ReqwestTransport::new(&options)?);
        Self::with_transport(options, storage, refresher, transport)
    }

    /// Create a client over a custom transport
    ///
    /// # Errors
    /// Returns `ClientError::InvalidConfig` if the options are invalid
    pub fn with_transport(
        options: ClientOptions,
        storage: SharedTokenStorage,
        refresher: SharedTokenRefresher,
        transport: SharedTransport,
    ) -> Result<Self> {
        options.validate()?;

        let options = Arc::new(options);
        let cancellation_token = CancellationToken::new();
        let coordinator = RefreshCoordinator::with_cancellation_token(
            storage,
            refresher,
            CoordinatorSettings::from(options.as_ref()),
            cancellation_token.clone(),
        );
        let request_interceptor = RequestInterceptor::new(coordinator.clone());
        let response_interceptor = ResponseInterceptor::new(
            coordinator.clone(),
            Arc::clone(&transport),
            Arc::clone(&options),
        );

        Ok(Self {
            options,
            transport,
            coordinator,
            request_interceptor,
            response_interceptor,
            cancellation_token,
        })
    }

    /// Send a request through both interceptors
    ///
    /// # Errors
    /// - `ClientError::AuthRefreshFailed` if the token could not be refreshed
    /// - `ClientError::AuthRetryFailed` if the server rejected the replay
    /// - `ClientError::Transport` for network and storage failures
    /// - `ClientError::RequestCancelled` if the client is or gets shut down
    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse> {
        if self.cancellation_token.is_cancelled() {
            return Err(ClientError::RequestCancelled);
        }

        tokio::select! {
            biased;
            () = self.cancellation_token.cancelled() => {
                tracing::debug!("Request aborted by client shutdown");
                Err(ClientError::RequestCancelled)
            }
            result = self.dispatch(request) => result,
        }
    }

    async fn dispatch(&self, request: ApiRequest) -> Result<ApiResponse> {
        let prepared = self.request_interceptor.intercept(request).await?;
        let outcome = self.transport.send(&prepared).await;
        self.response_interceptor.intercept(prepared, outcome).await
    }

    /// `GET path`
    ///
    /// # Errors
    /// See [`AuthClient::send`]
    pub async fn get(&self, path: &str) -> Result<ApiResponse> {
        self.send(ApiRequest::get(path)).await
    }

    /// `DELETE path`
    ///
    /// # Errors
    /// See [`AuthClient::send`]
    pub async fn delete(&self, path: &str) -> Result<ApiResponse> {
        self.send(ApiRequest::delete(path)).await
    }

    /// `POST path` with a JSON body
    ///
    /// # Errors
    /// See [`AuthClient::send`]; also `InvalidConfig` if `body` fails to serialize
    pub async fn post_json<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> Result<ApiResponse> {
        self.send(ApiRequest::post(path).with_json(body)?).await
    }

    /// `PUT path` with a JSON body
    ///
    /// # Errors
    /// See [`AuthClient::post_json`]
    pub async fn put_json<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> Result<ApiResponse> {
        self.send(ApiRequest::put(path).with_json(body)?).await
    }

    /// `PATCH path` with a JSON body
    ///
    /// # Errors
    /// See [`AuthClient::post_json`]
    pub async fn patch_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<ApiResponse> {
        self.send(ApiRequest::patch(path).with_json(body)?).await
    }

    /// Tear the client down.
    ///
    /// Requests waiting on a refresh are rejected with `RequestCancelled`,
    /// refresh state is reset to Idle, the refresh task in flight is aborted,
    /// and every later or still running call on this client (and its clones)
    /// fails with `RequestCancelled`. Returns the number of queued requests
    /// that were rejected.
    pub fn shutdown(&self) -> usize {
        // Reject the queue first so the aborted refresh task finds nothing to settle
        let rejected = self.coordinator.cancel_all();
        self.cancellation_token.cancel();
        rejected
    }

    /// Whether `shutdown` has been called
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    /// Whether a refresh is in flight
    #[must_use]
    pub fn is_refreshing(&self) -> bool {
        self.coordinator.is_refreshing()
    }

    /// Number of requests parked on the in-flight refresh
    #[must_use]
    pub fn pending_waiters(&self) -> usize {
        self.coordinator.pending_len()
    }

    /// Number of refresher invocations over the client's lifetime
    #[must_use]
    pub fn refresh_count(&self) -> u64 {
        self.coordinator.refresh_count()
    }

    /// Client options
    #[must_use]
    pub fn options(&self) -> &ClientOptions {
        &self.options
    }
}

impl std::fmt::Debug for AuthClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthClient")
            .field("options", &self.options)
            .field("coordinator", &self.coordinator)
            .field("shut_down", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}

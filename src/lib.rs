//! # Authenticated HTTP client with single-flight token refresh
//!
//! Issues API calls with a bearer access token and survives token expiry:
//! when the server answers `401`, the client refreshes credentials once,
//! however many requests failed concurrently, and replays each failed request
//! with the new token.
//!
//! ## Quick Start
//!
//! ```no_run
//! use auth_refresh_client::{AuthClient, ClientOptions};
//! use auth_refresh_client::auth::{FileTokenStorage, HttpTokenRefresher};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let options = ClientOptions::builder()
//!         .base_url("https://api.example.com/v1")
//!         .build();
//!
//!     let client = AuthClient::new(
//!         options,
//!         Arc::new(FileTokenStorage::new()),
//!         Arc::new(HttpTokenRefresher::builder("https://auth.example.com/oauth/token").build()?),
//!     )?;
//!
//!     let response = client.get("/me").await?;
//!     println!("{}", response.text());
//!     Ok(())
//! }
//! ```
//!
//! ## Guarantees
//!
//! - **At most one refresh**: concurrent `401`s share a single refresher call.
//! - **No lost requests**: every request parked on a refresh is resumed or
//!   rejected exactly once when that refresh settles.
//! - **Fresh tokens only**: resumed requests carry the newly issued token.
//! - **Bounded retry**: a request is replayed at most `max_auth_retries`
//!   times (default 1); a replay that is rejected again fails with
//!   [`ClientError::AuthRetryFailed`].
//! - **Clean failure**: a failed refresh clears stored tokens before any
//!   waiting request sees the error.
//!
//! ## Architecture
//!
//! - [`coordinator`]: the single-flight refresh state machine
//! - [`interceptor`]: request (attach / park) and response (refresh / replay) stages
//! - [`auth`]: token storage and refresher collaborators
//! - [`transport`]: HTTP transport abstraction and reqwest implementation
//! - [`client`]: the caller-facing [`AuthClient`]
//! - [`types`]: identifiers, credentials, request/response and options
//! - [`error`]: error types
//!
//! ## Logging
//!
//! This crate uses [`tracing`](https://crates.io/crates/tracing) for structured logging.
//! Token values are never logged. To see events, attach a subscriber:
//!
//! ```rust,ignore
//! tracing_subscriber::fmt::init();
//! ```
//!
//! ## Error Handling
//!
//! All fallible operations return [`Result<T, ClientError>`](Result):
//!
//! ```no_run
//! # use auth_refresh_client::{AuthClient, ClientError};
//! # async fn example(client: AuthClient) {
//! match client.get("/me").await {
//!     Ok(response) => { /* ... */ }
//!     Err(e) if e.is_auth_failure() => {
//!         eprintln!("Session expired, please sign in again");
//!     }
//!     Err(e) => {
//!         eprintln!("Error: {}", e);
//!     }
//! }
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod auth;
pub mod client;
pub mod coordinator;
pub mod error;
pub mod interceptor;
pub mod transport;
pub mod types;

// Re-export commonly used types
pub use auth::{
    FileTokenStorage, HttpTokenRefresher, MemoryTokenStorage, TokenRefresher, TokenStorage,
};
pub use client::AuthClient;
pub use coordinator::{Phase, RefreshCoordinator};
pub use error::{ClientError, Result};
pub use transport::{ReqwestTransport, Transport};
pub use types::{
    AccessToken, ApiRequest, ApiResponse, ClientOptions, RefreshToken, RequestId, TokenPair,
};

/// Version of the crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! Error types for the authenticated client

use thiserror::Error;

/// Main error type surfaced to callers of [`AuthClient`](crate::AuthClient)
///
/// Every variant carries only sanitized text: no Authorization header value
/// and no request body ever ends up in an error message. The type is `Clone`
/// so a single refresh failure can be fanned out to every waiting request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// Refresh token missing, invalid, revoked, or the refresh call failed
    #[error("Authentication refresh failed: {0}")]
    AuthRefreshFailed(String),

    /// Server still rejected the request after a successful refresh
    #[error("Request rejected after token refresh (status {status})")]
    AuthRetryFailed {
        /// Status code returned by the replayed request
        status: u16,
    },

    /// Underlying network, HTTP or storage failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Client was shut down while the request was waiting on a refresh
    #[error("Request cancelled: client shut down while waiting for token refresh")]
    RequestCancelled,

    /// Token storage backend failure
    #[error("Token storage error: {0}")]
    Storage(String),

    /// Invalid configuration or request descriptor
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, ClientError>;

impl ClientError {
    /// Create a refresh failure
    pub fn auth_refresh_failed(msg: impl Into<String>) -> Self {
        Self::AuthRefreshFailed(msg.into())
    }

    /// Create a retry failure for the status the replay received
    #[must_use]
    pub fn auth_retry_failed(status: u16) -> Self {
        Self::AuthRetryFailed { status }
    }

    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create an invalid configuration error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a cancellation error
    #[must_use]
    pub fn cancelled() -> Self {
        Self::RequestCancelled
    }

    /// Normalize storage failures into transport errors.
    ///
    /// Storage is an external resource from the caller's point of view, so its
    /// failures surface the same way network failures do.
    #[must_use]
    pub fn into_transport(self) -> Self {
        match self {
            Self::Storage(msg) => Self::Transport(format!("token storage: {msg}")),
            other => other,
        }
    }

    /// True for errors that mean the user must sign in again
    #[must_use]
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            Self::AuthRefreshFailed(_) | Self::AuthRetryFailed { .. }
        )
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        // reqwest errors embed the URL; strip it so query-string secrets never leak
        Self::Transport(err.without_url().to_string())
    }
}

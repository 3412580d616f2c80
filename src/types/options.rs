//! Client configuration options

use reqwest::header::HeaderMap;
use std::sync::Arc;
use std::time::Duration;
use typed_builder::TypedBuilder;

use crate::error::{ClientError, Result};

/// Default per-request transport timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default upper bound on one refresh execution
pub const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(30);

/// Status codes that trigger a refresh unless configured otherwise
pub const DEFAULT_TRIGGER_STATUSES: &[u16] = &[401];

// ============================================================================
// Session Expired Callback
// ============================================================================

/// Callback invoked once per failed refresh cycle, after stored tokens have
/// been cleared.
///
/// Host applications typically use it to route the user back to sign-in.
pub type SessionExpiredCallback = Arc<dyn Fn(&ClientError) + Send + Sync>;

// ============================================================================
// Client Options
// ============================================================================

/// Options for [`AuthClient`](crate::AuthClient)
#[derive(Clone, TypedBuilder)]
#[builder(
    builder_method(doc = "Create a new builder for ClientOptions"),
    builder_type(doc = "Builder for ClientOptions", vis = "pub"),
    build_method(doc = "Build the ClientOptions")
)]
pub struct ClientOptions {
    /// Base URL that relative request paths are joined onto
    #[builder(setter(into))]
    pub base_url: String,

    /// Per-request transport timeout
    #[builder(default = DEFAULT_TIMEOUT)]
    pub timeout: Duration,

    /// Response statuses that start or join a token refresh
    #[builder(default = DEFAULT_TRIGGER_STATUSES.to_vec(), setter(into))]
    pub trigger_statuses: Vec<u16>,

    /// How many times one request may be replayed after a refresh
    #[builder(default = 1)]
    pub max_auth_retries: u8,

    /// Upper bound on one refresh execution; `None` waits indefinitely
    #[builder(default = Some(DEFAULT_REFRESH_TIMEOUT))]
    pub refresh_timeout: Option<Duration>,

    /// Authorization scheme prefix
    #[builder(default = "Bearer".to_string(), setter(into))]
    pub token_type: String,

    /// Headers added to every request
    #[builder(default)]
    pub default_headers: HeaderMap,

    /// Called after a failed refresh has cleared stored tokens
    #[builder(default, setter(strip_option))]
    pub on_session_expired: Option<SessionExpiredCallback>,
}

impl ClientOptions {
    /// Whether `status` should trigger the refresh flow
    #[must_use]
    pub fn is_trigger(&self, status: u16) -> bool {
        self.trigger_statuses.contains(&status)
    }

    /// Check the options for values the client cannot work with
    ///
    /// # Errors
    ///
    /// Returns `ClientError::InvalidConfig` describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        reqwest::Url::parse(&self.base_url).map_err(|e| {
            ClientError::invalid_config(format!("invalid base URL '{}': {e}", self.base_url))
        })?;

        if let Some(status) = self
            .trigger_statuses
            .iter()
            .find(|s| !(400..=599).contains(*s))
        {
            return Err(ClientError::invalid_config(format!(
                "trigger status {status} is not an error status"
            )));
        }

        if self.token_type.trim().is_empty() {
            return Err(ClientError::invalid_config("token type must not be empty"));
        }

        if self.timeout.is_zero() {
            return Err(ClientError::invalid_config("timeout must be non-zero"));
        }

        Ok(())
    }
}

impl std::fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientOptions")
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .field("trigger_statuses", &self.trigger_statuses)
            .field("max_auth_retries", &self.max_auth_retries)
            .field("refresh_timeout", &self.refresh_timeout)
            .field("token_type", &self.token_type)
            .field("default_headers", &self.default_headers)
            .field(
                "on_session_expired",
                &self.on_session_expired.as_ref().map(|_| "<callback>"),
            )
            .finish()
    }
}

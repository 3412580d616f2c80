//! Token refresh strategies
//!
//! A [`TokenRefresher`] exchanges a refresh token for a new token pair. The
//! refresh coordinator calls it at most once per refresh cycle, no matter how
//! many requests are waiting on the outcome.

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{ClientError, Result};
use crate::types::request::body_excerpt;
use crate::types::{RefreshToken, TokenPair};

// ============================================================================
// Refresher Trait
// ============================================================================

/// Exchanges a refresh token for a new access/refresh token pair.
///
/// # Example
///
/// ```no_run
/// use auth_refresh_client::auth::TokenRefresher;
/// use auth_refresh_client::types::{RefreshToken, TokenPair};
/// use auth_refresh_client::Result;
/// use async_trait::async_trait;
///
/// struct StaticRefresher;
///
/// #[async_trait]
/// impl TokenRefresher for StaticRefresher {
///     async fn refresh(&self, _refresh_token: &RefreshToken) -> Result<TokenPair> {
///         Ok(TokenPair::new("fresh-access", None))
///     }
/// }
/// ```
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    /// Obtain a new token pair.
    ///
    /// Returning `refresh_token: None` keeps the currently stored refresh token.
    async fn refresh(&self, refresh_token: &RefreshToken) -> Result<TokenPair>;
}

#[async_trait]
impl<T: TokenRefresher + ?Sized> TokenRefresher for Arc<T> {
    async fn refresh(&self, refresh_token: &RefreshToken) -> Result<TokenPair> {
        (**self).refresh(refresh_token).await
    }
}

/// Type alias for a shared refresher.
pub type SharedTokenRefresher = Arc<dyn TokenRefresher>;

// ============================================================================
// Closure-based refresher
// ============================================================================

/// Wrapper to convert a closure into a [`TokenRefresher`].
///
/// # Example
///
/// ```no_run
/// use auth_refresh_client::auth::FnTokenRefresher;
/// use auth_refresh_client::types::TokenPair;
///
/// let refresher = FnTokenRefresher::new(|refresh_token| {
///     Box::pin(async move {
///         let _ = refresh_token.expose();
///         Ok(TokenPair::new("new-access", None))
///     })
/// });
/// ```
pub struct FnTokenRefresher<F>
where
    F: Fn(RefreshToken) -> BoxFuture<'static, Result<TokenPair>> + Send + Sync,
{
    func: F,
}

impl<F> FnTokenRefresher<F>
where
    F: Fn(RefreshToken) -> BoxFuture<'static, Result<TokenPair>> + Send + Sync,
{
    /// Create a new function-based refresher.
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<F> TokenRefresher for FnTokenRefresher<F>
where
    F: Fn(RefreshToken) -> BoxFuture<'static, Result<TokenPair>> + Send + Sync,
{
    async fn refresh(&self, refresh_token: &RefreshToken) -> Result<TokenPair> {
        (self.func)(refresh_token.clone()).await
    }
}

/// Create a shared refresher from an async closure.
pub fn refresher_fn<F, Fut>(f: F) -> SharedTokenRefresher
where
    F: Fn(RefreshToken) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<TokenPair>> + Send + 'static,
{
    Arc::new(FnTokenRefresher::new(move |refresh_token| {
        Box::pin(f(refresh_token))
    }))
}

// ============================================================================
// HTTP refresher
// ============================================================================

/// Refresh endpoint configuration
#[derive(Debug, Clone)]
pub struct RefreshEndpointConfig {
    /// Token endpoint URL
    pub token_url: String,
    /// OAuth client ID sent with the refresh grant, if the server expects one
    pub client_id: Option<String>,
    /// Request timeout for the refresh call
    pub timeout: Duration,
}

impl RefreshEndpointConfig {
    /// Configuration for `token_url` with no client ID and a 30 second timeout
    pub fn new(token_url: impl Into<String>) -> Self {
        Self {
            token_url: token_url.into(),
            client_id: None,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Successful response from the token endpoint
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// Error response from the token endpoint
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Builder for [`HttpTokenRefresher`]
#[derive(Debug)]
pub struct HttpTokenRefresherBuilder {
    config: RefreshEndpointConfig,
    http_client: Option<reqwest::Client>,
}

impl HttpTokenRefresherBuilder {
    /// Set the OAuth client ID
    #[must_use]
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.config.client_id = Some(client_id.into());
        self
    }

    /// Set the refresh call timeout
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Use a preconfigured reqwest client
    #[must_use]
    pub fn http_client(mut self, client: reqwest::Client) -> Self {
        self.http_client = Some(client);
        self
    }

    /// Build the refresher
    ///
    /// # Errors
    ///
    /// Returns `ClientError::InvalidConfig` if the token URL does not parse or
    /// the HTTP client cannot be constructed.
    pub fn build(self) -> Result<HttpTokenRefresher> {
        reqwest::Url::parse(&self.config.token_url).map_err(|e| {
            ClientError::invalid_config(format!(
                "invalid token URL '{}': {e}",
                self.config.token_url
            ))
        })?;

        let http_client = match self.http_client {
            Some(client) => client,
            None => reqwest::Client::builder()
                .timeout(self.config.timeout)
                .build()
                .map_err(|e| {
                    ClientError::invalid_config(format!("failed to build HTTP client: {e}"))
                })?,
        };

        Ok(HttpTokenRefresher {
            config: self.config,
            http_client,
        })
    }
}

/// Refreshes tokens with an OAuth 2.0 `refresh_token` grant sent as JSON
#[derive(Debug, Clone)]
pub struct HttpTokenRefresher {
    config: RefreshEndpointConfig,
    http_client: reqwest::Client,
}

impl HttpTokenRefresher {
    /// Create a builder for the given token endpoint
    pub fn builder(token_url: impl Into<String>) -> HttpTokenRefresherBuilder {
        HttpTokenRefresherBuilder {
            config: RefreshEndpointConfig::new(token_url),
            http_client: None,
        }
    }

    /// Get the endpoint configuration
    #[must_use]
    pub fn config(&self) -> &RefreshEndpointConfig {
        &self.config
    }
}

#[async_trait]
impl TokenRefresher for HttpTokenRefresher {
    async fn refresh(&self, refresh_token: &RefreshToken) -> Result<TokenPair> {
        let mut body = serde_json::json!({
            "grant_type": "refresh_token",
            "refresh_token": refresh_token.expose(),
        });
        if let Some(client_id) = &self.config.client_id {
            body["client_id"] = serde_json::json!(client_id);
        }

        let response = self
            .http_client
            .post(&self.config.token_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                ClientError::auth_refresh_failed(format!(
                    "refresh request failed: {}",
                    e.without_url()
                ))
            })?;

        let status = response.status();
        let response_text = response.text().await.map_err(|e| {
            ClientError::auth_refresh_failed(format!(
                "failed to read refresh response: {}",
                e.without_url()
            ))
        })?;

        // OAuth error bodies take precedence over the status code
        if let Ok(error) = serde_json::from_str::<ErrorResponse>(&response_text) {
            let msg = error.error_description.unwrap_or(error.error);
            return Err(ClientError::auth_refresh_failed(msg));
        }

        if !status.is_success() {
            return Err(ClientError::auth_refresh_failed(format!(
                "refresh endpoint returned {status}: {}",
                body_excerpt(&response_text)
            )));
        }

        let token_response: TokenResponse = serde_json::from_str(&response_text).map_err(|e| {
            ClientError::auth_refresh_failed(format!("failed to parse refresh response: {e}"))
        })?;

        tracing::debug!(
            rotated = token_response.refresh_token.is_some(),
            "Refresh endpoint issued new access token"
        );

        Ok(TokenPair::new(
            token_response.access_token,
            token_response.refresh_token.map(RefreshToken::new),
        ))
    }
}

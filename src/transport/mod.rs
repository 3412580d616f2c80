//! Transport layer for sending requests
//!
//! This module provides the transport abstraction and the reqwest-backed
//! implementation. TLS, connection pooling and protocol negotiation are the
//! transport's business; the refresh machinery only sees [`ApiRequest`] in
//! and [`ApiResponse`] out.

pub mod http;

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;
use crate::types::{ApiRequest, ApiResponse};

/// Transport trait for performing one HTTP exchange
///
/// Implementations must not retry on their own and must return non-2xx
/// responses as `Ok`: status handling belongs to the response interceptor.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and return the response
    ///
    /// # Arguments
    /// * `request` - Fully prepared request (credentials already attached)
    ///
    /// # Errors
    /// Returns `ClientError::Transport` on network failure, or
    /// `ClientError::InvalidConfig` if the request cannot be built
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse> {
        (**self).send(request).await
    }
}

/// Type alias for a shared transport.
pub type SharedTransport = Arc<dyn Transport>;

/// Join a request path onto a base URL.
///
/// Absolute `http(s)://` paths are used as-is; everything else is appended to
/// the base with exactly one `/` between them.
pub(crate) fn resolve_url(base_url: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    if path.is_empty() {
        return base_url.to_string();
    }
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

pub use http::ReqwestTransport;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_url() {
        assert_eq!(
            resolve_url("https://api.example.com/v1", "users"),
            "https://api.example.com/v1/users"
        );
        assert_eq!(
            resolve_url("https://api.example.com/v1/", "/users"),
            "https://api.example.com/v1/users"
        );
        assert_eq!(
            resolve_url("https://api.example.com", "https://other.example.com/x"),
            "https://other.example.com/x"
        );
        assert_eq!(
            resolve_url("https://api.example.com", ""),
            "https://api.example.com"
        );
    }
}

//! Request and response descriptors
//!
//! [`ApiRequest`] is the replayable description of one outgoing call. It is
//! transport-agnostic: the [`Transport`](crate::transport::Transport) turns it
//! into a real HTTP exchange and hands back an [`ApiResponse`].

use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::identifiers::RequestId;
use super::token::AccessToken;
use crate::error::{ClientError, Result};

/// Longest body excerpt quoted in an error message
const BODY_EXCERPT_BYTES: usize = 160;

/// Shorten a response body for an error message.
///
/// Cuts on a UTF-8 boundary and marks the cut with `...`.
pub(crate) fn body_excerpt(body: &str) -> String {
    if body.len() <= BODY_EXCERPT_BYTES {
        return body.to_string();
    }
    let mut end = BODY_EXCERPT_BYTES;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}

/// Replayable request descriptor
#[derive(Clone)]
pub struct ApiRequest {
    id: RequestId,
    /// HTTP method
    pub method: Method,
    /// Path relative to the configured base URL, or an absolute URL
    pub path: String,
    /// Request headers
    pub headers: HeaderMap,
    /// Raw request body
    pub body: Option<Vec<u8>>,
    /// Number of times this request has already been replayed after a refresh
    pub retry_count: u8,
    /// Bypass token attachment and refresh handling entirely
    pub skip_auth: bool,
}

impl ApiRequest {
    /// Create a request with no headers and no body
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            id: RequestId::next(),
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            body: None,
            retry_count: 0,
            skip_auth: false,
        }
    }

    /// `GET` request
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    /// `POST` request
    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    /// `PUT` request
    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    /// `PATCH` request
    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    /// `DELETE` request
    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    /// Identifier for log correlation
    #[must_use]
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Add a header
    ///
    /// # Errors
    ///
    /// Returns `ClientError::InvalidConfig` if the name or value is not a valid header.
    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ClientError::invalid_config(format!("invalid header name: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| ClientError::invalid_config(format!("invalid value for {name}: {e}")))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    /// Set a raw body
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Serialize `value` as the JSON body and set `Content-Type`
    ///
    /// # Errors
    ///
    /// Returns `ClientError::InvalidConfig` if serialization fails.
    pub fn with_json<T: Serialize + ?Sized>(mut self, value: &T) -> Result<Self> {
        let body = serde_json::to_vec(value)
            .map_err(|e| ClientError::invalid_config(format!("failed to encode JSON body: {e}")))?;
        self.headers.insert(
            reqwest::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        self.body = Some(body);
        Ok(self)
    }

    /// Mark the request as unauthenticated (login, refresh and other auth endpoints)
    #[must_use]
    pub fn without_auth(mut self) -> Self {
        self.skip_auth = true;
        self
    }

    /// Set the Authorization header, replacing any previous value.
    ///
    /// The header is flagged sensitive so it never shows up in `Debug` output.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::InvalidConfig` if the token contains characters
    /// not allowed in a header value.
    pub fn set_bearer(&mut self, token_type: &str, token: &AccessToken) -> Result<()> {
        let mut value = HeaderValue::from_str(&format!("{token_type} {}", token.expose()))
            .map_err(|_| {
                ClientError::invalid_config("access token contains characters not valid in a header")
            })?;
        value.set_sensitive(true);
        self.headers.insert(AUTHORIZATION, value);
        Ok(())
    }

    /// Current Authorization header, if any
    #[must_use]
    pub fn authorization(&self) -> Option<&str> {
        self.headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
    }

    /// Copy of this request prepared for replay after a refresh
    #[must_use]
    pub(crate) fn for_replay(&self) -> Self {
        let mut replay = self.clone();
        replay.retry_count = replay.retry_count.saturating_add(1);
        replay
    }
}

impl std::fmt::Debug for ApiRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiRequest")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("path", &self.path)
            .field("headers", &self.headers)
            .field("body_len", &self.body.as_ref().map(Vec::len))
            .field("retry_count", &self.retry_count)
            .field("skip_auth", &self.skip_auth)
            .finish()
    }
}

/// Response returned by the transport
#[derive(Debug, Clone)]
pub struct ApiResponse {
    /// HTTP status
    pub status: StatusCode,
    /// Response headers
    pub headers: HeaderMap,
    /// Raw response body
    pub body: Vec<u8>,
}

impl ApiResponse {
    /// Create a response
    pub fn new(status: StatusCode, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    /// Status as a plain number
    #[must_use]
    pub fn status_code(&self) -> u16 {
        self.status.as_u16()
    }

    /// Whether the status is 2xx
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Body decoded as UTF-8 (lossy)
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Decode the body as JSON
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Transport` with a short body excerpt if decoding fails.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|e| {
            ClientError::transport(format!(
                "invalid JSON body ({e}): {}",
                body_excerpt(&self.text())
            ))
        })
    }
}

//! reqwest-backed transport

use async_trait::async_trait;

use super::{Transport, resolve_url};
use crate::error::{ClientError, Result};
use crate::types::{ApiRequest, ApiResponse, ClientOptions};

/// Transport that performs requests with a shared [`reqwest::Client`]
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    base_url: String,
}

impl ReqwestTransport {
    /// Build a transport from client options (base URL, timeout, default headers)
    ///
    /// # Errors
    ///
    /// Returns `ClientError::InvalidConfig` if the options are invalid or the
    /// HTTP client cannot be built.
    pub fn new(options: &ClientOptions) -> Result<Self> {
        options.validate()?;

        let client = reqwest::Client::builder()
            .timeout(options.timeout)
            .default_headers(options.default_headers.clone())
            .build()
            .map_err(|e| ClientError::invalid_config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self::with_client(client, options.base_url.clone()))
    }

    /// Use a preconfigured reqwest client
    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    /// Base URL relative paths are joined onto
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse> {
        let url = resolve_url(&self.base_url, &request.path);
        let url = reqwest::Url::parse(&url)
            .map_err(|e| ClientError::invalid_config(format!("invalid request URL: {e}")))?;

        let mut builder = self
            .client
            .request(request.method.clone(), url)
            .headers(request.headers.clone());
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        tracing::trace!(request_id = %request.id(), method = %request.method, path = %request.path, "Sending request");

        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?.to_vec();

        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }
}

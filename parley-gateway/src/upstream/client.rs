//! reqwest-backed upstream client.

use super::{CompletionRequest, TransportError, UpstreamClient, UpstreamResponse};
use anyhow::{Context, Result};
use async_trait::async_trait;
use parley_common::UpstreamConfig;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use std::time::Duration;

/// Posts completion requests to a single configured endpoint.
pub struct HttpUpstream {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpUpstream {
    /// Create a client. A bearer header is attached only when `api_key` is set.
    pub fn new(endpoint: impl Into<String>, api_key: Option<&str>, timeout: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = api_key.filter(|k| !k.is_empty()) {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", key))
                .context("API key is not a valid header value")?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .context("Failed to build upstream HTTP client")?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            timeout,
        })
    }

    pub fn from_config(config: &UpstreamConfig) -> Result<Self> {
        Self::new(&config.endpoint, config.api_key.as_deref(), config.timeout())
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn transport_error(&self, e: reqwest::Error) -> TransportError {
        if e.is_timeout() {
            TransportError::Timeout(self.timeout)
        } else {
            TransportError::Request(e.to_string())
        }
    }
}

#[async_trait]
impl UpstreamClient for HttpUpstream {
    async fn complete(&self, request: &CompletionRequest) -> Result<UpstreamResponse, TransportError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| self.transport_error(e))?;

        tracing::debug!(
            endpoint = %self.endpoint,
            status,
            body_len = body.len(),
            "Upstream responded"
        );

        Ok(UpstreamResponse { status, body })
    }
}

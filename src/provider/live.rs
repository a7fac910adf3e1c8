//! Live provider client
//!
//! The [`LiveClient`] seam is how the router reaches the real provider API
//! when an operation cannot (or must not) be served from the cache backend.

use super::account::AccountHandle;
use super::credentials::ResolvedCredential;
use super::http::sanitize_for_log;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;

/// One call against the live provider
#[derive(Debug, Clone, Copy)]
pub struct LiveRequest<'a> {
    pub account: &'a AccountHandle,
    pub operation: &'a str,
    pub args: &'a Value,
    pub credential: &'a ResolvedCredential,
}

/// Typed provider client surface
#[async_trait]
pub trait LiveClient: Send + Sync {
    async fn call(&self, request: LiveRequest<'_>) -> Result<Value>;
}

/// Live client for a JSON provider gateway
///
/// Calls are sent as `POST {endpoint}/{service}/{operation}` with the
/// arguments as the JSON body and the region in `x-cloudcache-region`.
/// The gateway authenticates the caller from the bearer token (the credential's
/// access key id) and `x-amz-security-token`; the secret access key is not sent.
#[derive(Clone)]
pub struct HttpLiveClient {
    client: Client,
    endpoint: String,
}

impl HttpLiveClient {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("cloudcache/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }

    /// Build the gateway URL for an operation
    pub fn operation_url(&self, service: &str, operation: &str) -> String {
        format!(
            "{}/{}/{}",
            self.endpoint,
            urlencoding::encode(service),
            urlencoding::encode(operation)
        )
    }
}

#[async_trait]
impl LiveClient for HttpLiveClient {
    async fn call(&self, request: LiveRequest<'_>) -> Result<Value> {
        let url = self.operation_url(request.account.service_name(), request.operation);
        tracing::debug!("POST {}", url);

        let mut builder = self
            .client
            .post(&url)
            .bearer_auth(&request.credential.access_key_id)
            .header("x-cloudcache-region", request.account.region())
            .json(request.args);
        if let Some(token) = &request.credential.session_token {
            builder = builder.header("x-amz-security-token", token.expose());
        }

        let response = builder.send().await.context("Failed to send request")?;

        let status = response.status();
        let body = response
            .text()
            .await
            .context("Failed to read response body")?;

        if !status.is_success() {
            tracing::error!("API error: {} - {}", status, sanitize_for_log(&body));
            return Err(anyhow::anyhow!("API request failed: {}", status));
        }

        if body.is_empty() {
            return Ok(Value::Null);
        }

        serde_json::from_str(&body).context("Failed to parse response JSON")
    }
}

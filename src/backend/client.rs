//! Cache backend HTTP client

use crate::error::BackendError;
use crate::metrics::MetricsSink;
use crate::provider::http::{capture_headers, host_of, sanitize_for_log};
use anyhow::{Context, Result};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

const DEFAULT_API_VERSION: &str = "v2";
const DEFAULT_PROVIDER: &str = "aws";
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 1_000;
const DEFAULT_SOCKET_TIMEOUT_MS: u64 = 5_000;

/// How retry delays grow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// base, base + step, base + 2 * step, ...
    #[default]
    Linear,
    /// base, 2 * base, 4 * base, ...
    Exponential,
}

/// Retry policy for cache backend requests
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub base_delay_ms: u64,
    pub backoff_ms: u64,
    pub max_attempts: u32,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 50,
            backoff_ms: 10,
            max_attempts: 3,
            strategy: BackoffStrategy::Linear,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the `failures`-th failed attempt (1-based)
    pub fn delay_after(&self, failures: u32) -> Duration {
        let n = failures.saturating_sub(1);
        let millis = match self.strategy {
            BackoffStrategy::Linear => self
                .base_delay_ms
                .saturating_add(self.backoff_ms.saturating_mul(n as u64)),
            BackoffStrategy::Exponential => self
                .base_delay_ms
                .saturating_mul(1u64.checked_shl(n).unwrap_or(u64::MAX)),
        };
        Duration::from_millis(millis)
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

fn default_api_version() -> String {
    DEFAULT_API_VERSION.to_string()
}

fn default_provider() -> String {
    DEFAULT_PROVIDER.to_string()
}

fn default_expand() -> bool {
    true
}

fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

fn default_socket_timeout_ms() -> u64 {
    DEFAULT_SOCKET_TIMEOUT_MS
}

/// Cache backend settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BackendConfig {
    pub base_url: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Ask for fully materialized collections instead of reference lists
    #[serde(default = "default_expand")]
    pub expand: bool,
    /// Ask for `{"mtime": .., "data": ..}` wrapped items
    #[serde(default)]
    pub meta_envelope: bool,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_socket_timeout_ms")]
    pub socket_timeout_ms: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl BackendConfig {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.to_string(),
            api_version: default_api_version(),
            provider: default_provider(),
            expand: default_expand(),
            meta_envelope: false,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            socket_timeout_ms: DEFAULT_SOCKET_TIMEOUT_MS,
            retry: RetryPolicy::default(),
        }
    }
}

/// What to fetch: a whole collection (`id == None`) or one item
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub resource_type: String,
    pub id: Option<String>,
}

impl CacheKey {
    pub fn collection(resource_type: &str) -> Self {
        Self {
            resource_type: resource_type.to_string(),
            id: None,
        }
    }

    pub fn item(resource_type: &str, id: &str) -> Self {
        Self {
            resource_type: resource_type.to_string(),
            id: Some(id.to_string()),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.id {
            Some(id) => write!(f, "{}/{}", self.resource_type, id),
            None => write!(f, "{}", self.resource_type),
        }
    }
}

/// Payload (absent on 404) plus every response header
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheResult {
    pub payload: Option<Vec<u8>>,
    pub response_metadata: HashMap<String, Vec<String>>,
}

impl CacheResult {
    pub fn is_absent(&self) -> bool {
        self.payload.is_none()
    }

    /// Deserialize the payload, if there is one
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<Option<T>> {
        self.payload
            .as_deref()
            .map(serde_json::from_slice)
            .transpose()
    }
}

/// HTTP client for the indexing service
#[derive(Clone)]
pub struct CacheBackend {
    client: Client,
    base: Url,
    host: String,
    config: BackendConfig,
    metrics: Arc<dyn MetricsSink>,
}

impl CacheBackend {
    pub fn new(config: BackendConfig, metrics: Arc<dyn MetricsSink>) -> Result<Self> {
        let base = Url::parse(&config.base_url).context("Invalid cache backend URL")?;
        if base.cannot_be_a_base() {
            anyhow::bail!("Cache backend URL cannot be a base: {}", config.base_url);
        }

        let client = Client::builder()
            .user_agent(concat!("cloudcache/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .timeout(Duration::from_millis(config.socket_timeout_ms))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            host: host_of(&base),
            base,
            config,
            metrics,
        })
    }

    /// Host (and port) of the indexing service, for error messages
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Whether items come wrapped in `{"mtime", "data"}` envelopes
    pub fn meta_envelope(&self) -> bool {
        self.config.meta_envelope
    }

    /// Deterministic request URL for a key
    pub fn url_for(&self, key: &CacheKey) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .push(&self.config.api_version)
                .push(&self.config.provider)
                .extend(key.resource_type.split('/').filter(|s| !s.is_empty()));
            if let Some(id) = &key.id {
                segments.push(id);
            }
        }

        let mut flags = Vec::new();
        if key.id.is_none() && self.config.expand {
            flags.push("_expand");
        }
        if self.config.meta_envelope {
            flags.push("_meta");
        }
        let query = flags.join("&");
        url.set_query(if query.is_empty() { None } else { Some(&query) });

        url
    }

    /// Fetch a collection or a single item
    pub async fn fetch(&self, key: &CacheKey) -> Result<CacheResult, BackendError> {
        let url = self.url_for(key);
        let attempts = self.config.retry.attempts();
        let tags = [("resource_type", key.resource_type.as_str())];
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            tracing::debug!("GET {} (attempt {}/{})", url, attempt, attempts);

            match self.client.get(url.clone()).send().await {
                Ok(response) => {
                    let status = response.status();
                    let response_metadata = capture_headers(response.headers());

                    if status == StatusCode::OK {
                        match response.bytes().await {
                            Ok(body) => {
                                return Ok(CacheResult {
                                    payload: Some(body.to_vec()),
                                    response_metadata,
                                });
                            },
                            Err(e) => {
                                last_error = format!("failed to read response body: {}", e);
                                self.count_error(key, "network");
                            },
                        }
                    } else if status == StatusCode::NOT_FOUND {
                        // drain so the connection goes back to the pool
                        let _ = response.bytes().await;
                        tracing::debug!("{} not found at cache backend", key);
                        return Ok(CacheResult {
                            payload: None,
                            response_metadata,
                        });
                    } else {
                        let body = response.text().await.unwrap_or_default();
                        tracing::warn!(
                            "Cache request {} failed with {} - {}",
                            url,
                            status,
                            sanitize_for_log(&body)
                        );
                        last_error = format!("HTTP {}", status);
                        self.count_error(key, "http");
                    }
                },
                Err(e) => {
                    tracing::warn!("Cache request {} failed with {}", url, e);
                    last_error = e.to_string();
                    self.count_error(key, "network");
                },
            }

            if attempt < attempts {
                let delay = self.config.retry.delay_after(attempt);
                self.metrics.increment("backend.retries", &tags, 1);
                tokio::time::sleep(delay).await;
            }
        }

        tracing::error!("Cache request {} failed with {} (retries exhausted)", url, last_error);

        Err(BackendError {
            url: url.to_string(),
            resource_type: key.resource_type.clone(),
            id: key.id.clone(),
            attempts,
            reason: last_error,
        })
    }

    fn count_error(&self, key: &CacheKey, error_type: &str) {
        self.metrics.increment(
            "backend.errors",
            &[
                ("resource_type", key.resource_type.as_str()),
                ("error_type", error_type),
            ],
            1,
        );
    }
}

//! Call dispatch
//!
//! Maps an operation name to either the cached path (registry operations) or
//! a single pass-through call to the live client.

use super::registry::{OperationDef, OperationRegistry, ResultShape};
use crate::backend::{CacheBackend, CacheKey};
use crate::error::{ClientError, ClientErrorKind, RouterError, CLIENT_ERROR_STATUS};
use crate::metrics::MetricsSink;
use crate::provider::{AccountHandle, CredentialResolver, LiveClient, LiveRequest};
use crate::rate_limit::RateLimiter;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Reservation id used when cached instances are wrapped in a reservation
pub const SYNTHETIC_RESERVATION_ID: &str = "1234";

/// Which path answered a call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMode {
    Cache,
    Live,
}

impl RequestMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestMode::Cache => "cache",
            RequestMode::Live => "live",
        }
    }
}

impl fmt::Display for RequestMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Out-of-band data about one call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseMetadata {
    /// Headers of the cache backend responses (empty for live calls)
    pub headers: HashMap<String, Vec<String>>,
    /// Oldest `mtime` (epoch millis) among the returned items
    pub last_modified: Option<i64>,
    pub mode: RequestMode,
}

impl ResponseMetadata {
    fn live() -> Self {
        Self {
            headers: HashMap::new(),
            last_modified: None,
            mode: RequestMode::Live,
        }
    }
}

/// A call result together with its metadata
#[derive(Debug, Clone, PartialEq)]
pub struct Described<T> {
    pub value: T,
    pub metadata: ResponseMetadata,
}

impl<T> Described<T> {
    pub fn into_value(self) -> T {
        self.value
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Described<U> {
        Described {
            value: f(self.value),
            metadata: self.metadata,
        }
    }
}

/// Provider client surface for one account that prefers the cache backend
#[derive(Clone)]
pub struct CallRouter {
    account: AccountHandle,
    registry: Arc<OperationRegistry>,
    backend: Arc<CacheBackend>,
    live: Arc<dyn LiveClient>,
    resolver: Arc<CredentialResolver>,
    limiter: Arc<RateLimiter>,
    metrics: Arc<dyn MetricsSink>,
    disabled_services: HashSet<String>,
}

impl CallRouter {
    pub fn new(
        account: AccountHandle,
        registry: Arc<OperationRegistry>,
        backend: Arc<CacheBackend>,
        live: Arc<dyn LiveClient>,
        resolver: Arc<CredentialResolver>,
        limiter: Arc<RateLimiter>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            account,
            registry,
            backend,
            live,
            resolver,
            limiter,
            metrics,
            disabled_services: HashSet::new(),
        }
    }

    /// Services whose operations always go to the live client
    pub fn with_disabled_services<I, S>(mut self, services: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.disabled_services = services.into_iter().map(Into::into).collect();
        self
    }

    pub fn account(&self) -> &AccountHandle {
        &self.account
    }

    fn cached_operation(&self, operation: &str) -> Option<&OperationDef> {
        let service = self.account.service_name();
        if self.disabled_services.contains(service) {
            return None;
        }
        self.registry.get(service, operation)
    }

    /// Invoke an operation by name
    ///
    /// Registry operations are answered from the cache backend only; failures
    /// there come back as a `ClientError`. Anything else is sent to the live
    /// client exactly once with `args` unchanged.
    pub async fn invoke(&self, operation: &str, args: Value) -> Result<Described<Value>, RouterError> {
        let started = Instant::now();

        let (mode, result) = match self.cached_operation(operation) {
            Some(def) => (RequestMode::Cache, self.describe_cached(def, &args).await),
            None => (RequestMode::Live, self.invoke_live(operation, &args).await),
        };

        self.metrics.record_duration(
            "router.invoke",
            &[
                ("service", self.account.service_name()),
                ("operation", operation),
                ("request_mode", mode.as_str()),
            ],
            started.elapsed(),
        );

        result
    }

    async fn describe_cached(&self, def: &OperationDef, args: &Value) -> Result<Described<Value>, RouterError> {
        let ids = requested_ids(def, args);
        let mut headers = HashMap::new();
        let mut last_modified: Option<i64> = None;
        let mut items = Vec::new();

        tracing::debug!(
            operation = %def.name,
            resource_type = %def.resource_type,
            ids = ids.as_ref().map_or(0, Vec::len),
            "Serving from cache backend"
        );

        if let Some(ids) = &ids {
            for id in ids {
                let result = self
                    .backend
                    .fetch(&CacheKey::item(&def.resource_type, id))
                    .await
                    .map_err(|e| self.failure(ClientErrorKind::Upstream, Some(def), e.to_string()))?;
                headers.extend(result.response_metadata);

                let Some(payload) = result.payload else {
                    tracing::debug!("{} '{}' not in cache, skipping", def.resource_type, id);
                    continue;
                };

                let raw: Value = serde_json::from_slice(&payload)
                    .map_err(|e| self.failure(ClientErrorKind::Mapping, Some(def), e.to_string()))?;
                let (item, mtime) = self.unwrap_envelope(def, raw)?;
                last_modified = earliest(last_modified, mtime);
                items.push(item);
            }
        } else {
            let result = self
                .backend
                .fetch(&CacheKey::collection(&def.resource_type))
                .await
                .map_err(|e| self.failure(ClientErrorKind::Upstream, Some(def), e.to_string()))?;
            headers = result.response_metadata;

            let Some(payload) = result.payload else {
                return Err(self
                    .failure(
                        ClientErrorKind::CollectionMissing,
                        Some(def),
                        format!(
                            "collection '{}' not found at {}",
                            def.resource_type,
                            self.backend.host()
                        ),
                    )
                    .into());
            };

            let raw: Vec<Value> = serde_json::from_slice(&payload)
                .map_err(|e| self.failure(ClientErrorKind::Mapping, Some(def), e.to_string()))?;
            for item in raw {
                let (item, mtime) = self.unwrap_envelope(def, item)?;
                last_modified = earliest(last_modified, mtime);
                items.push(item);
            }
        }

        self.metrics.increment(
            "backend.result_size",
            &[
                ("resource_type", def.resource_type.as_str()),
                ("collection_mode", if ids.is_some() { "by_id" } else { "full" }),
            ],
            items.len() as u64,
        );

        Ok(Described {
            value: shape_result(def, items),
            metadata: ResponseMetadata {
                headers,
                last_modified,
                mode: RequestMode::Cache,
            },
        })
    }

    /// Strip the `{"mtime", "data"}` wrapper when the backend adds one
    fn unwrap_envelope(&self, def: &OperationDef, item: Value) -> Result<(Value, Option<i64>), ClientError> {
        if !self.backend.meta_envelope() {
            return Ok((item, None));
        }

        let Value::Object(mut envelope) = item else {
            return Err(self.failure(ClientErrorKind::Mapping, Some(def), "expected metadata envelope object"));
        };
        let mtime = envelope.get("mtime").and_then(Value::as_i64);
        match envelope.remove("data") {
            Some(data) => Ok((data, mtime)),
            None => Err(self.failure(ClientErrorKind::Mapping, Some(def), "metadata envelope without data")),
        }
    }

    async fn invoke_live(&self, operation: &str, args: &Value) -> Result<Described<Value>, RouterError> {
        let service = self.account.service_name();
        let permit = self.limiter.acquire(service, self.account.account_id()).await?;
        if !permit.waited.is_zero() {
            tracing::debug!(operation, waited_ms = permit.waited.as_millis() as u64, "Rate budget delayed call");
        }

        let credential = self
            .resolver
            .resolve(&self.account)
            .await
            .map_err(|e| self.failure(ClientErrorKind::Credential, None, e.to_string()))?;

        tracing::debug!(operation, account = %self.account, "Passing through to live client");

        let value = self
            .live
            .call(LiveRequest {
                account: &self.account,
                operation,
                args,
                credential: &credential,
            })
            .await
            .map_err(|e| self.failure(ClientErrorKind::Live, None, format!("{:#}", e)))?;

        Ok(Described {
            value,
            metadata: ResponseMetadata::live(),
        })
    }

    fn failure(&self, kind: ClientErrorKind, def: Option<&OperationDef>, message: impl Into<String>) -> ClientError {
        let resource_type = def.map(|d| d.resource_type.clone());
        let error = ClientError {
            kind,
            status_code: CLIENT_ERROR_STATUS,
            service_name: self.account.service_name().to_string(),
            host: self.backend.host().to_string(),
            resource_type,
            target_account_id: self.account.account_id().to_string(),
            message: message.into(),
        };

        tracing::error!("{}", error);
        let kind = kind.to_string();
        self.metrics.increment(
            "router.failures",
            &[
                ("service", self.account.service_name()),
                ("kind", kind.as_str()),
            ],
            1,
        );

        error
    }
}

/// String ids from the request argument named by the operation
/// `None` means the whole collection was asked for; `Some` is a by-id
/// request even when none of the ids survive filtering.
fn requested_ids(def: &OperationDef, args: &Value) -> Option<Vec<String>> {
    let param = def.ids_param.as_deref()?;
    let values = args.get(param).and_then(Value::as_array)?;
    if values.is_empty() {
        return None;
    }

    let ids = values
        .iter()
        .filter_map(|v| match v.as_str() {
            Some(id) => Some(id.to_string()),
            None => {
                tracing::debug!("Skipping non-string id {} in {}", v, param);
                None
            },
        })
        .collect();
    Some(ids)
}

fn earliest(current: Option<i64>, next: Option<i64>) -> Option<i64> {
    match (current, next) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn shape_result(def: &OperationDef, items: Vec<Value>) -> Value {
    let items = match def.shape {
        ResultShape::Bare => return Value::Array(items),
        ResultShape::List => Value::Array(items),
        ResultShape::Reservations => json!([{
            "reservationId": SYNTHETIC_RESERVATION_ID,
            "instances": items,
        }]),
    };

    let mut result = Map::new();
    result.insert(def.result_field.clone(), items);
    Value::Object(result)
}

//! Health enrichment

use super::source::{lookup, CachedResource};
use crate::cache::Enricher;
use crate::router::CallRouter;
use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum HealthState {
    Up,
    Down,
    Starting,
    #[default]
    Unknown,
}

impl HealthState {
    /// Health of a single instance from its reported state
    pub fn from_instance_state(state: &str) -> Self {
        match state.to_ascii_uppercase().as_str() {
            "RUNNING" => HealthState::Up,
            "DOWN" | "CRASHED" => HealthState::Down,
            "STARTING" => HealthState::Starting,
            _ => HealthState::Unknown,
        }
    }

    /// Health of a resource from the health of its instances
    ///
    /// Any `Down` wins, then any `Starting`; all `Up` is `Up`. No instances,
    /// or a mix with `Unknown`, is `Unknown`.
    pub fn aggregate<I: IntoIterator<Item = HealthState>>(states: I) -> Self {
        let mut seen_any = false;
        let mut all_up = true;
        let mut starting = false;

        for state in states {
            seen_any = true;
            match state {
                HealthState::Down => return HealthState::Down,
                HealthState::Starting => starting = true,
                HealthState::Unknown => all_up = false,
                HealthState::Up => {},
            }
        }

        if starting {
            HealthState::Starting
        } else if seen_any && all_up {
            HealthState::Up
        } else {
            HealthState::Unknown
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HealthState::Up => "Up",
            HealthState::Down => "Down",
            HealthState::Starting => "Starting",
            HealthState::Unknown => "Unknown",
        };
        f.write_str(name)
    }
}

#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn check(&self, resource: &CachedResource) -> anyhow::Result<HealthState>;
}

/// Stores the health check outcome on each entity; `Unknown` when the check fails
pub struct HealthEnricher {
    check: Arc<dyn HealthCheck>,
}

impl HealthEnricher {
    pub fn new(check: Arc<dyn HealthCheck>) -> Self {
        Self { check }
    }
}

#[async_trait]
impl Enricher<String, CachedResource> for HealthEnricher {
    async fn enrich(&self, _key: &String, value: &CachedResource) -> anyhow::Result<CachedResource> {
        let health = self.check.check(value).await?;
        Ok(CachedResource {
            health,
            ..value.clone()
        })
    }

    fn degrade(&self, _key: &String, mut value: CachedResource) -> CachedResource {
        value.health = HealthState::Unknown;
        value
    }
}

/// Health check that asks the provider for a resource's instances
pub struct RouterHealthCheck {
    router: Arc<CallRouter>,
    operation: String,
    ids_param: String,
    items_field: String,
    state_field: String,
}

impl RouterHealthCheck {
    pub fn new(router: Arc<CallRouter>, operation: &str, ids_param: &str, items_field: &str, state_field: &str) -> Self {
        Self {
            router,
            operation: operation.to_string(),
            ids_param: ids_param.to_string(),
            items_field: items_field.to_string(),
            state_field: state_field.to_string(),
        }
    }
}

#[async_trait]
impl HealthCheck for RouterHealthCheck {
    async fn check(&self, resource: &CachedResource) -> anyhow::Result<HealthState> {
        let mut args = Map::new();
        args.insert(
            self.ids_param.clone(),
            Value::Array(vec![Value::String(resource.id.clone())]),
        );

        let response = self
            .router
            .invoke(&self.operation, Value::Object(args))
            .await
            .with_context(|| format!("Failed to check health of {} '{}'", resource.resource_type, resource.id))?
            .into_value();

        let instances = lookup(&response, &self.items_field)
            .and_then(Value::as_array)
            .with_context(|| format!("No instance list at '{}'", self.items_field))?;

        Ok(HealthState::aggregate(instances.iter().map(|instance| {
            lookup(instance, &self.state_field)
                .and_then(Value::as_str)
                .map(HealthState::from_instance_state)
                .unwrap_or_default()
        })))
    }
}

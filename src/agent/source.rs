//! Resource sources
//!
//! A [`ResourceSource`] knows how to list one resource type, fetch each item
//! and map it to the cached value. [`RoutedSource`] is the data-driven
//! implementation that goes through a [`CallRouter`].

use super::health::HealthState;
use crate::cache::SnapshotEntry;
use crate::error::{Error, MappingError};
use crate::router::CallRouter;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

/// One page of a listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_token: Option<String>,
}

impl<T> Page<T> {
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            next_token: None,
        }
    }
}

#[async_trait]
pub trait ResourceSource: Send + Sync {
    type Raw: Send + 'static;
    type Value: Clone + Send + Sync + 'static;

    fn resource_type(&self) -> &str;

    /// Label used in logs and agent names
    fn scope(&self) -> String {
        self.resource_type().to_string()
    }

    /// One page of ids; `None` token asks for the first page
    async fn list_page(&self, page_token: Option<&str>) -> Result<Page<String>, Error>;

    /// Details for one id; `None` if it disappeared since listing
    async fn fetch(&self, id: &str) -> Result<Option<SnapshotEntry<String, Self::Raw>>, Error>;

    fn map(&self, id: &str, raw: Self::Raw) -> Result<Self::Value, MappingError>;
}

fn default_ids_param() -> String {
    "ids".to_string()
}

fn default_id_field() -> String {
    "id".to_string()
}

fn default_health_items_field() -> String {
    "instances".to_string()
}

fn default_health_state_field() -> String {
    "state".to_string()
}

fn default_interval_secs() -> u64 {
    60
}

/// Declarative description of a routed resource type
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AgentDef {
    pub resource_type: String,
    /// Provider service the operations belong to
    pub service: String,
    pub list_operation: String,
    pub describe_operation: String,
    #[serde(default = "default_ids_param")]
    pub ids_param: String,
    /// Dot path to the id inside an item
    #[serde(default = "default_id_field")]
    pub id_field: String,
    /// Dot path to the version token inside an item
    #[serde(default)]
    pub version_field: Option<String>,
    /// Request argument carrying the page token
    #[serde(default)]
    pub page_token_field: Option<String>,
    /// Response field holding the next page token
    #[serde(default)]
    pub next_token_field: Option<String>,
    /// Dot path to the item list in list and describe results; empty for a bare array
    #[serde(default)]
    pub items_field: String,
    #[serde(default)]
    pub health_operation: Option<String>,
    #[serde(default = "default_health_items_field")]
    pub health_items_field: String,
    #[serde(default = "default_health_state_field")]
    pub health_state_field: String,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default)]
    pub cycle_timeout_secs: Option<u64>,
}

impl AgentDef {
    pub fn new(resource_type: &str, service: &str, list_operation: &str, describe_operation: &str) -> Self {
        Self {
            resource_type: resource_type.to_string(),
            service: service.to_string(),
            list_operation: list_operation.to_string(),
            describe_operation: describe_operation.to_string(),
            ids_param: default_ids_param(),
            id_field: default_id_field(),
            version_field: None,
            page_token_field: None,
            next_token_field: None,
            items_field: String::new(),
            health_operation: None,
            health_items_field: default_health_items_field(),
            health_state_field: default_health_state_field(),
            interval_secs: default_interval_secs(),
            cycle_timeout_secs: None,
        }
    }
}

/// What routed agents store
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CachedResource {
    pub id: String,
    pub resource_type: String,
    pub account_id: String,
    pub region: String,
    pub version: Option<String>,
    pub body: Value,
    pub health: HealthState,
}

/// Look up a dot path (`a.b.0.c`) inside a JSON value
pub fn lookup<'a>(item: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(item);
    }

    let mut current = item;
    for part in path.split('.') {
        current = match (current, part.parse::<usize>()) {
            (Value::Array(items), Ok(idx)) => items.get(idx)?,
            _ => current.get(part)?,
        };
    }
    Some(current)
}

/// Strings and numbers as strings; anything else is not a scalar key
pub fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Lists and fetches a resource type through a call router
pub struct RoutedSource {
    def: AgentDef,
    router: Arc<CallRouter>,
}

impl RoutedSource {
    pub fn new(def: AgentDef, router: Arc<CallRouter>) -> Self {
        Self { def, router }
    }

    pub fn def(&self) -> &AgentDef {
        &self.def
    }

    fn items<'a>(&self, response: &'a Value) -> Result<&'a Vec<Value>, MappingError> {
        lookup(response, &self.def.items_field)
            .and_then(Value::as_array)
            .ok_or_else(|| {
                MappingError::new(
                    &self.def.resource_type,
                    format!("no item list at '{}'", self.def.items_field),
                )
            })
    }

    fn id_of(&self, item: &Value) -> Result<String, MappingError> {
        lookup(item, &self.def.id_field)
            .and_then(scalar_string)
            .ok_or_else(|| {
                MappingError::new(
                    &self.def.resource_type,
                    format!("item without '{}'", self.def.id_field),
                )
            })
    }
}

#[async_trait]
impl ResourceSource for RoutedSource {
    type Raw = Value;
    type Value = CachedResource;

    fn resource_type(&self) -> &str {
        &self.def.resource_type
    }

    fn scope(&self) -> String {
        format!("{}/{}", self.router.account(), self.def.resource_type)
    }

    async fn list_page(&self, page_token: Option<&str>) -> Result<Page<String>, Error> {
        let mut args = Map::new();
        if let (Some(field), Some(token)) = (&self.def.page_token_field, page_token) {
            args.insert(field.clone(), Value::String(token.to_string()));
        }

        let response = self
            .router
            .invoke(&self.def.list_operation, Value::Object(args))
            .await?
            .into_value();

        let ids = self
            .items(&response)?
            .iter()
            .map(|item| self.id_of(item))
            .collect::<Result<Vec<_>, _>>()?;

        let next_token = self
            .def
            .next_token_field
            .as_deref()
            .and_then(|field| lookup(&response, field))
            .and_then(Value::as_str)
            .filter(|token| !token.is_empty())
            .map(str::to_string);

        Ok(Page {
            items: ids,
            next_token,
        })
    }

    async fn fetch(&self, id: &str) -> Result<Option<SnapshotEntry<String, Value>>, Error> {
        let mut args = Map::new();
        args.insert(
            self.def.ids_param.clone(),
            Value::Array(vec![Value::String(id.to_string())]),
        );

        let response = self
            .router
            .invoke(&self.def.describe_operation, Value::Object(args))
            .await?
            .into_value();

        for item in self.items(&response)? {
            if self.id_of(item)? == id {
                let version = self
                    .def
                    .version_field
                    .as_deref()
                    .and_then(|field| lookup(item, field))
                    .and_then(scalar_string);
                return Ok(Some(SnapshotEntry::new(id.to_string(), version, item.clone())));
            }
        }

        tracing::debug!("{} '{}' vanished after listing", self.def.resource_type, id);
        Ok(None)
    }

    fn map(&self, id: &str, raw: Value) -> Result<CachedResource, MappingError> {
        if !raw.is_object() {
            return Err(MappingError::new(&self.def.resource_type, "expected a JSON object"));
        }

        let account = self.router.account();
        let version = self
            .def
            .version_field
            .as_deref()
            .and_then(|field| lookup(&raw, field))
            .and_then(scalar_string);

        Ok(CachedResource {
            id: id.to_string(),
            resource_type: self.def.resource_type.clone(),
            account_id: account.account_id().to_string(),
            region: account.region().to_string(),
            version,
            body: raw,
            health: HealthState::Unknown,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_lookup_paths() {
        let item = json!({ "a": { "b": [ { "c": "x" } ] }, "n": 3 });
        assert_eq!(lookup(&item, "a.b.0.c"), Some(&json!("x")));
        assert_eq!(lookup(&item, ""), Some(&item));
        assert_eq!(lookup(&item, "a.missing"), None);
        assert_eq!(lookup(&item, "a.b.5"), None);
    }

    #[test]
    fn test_scalar_string() {
        assert_eq!(scalar_string(&json!("v1")), Some("v1".to_string()));
        assert_eq!(scalar_string(&json!(1700000000)), Some("1700000000".to_string()));
        assert_eq!(scalar_string(&json!({ "x": 1 })), None);
        assert_eq!(scalar_string(&Value::Null), None);
    }

    #[test]
    fn test_agent_def_defaults() {
        let def: AgentDef = serde_yaml::from_str(
            "resource_type: autoScalingGroups\n\
             service: autoscaling\n\
             list_operation: describeAutoScalingGroups\n\
             describe_operation: describeAutoScalingGroups\n\
             ids_param: autoScalingGroupNames\n\
             id_field: autoScalingGroupName\n\
             items_field: autoScalingGroups\n",
        )
        .unwrap();
        assert_eq!(def.interval_secs, 60);
        assert_eq!(def.health_items_field, "instances");
        assert_eq!(def.health_state_field, "state");
        assert!(def.health_operation.is_none());
        assert!(def.next_token_field.is_none());
    }
}

//! Operation Registry - cache-eligible read operations
//!
//! Every operation the router may serve from the cache backend is declared
//! here. The built-in set is loaded from embedded JSON; callers can add their
//! own with [`OperationRegistry::register`].

use serde::Deserialize;
use std::collections::HashMap;
use std::sync::OnceLock;

/// Embedded operation files (compiled into the binary)
const OPERATION_FILES: &[&str] = &[include_str!("operations/aws.json")];

/// How cached items are laid out in the call result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultShape {
    /// `{result_field: [items]}`
    #[default]
    List,
    /// `[items]`
    Bare,
    /// `{result_field: [{"reservationId": .., "instances": [items]}]}`
    Reservations,
}

/// A read operation that can be answered from the cache backend
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OperationDef {
    pub name: String,
    /// Provider service the operation belongs to
    pub service: String,
    /// Resource type path at the cache backend
    pub resource_type: String,
    /// Request argument carrying the requested ids
    #[serde(default)]
    pub ids_param: Option<String>,
    /// Response field holding the items (ignored for `Bare`)
    #[serde(default)]
    pub result_field: String,
    #[serde(default)]
    pub shape: ResultShape,
}

impl OperationDef {
    pub fn new(name: &str, service: &str, resource_type: &str) -> Self {
        Self {
            name: name.to_string(),
            service: service.to_string(),
            resource_type: resource_type.to_string(),
            ids_param: None,
            result_field: resource_type.to_string(),
            shape: ResultShape::List,
        }
    }

    pub fn ids_param(mut self, param: &str) -> Self {
        self.ids_param = Some(param.to_string());
        self
    }

    pub fn result_field(mut self, field: &str) -> Self {
        self.result_field = field.to_string();
        self
    }

    pub fn shape(mut self, shape: ResultShape) -> Self {
        self.shape = shape;
        self
    }
}

/// Root structure of operations/*.json
#[derive(Debug, Clone, Deserialize)]
struct OperationFile {
    #[allow(dead_code)]
    provider: String,
    operations: Vec<OperationDef>,
}

/// Operations keyed by (service, operation name)
#[derive(Debug, Clone, Default)]
pub struct OperationRegistry {
    operations: HashMap<(String, String), OperationDef>,
}

static BUILTIN: OnceLock<OperationRegistry> = OnceLock::new();

impl OperationRegistry {
    /// An empty registry: every call passes through to the live client
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry built from the embedded operation files
    pub fn builtin() -> Self {
        BUILTIN
            .get_or_init(|| {
                let mut registry = Self::new();
                for content in OPERATION_FILES {
                    let file: OperationFile = serde_json::from_str(content)
                        .unwrap_or_else(|e| panic!("Failed to parse embedded operation JSON: {}", e));
                    for def in file.operations {
                        registry = registry.register(def);
                    }
                }
                registry
            })
            .clone()
    }

    /// Add (or replace) an operation
    pub fn register(mut self, def: OperationDef) -> Self {
        self.operations
            .insert((def.service.clone(), def.name.clone()), def);
        self
    }

    pub fn get(&self, service: &str, operation: &str) -> Option<&OperationDef> {
        self.operations
            .get(&(service.to_string(), operation.to_string()))
    }

    /// Operation names declared for a service, sorted
    pub fn operations_for(&self, service: &str) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .operations
            .values()
            .filter(|d| d.service == service)
            .map(|d| d.name.as_str())
            .collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

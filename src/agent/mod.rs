//! Polling agents
//!
//! An agent owns one resource type in one (account, region) scope. Each
//! cycle lists every id, fetches the details on a bounded pool and hands the
//! complete snapshot to a [`crate::cache::ReconcilingCache`]. A failure
//! anywhere before that leaves the previous snapshot in place.
//!
//! # Module Structure
//!
//! - [`source`] - The `ResourceSource` seam and the router-backed source
//! - [`polling`] - One reconciliation cycle
//! - [`health`] - Health states and the health enricher
//! - [`scheduler`] - Periodic execution with cycle timeouts

pub mod health;
pub mod polling;
pub mod scheduler;
pub mod source;

pub use health::{HealthCheck, HealthEnricher, HealthState, RouterHealthCheck};
pub use polling::{CachingAgent, CycleError, CycleReport, PollingAgent};
pub use source::{AgentDef, CachedResource, Page, ResourceSource, RoutedSource};

//! cloudcache - read-through cache proxy and reconciling entity cache
//!
//! Provider reads are served from a secondary indexing service where possible
//! (the [`router`] over the [`backend`]) and fall back to the live provider
//! otherwise. [`agent`]s poll each resource type and publish complete
//! snapshots into a [`cache::ReconcilingCache`].
//!
//! # Module Structure
//!
//! - [`provider`] - Accounts, credential resolution, live client
//! - [`rate_limit`] - Per (service, account) call budgets
//! - [`backend`] - Cache backend HTTP client
//! - [`router`] - Cache-first call routing
//! - [`cache`] - Snapshot-reconciled entity store
//! - [`pool`] - Bounded worker pool
//! - [`agent`] - Polling agents and their scheduler
//! - [`metrics`] - Metrics sink seam
//! - [`config`] - YAML configuration
//! - [`error`] - Error taxonomy

pub mod agent;
pub mod backend;
pub mod cache;
pub mod config;
pub mod error;
pub mod metrics;
pub mod pool;
pub mod provider;
pub mod rate_limit;
pub mod router;

pub use error::{ClientError, ClientErrorKind, Error, RouterError};

/// Version injected at compile time via CLOUDCACHE_VERSION env var (set by CI/CD),
/// or "dev" for local builds.
pub const VERSION: &str = match option_env!("CLOUDCACHE_VERSION") {
    Some(v) => v,
    None => "dev",
};

//! Read-through client for the secondary indexing service
//!
//! The indexing service mirrors provider resources and serves them as JSON:
//! a collection under `{base}/{api_version}/{provider}/{resource_type}` and a
//! single item under `.../{resource_type}/{id}`. A 404 is a normal outcome
//! ("not there"), everything else that is not a 200 is retried and finally
//! reported as upstream unavailable.

mod client;

pub use client::{
    BackendConfig, BackoffStrategy, CacheBackend, CacheKey, CacheResult, RetryPolicy,
};

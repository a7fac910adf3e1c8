//! Error taxonomy
//!
//! Typed errors shared by the cache backend, the call router and the polling
//! agents. `ClientError` is the single normalized shape callers of the router
//! see; everything else stays internal to the component that produced it.

use std::fmt;
use thiserror::Error;

/// Status code attached to every normalized client error.
pub const CLIENT_ERROR_STATUS: u16 = 400;

/// Errors surfaced to polling agents while building a snapshot.
#[derive(Debug, Error)]
pub enum Error {
    /// Cache or live lookup returned nothing for an id
    #[error("{resource_type} '{id}' not found")]
    NotFound { resource_type: String, id: String },

    /// Transport failure or unexpected status after retries were exhausted
    #[error(transparent)]
    UpstreamUnavailable(#[from] BackendError),

    /// Budget exhausted in non-blocking mode
    #[error(transparent)]
    RateLimited(#[from] RateLimited),

    /// Role exchange failed
    #[error(transparent)]
    Credential(#[from] CredentialError),

    /// Payload did not have the expected shape
    #[error(transparent)]
    Mapping(#[from] MappingError),

    /// Normalized router failure
    #[error(transparent)]
    Client(#[from] ClientError),
}

impl Error {
    /// Whether this failure should be reported as a mapping problem.
    ///
    /// Mapping failures abort a cycle exactly like upstream failures, but are
    /// reported under their own counter for diagnostics.
    pub fn is_mapping(&self) -> bool {
        match self {
            Error::Mapping(_) => true,
            Error::Client(err) => err.kind == ClientErrorKind::Mapping,
            _ => false,
        }
    }
}

impl From<RouterError> for Error {
    fn from(err: RouterError) -> Self {
        match err {
            RouterError::Client(err) => Error::Client(err),
            RouterError::RateLimited(err) => Error::RateLimited(err),
        }
    }
}

/// The cache backend could not produce an answer.
#[derive(Debug, Clone, Error)]
#[error("cache request {url} failed after {attempts} attempt(s): {reason}")]
pub struct BackendError {
    pub url: String,
    pub resource_type: String,
    pub id: Option<String>,
    pub attempts: u32,
    pub reason: String,
}

/// Rate budget exhausted for a (service, account) pair.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("rate limited: {service} for account {account}")]
pub struct RateLimited {
    pub service: String,
    pub account: String,
}

/// Role exchange failure.
#[derive(Debug, Clone, Error)]
#[error("failed to assume role {role_arn} via {endpoint}: {reason}")]
pub struct CredentialError {
    pub role_arn: String,
    pub endpoint: String,
    pub reason: String,
}

/// Cached payload failed to deserialize into the expected shape.
#[derive(Debug, Clone, Error)]
#[error("malformed {resource_type} payload: {reason}")]
pub struct MappingError {
    pub resource_type: String,
    pub reason: String,
}

impl MappingError {
    pub fn new(resource_type: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self {
            resource_type: resource_type.into(),
            reason: reason.to_string(),
        }
    }
}

/// What went wrong behind a normalized client error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientErrorKind {
    /// A collection fetch found nothing at the cache backend
    CollectionMissing,
    /// The cache backend was unreachable or answered with an error status
    Upstream,
    /// The cache backend answered with a payload of the wrong shape
    Mapping,
    /// Credentials for the live call could not be obtained
    Credential,
    /// The live provider call itself failed
    Live,
}

impl fmt::Display for ClientErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClientErrorKind::CollectionMissing => "collection-missing",
            ClientErrorKind::Upstream => "upstream",
            ClientErrorKind::Mapping => "mapping",
            ClientErrorKind::Credential => "credential",
            ClientErrorKind::Live => "live",
        };
        f.write_str(name)
    }
}

/// Client-facing error returned by the call router.
#[derive(Debug, Clone, Error)]
#[error("{status_code} Bad Request -- {message} (service: {service_name}, host: {host})")]
pub struct ClientError {
    pub kind: ClientErrorKind,
    pub status_code: u16,
    pub service_name: String,
    pub host: String,
    pub resource_type: Option<String>,
    pub target_account_id: String,
    pub message: String,
}

/// Failures of `CallRouter::invoke`.
#[derive(Debug, Clone, Error)]
pub enum RouterError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    RateLimited(#[from] RateLimited),
}

/// Worker pool semaphore was closed while tasks were pending.
#[derive(Debug, Clone, Copy, Error)]
#[error("worker pool closed")]
pub struct PoolClosed;

//! Provider-facing plumbing
//!
//! Everything needed to talk to a live cloud provider on behalf of an
//! account: the account scope itself, credential resolution, the live client
//! seam and shared HTTP helpers.
//!
//! # Module Structure
//!
//! - [`account`] - Immutable (account, service, region) handles
//! - [`credentials`] - Role ARN expansion, endpoint selection and role exchange
//! - [`live`] - Live provider client seam
//! - [`http`] - HTTP utilities shared with the cache backend

pub mod account;
pub mod credentials;
pub mod http;
pub mod live;

pub use account::AccountHandle;
pub use credentials::{
    exchange_endpoint, qualify_role_arn, CredentialResolver, ExchangeEndpoints, HttpRoleExchange,
    Partition, ResolvedCredential, RoleExchange,
};
pub use live::{HttpLiveClient, LiveClient, LiveRequest};

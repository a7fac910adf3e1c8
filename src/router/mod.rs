//! Read-through call routing
//!
//! A [`CallRouter`] stands in for a provider client. Declared read operations
//! are answered from the cache backend; everything else goes to the live
//! provider.
//!
//! # Architecture
//!
//! - [`registry`] - Cache-eligible operations, loaded from embedded JSON
//! - [`dispatch`] - The router itself and its per-call result wrapper
//!
//! # Operation Definitions
//!
//! Built-in operations live in `src/router/operations/`:
//! - `aws.json` - autoscaling, cloudwatch, ec2, elb and elbv2 read calls

pub mod dispatch;
pub mod registry;

pub use dispatch::{CallRouter, Described, RequestMode, ResponseMetadata, SYNTHETIC_RESERVATION_ID};
pub use registry::{OperationDef, OperationRegistry, ResultShape};

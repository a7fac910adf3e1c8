//! Account handles
//!
//! An [`AccountHandle`] names the (account, service, region) scope a call is
//! made for. Handles are built once from configuration and never change.

use std::fmt;

/// Prefix for generated role session names
const SESSION_NAME_PREFIX: &str = "cloudcache";

/// Immutable (account, service, region) scope
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AccountHandle {
    account_id: String,
    service_name: String,
    region: String,
    role_arn: Option<String>,
    session_name: String,
}

impl AccountHandle {
    /// Create a handle. A missing session name gets a generated one.
    pub fn new(
        account_id: &str,
        service_name: &str,
        region: &str,
        role_arn: Option<&str>,
        session_name: Option<&str>,
    ) -> Self {
        let session_name = session_name
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("{}-{}", SESSION_NAME_PREFIX, uuid::Uuid::new_v4()));

        Self {
            account_id: account_id.to_string(),
            service_name: service_name.to_string(),
            region: region.to_string(),
            role_arn: role_arn
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(|r| r.to_string()),
            session_name,
        }
    }

    /// Same account, region and role, scoped to another service
    pub fn for_service(&self, service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            ..self.clone()
        }
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn role_arn(&self) -> Option<&str> {
        self.role_arn.as_deref()
    }

    pub fn session_name(&self) -> &str {
        &self.session_name
    }
}

impl fmt::Display for AccountHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.account_id, self.region, self.service_name)
    }
}

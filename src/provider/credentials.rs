//! Credential resolution
//!
//! Resolves an [`AccountHandle`] to call credentials. Accounts without a role
//! use the base credential as-is; accounts with a role go through a role
//! exchange at an endpoint chosen from the role ARN's partition.
//!
//! Freshness belongs to the exchange mechanism: [`HttpRoleExchange`] keeps
//! exchanged credentials until shortly before their declared expiry, and the
//! resolver itself caches nothing.

use super::account::AccountHandle;
use super::http::sanitize_for_log;
use crate::error::CredentialError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Default global exchange endpoint
pub const DEFAULT_EXCHANGE_ENDPOINT: &str = "https://sts.amazonaws.com";

/// GovCloud exchange endpoint
pub const GOVCLOUD_EXCHANGE_ENDPOINT: &str = "https://sts.us-gov-west-1.amazonaws.com";

/// China exchange endpoint
pub const CHINA_EXCHANGE_ENDPOINT: &str = "https://sts.cn-north-1.amazonaws.com.cn";

/// Refresh exchanged credentials this much before they actually expire
pub const DEFAULT_EXPIRY_BUFFER: Duration = Duration::from_secs(60);

const ARN_PREFIX: &str = "arn:";

/// Secret string that never shows up in Debug output
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Time-limited call credentials
///
/// The HTTP clients in this crate send only the key id and session token.
/// `secret_access_key` is held for request signers and is never put on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCredential {
    pub access_key_id: String,
    pub secret_access_key: Secret,
    pub session_token: Option<Secret>,
    /// `None` for long-lived base credentials
    pub expiry: Option<DateTime<Utc>>,
}

impl ResolvedCredential {
    pub fn new(access_key_id: &str, secret_access_key: &str, session_token: Option<&str>) -> Self {
        Self {
            access_key_id: access_key_id.to_string(),
            secret_access_key: Secret::new(secret_access_key),
            session_token: session_token.map(Secret::new),
            expiry: None,
        }
    }

    /// Base credentials from the standard environment variables
    pub fn from_env() -> Result<Self> {
        let access_key_id =
            std::env::var("AWS_ACCESS_KEY_ID").context("AWS_ACCESS_KEY_ID is not set")?;
        let secret_access_key =
            std::env::var("AWS_SECRET_ACCESS_KEY").context("AWS_SECRET_ACCESS_KEY is not set")?;
        let session_token = std::env::var("AWS_SESSION_TOKEN").ok();

        Ok(Self::new(
            &access_key_id,
            &secret_access_key,
            session_token.as_deref(),
        ))
    }

    /// Still usable at `now`, keeping `buffer` in reserve
    pub fn is_fresh_at(&self, now: DateTime<Utc>, buffer: Duration) -> bool {
        match self.expiry {
            None => true,
            Some(expiry) => {
                let buffer = chrono::Duration::from_std(buffer).unwrap_or(chrono::Duration::zero());
                now + buffer < expiry
            },
        }
    }
}

/// ARN partition, decided purely by substring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partition {
    Standard,
    GovCloud,
    China,
}

impl Partition {
    pub fn of_arn(role_arn: &str) -> Self {
        if role_arn.contains("aws-us-gov") {
            Partition::GovCloud
        } else if role_arn.contains("aws-cn") {
            Partition::China
        } else {
            Partition::Standard
        }
    }
}

/// Region-pinned exchange endpoints per partition
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ExchangeEndpoints {
    pub default: String,
    pub govcloud: String,
    pub china: String,
}

impl Default for ExchangeEndpoints {
    fn default() -> Self {
        Self {
            default: DEFAULT_EXCHANGE_ENDPOINT.to_string(),
            govcloud: GOVCLOUD_EXCHANGE_ENDPOINT.to_string(),
            china: CHINA_EXCHANGE_ENDPOINT.to_string(),
        }
    }
}

impl ExchangeEndpoints {
    pub fn for_partition(&self, partition: Partition) -> &str {
        match partition {
            Partition::Standard => &self.default,
            Partition::GovCloud => &self.govcloud,
            Partition::China => &self.china,
        }
    }
}

/// Pick the exchange endpoint for a role ARN
pub fn exchange_endpoint<'a>(role_arn: &str, endpoints: &'a ExchangeEndpoints) -> &'a str {
    endpoints.for_partition(Partition::of_arn(role_arn))
}

/// Expand a bare role (`role/deploy`) into a full ARN for the account
pub fn qualify_role_arn(account_id: &str, role: &str) -> String {
    if role.starts_with(ARN_PREFIX) {
        role.to_string()
    } else {
        format!("arn:aws:iam::{}:{}", account_id, role)
    }
}

/// One role exchange call
#[derive(Debug, Clone)]
pub struct AssumeRoleRequest<'a> {
    pub endpoint: &'a str,
    pub role_arn: &'a str,
    pub session_name: &'a str,
    pub base: &'a ResolvedCredential,
}

/// External role-exchange service
#[async_trait]
pub trait RoleExchange: Send + Sync {
    async fn assume_role(
        &self,
        request: &AssumeRoleRequest<'_>,
    ) -> std::result::Result<ResolvedCredential, CredentialError>;
}

/// Resolves account handles to call credentials
#[derive(Clone)]
pub struct CredentialResolver {
    base: ResolvedCredential,
    exchange: Arc<dyn RoleExchange>,
    endpoints: ExchangeEndpoints,
}

impl CredentialResolver {
    pub fn new(
        base: ResolvedCredential,
        exchange: Arc<dyn RoleExchange>,
        endpoints: ExchangeEndpoints,
    ) -> Self {
        Self {
            base,
            exchange,
            endpoints,
        }
    }

    /// Credentials for calls made on behalf of `account`
    pub async fn resolve(
        &self,
        account: &AccountHandle,
    ) -> std::result::Result<ResolvedCredential, CredentialError> {
        let Some(role) = account.role_arn() else {
            return Ok(self.base.clone());
        };

        let role_arn = qualify_role_arn(account.account_id(), role);
        let endpoint = exchange_endpoint(&role_arn, &self.endpoints);

        tracing::debug!(
            account = account.account_id(),
            role_arn = %role_arn,
            endpoint,
            "Assuming role"
        );

        self.exchange
            .assume_role(&AssumeRoleRequest {
                endpoint,
                role_arn: &role_arn,
                session_name: account.session_name(),
                base: &self.base,
            })
            .await
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ExchangeKey {
    endpoint: String,
    role_arn: String,
    session_name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AssumeRoleEnvelope {
    assume_role_response: AssumeRoleResponse,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AssumeRoleResponse {
    assume_role_result: AssumeRoleResult,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AssumeRoleResult {
    credentials: ExchangedCredentials,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ExchangedCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: String,
    /// Epoch seconds
    expiration: f64,
}

/// Role exchange over the STS query protocol with JSON responses
///
/// Gateway auth: the base access key id goes out as the bearer token and the
/// session token, when present, in `x-amz-security-token`. The secret access
/// key never leaves the process; it is carried in [`ResolvedCredential`] for
/// callers that sign requests themselves. Exchanged credentials are kept per
/// (endpoint, role, session) until `expiry_buffer` before they expire.
#[derive(Clone)]
pub struct HttpRoleExchange {
    client: reqwest::Client,
    expiry_buffer: Duration,
    cache: Arc<RwLock<HashMap<ExchangeKey, ResolvedCredential>>>,
}

impl HttpRoleExchange {
    pub fn new(timeout: Duration, expiry_buffer: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("cloudcache/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            expiry_buffer,
            cache: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    async fn exchange(&self, request: &AssumeRoleRequest<'_>) -> Result<ResolvedCredential> {
        let mut url = url::Url::parse(request.endpoint).context("Invalid exchange endpoint")?;
        url.query_pairs_mut()
            .append_pair("Action", "AssumeRole")
            .append_pair("Version", "2011-06-15")
            .append_pair("RoleArn", request.role_arn)
            .append_pair("RoleSessionName", request.session_name);

        let mut builder = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "application/json")
            .bearer_auth(&request.base.access_key_id);
        if let Some(token) = &request.base.session_token {
            builder = builder.header("x-amz-security-token", token.expose());
        }

        let response = builder.send().await.context("Failed to send request")?;
        let status = response.status();
        let body = response
            .text()
            .await
            .context("Failed to read response body")?;

        if !status.is_success() {
            tracing::error!("Role exchange error: {} - {}", status, sanitize_for_log(&body));
            return Err(anyhow::anyhow!("Role exchange failed: {}", status));
        }

        let envelope: AssumeRoleEnvelope =
            serde_json::from_str(&body).context("Failed to parse role exchange response")?;
        let creds = envelope.assume_role_response.assume_role_result.credentials;

        let expiry = DateTime::<Utc>::from_timestamp(creds.expiration.trunc() as i64, 0)
            .context("Role exchange returned an invalid expiration")?;

        Ok(ResolvedCredential {
            access_key_id: creds.access_key_id,
            secret_access_key: Secret::new(creds.secret_access_key),
            session_token: Some(Secret::new(creds.session_token)),
            expiry: Some(expiry),
        })
    }
}

#[async_trait]
impl RoleExchange for HttpRoleExchange {
    async fn assume_role(
        &self,
        request: &AssumeRoleRequest<'_>,
    ) -> std::result::Result<ResolvedCredential, CredentialError> {
        let key = ExchangeKey {
            endpoint: request.endpoint.to_string(),
            role_arn: request.role_arn.to_string(),
            session_name: request.session_name.to_string(),
        };

        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.get(&key) {
                if cached.is_fresh_at(Utc::now(), self.expiry_buffer) {
                    return Ok(cached.clone());
                }
                tracing::debug!("Exchanged credentials for {} expired, refreshing", request.role_arn);
            }
        }

        let credential = self.exchange(request).await.map_err(|e| CredentialError {
            role_arn: request.role_arn.to_string(),
            endpoint: request.endpoint.to_string(),
            reason: format!("{:#}", e),
        })?;

        {
            let mut cache = self.cache.write().await;
            if credential.is_fresh_at(Utc::now(), self.expiry_buffer) {
                cache.insert(key, credential.clone());
            } else {
                cache.remove(&key);
            }
        }

        Ok(credential)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingExchange {
        seen: Mutex<Vec<(String, String, String)>>,
    }

    #[async_trait]
    impl RoleExchange for RecordingExchange {
        async fn assume_role(
            &self,
            request: &AssumeRoleRequest<'_>,
        ) -> std::result::Result<ResolvedCredential, CredentialError> {
            self.seen.lock().unwrap().push((
                request.endpoint.to_string(),
                request.role_arn.to_string(),
                request.session_name.to_string(),
            ));
            Ok(ResolvedCredential::new("ASIAEXCHANGED", "secret", Some("token")))
        }
    }

    fn resolver() -> (CredentialResolver, Arc<RecordingExchange>) {
        let exchange = Arc::new(RecordingExchange {
            seen: Mutex::new(Vec::new()),
        });
        let resolver = CredentialResolver::new(
            ResolvedCredential::new("AKIABASE", "base-secret", None),
            exchange.clone(),
            ExchangeEndpoints::default(),
        );
        (resolver, exchange)
    }

    #[test]
    fn test_qualify_bare_role() {
        assert_eq!(
            qualify_role_arn("1234", "deploy-role"),
            "arn:aws:iam::1234:deploy-role"
        );
    }

    #[test]
    fn test_qualify_keeps_full_arn() {
        let arn = "arn:aws-us-gov:iam::5678:role/deploy";
        assert_eq!(qualify_role_arn("1234", arn), arn);
    }

    #[test]
    fn test_endpoint_selection() {
        let endpoints = ExchangeEndpoints::default();
        assert_eq!(
            exchange_endpoint("arn:aws-us-gov:iam::1:role/x", &endpoints),
            GOVCLOUD_EXCHANGE_ENDPOINT
        );
        assert_eq!(
            exchange_endpoint("arn:aws-cn:iam::1:role/x", &endpoints),
            CHINA_EXCHANGE_ENDPOINT
        );
        assert_eq!(
            exchange_endpoint("arn:aws:iam::1:role/x", &endpoints),
            DEFAULT_EXCHANGE_ENDPOINT
        );
    }

    #[test]
    fn test_secret_is_redacted() {
        let cred = ResolvedCredential::new("AKIA", "super-secret", Some("tok"));
        let rendered = format!("{:?}", cred);
        assert!(!rendered.contains("super-secret"));
        assert!(!rendered.contains("tok\""));
    }

    #[test]
    fn test_freshness_respects_buffer() {
        let now = Utc::now();
        let mut cred = ResolvedCredential::new("AKIA", "s", None);
        assert!(cred.is_fresh_at(now, DEFAULT_EXPIRY_BUFFER));

        cred.expiry = Some(now + chrono::Duration::seconds(30));
        assert!(!cred.is_fresh_at(now, DEFAULT_EXPIRY_BUFFER));

        cred.expiry = Some(now + chrono::Duration::seconds(3600));
        assert!(cred.is_fresh_at(now, DEFAULT_EXPIRY_BUFFER));
    }

    #[tokio::test]
    async fn test_no_role_returns_base() {
        let (resolver, exchange) = resolver();
        let account = AccountHandle::new("1234", "ec2", "us-east-1", None, Some("s"));

        let cred = resolver.resolve(&account).await.unwrap();
        assert_eq!(cred.access_key_id, "AKIABASE");
        assert!(exchange.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bare_role_is_expanded_before_exchange() {
        let (resolver, exchange) = resolver();
        let account = AccountHandle::new("1234", "ecs", "us-east-1", Some("deploy-role"), Some("s"));

        let cred = resolver.resolve(&account).await.unwrap();
        assert_eq!(cred.access_key_id, "ASIAEXCHANGED");

        let seen = exchange.seen.lock().unwrap();
        assert_eq!(
            seen.as_slice(),
            &[(
                DEFAULT_EXCHANGE_ENDPOINT.to_string(),
                "arn:aws:iam::1234:deploy-role".to_string(),
                "s".to_string()
            )]
        );
    }
}

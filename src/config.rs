//! Configuration Management
//!
//! Loads the YAML configuration for cloudcache. The default location is
//! `{config_dir}/cloudcache/config.yaml`.

use crate::agent::AgentDef;
use crate::backend::BackendConfig;
use crate::provider::{AccountHandle, ExchangeEndpoints};
use crate::rate_limit::RateBudget;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_expiry_buffer_secs() -> u64 {
    60
}

fn default_exchange_timeout_ms() -> u64 {
    5_000
}

fn default_live_timeout_ms() -> u64 {
    10_000
}

fn default_worker_pool_size() -> usize {
    8
}

fn default_cycle_timeout_secs() -> u64 {
    300
}

/// Role exchange settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ExchangeConfig {
    #[serde(flatten)]
    pub endpoints: ExchangeEndpoints,
    /// Exchanged credentials are refreshed this long before they expire
    #[serde(default = "default_expiry_buffer_secs")]
    pub expiry_buffer_secs: u64,
    #[serde(default = "default_exchange_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            endpoints: ExchangeEndpoints::default(),
            expiry_buffer_secs: default_expiry_buffer_secs(),
            timeout_ms: default_exchange_timeout_ms(),
        }
    }
}

/// Live provider gateway
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LiveConfig {
    pub endpoint: String,
    #[serde(default = "default_live_timeout_ms")]
    pub timeout_ms: u64,
}

/// One provider account and the regions to poll in it
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AccountConfig {
    pub account_id: String,
    pub regions: Vec<String>,
    #[serde(default)]
    pub role_arn: Option<String>,
    #[serde(default)]
    pub session_name: Option<String>,
}

impl AccountConfig {
    /// One handle per configured region, scoped to `service`
    pub fn handles(&self, service: &str) -> Vec<AccountHandle> {
        self.regions
            .iter()
            .map(|region| {
                AccountHandle::new(
                    &self.account_id,
                    service,
                    region,
                    self.role_arn.as_deref(),
                    self.session_name.as_deref(),
                )
            })
            .collect()
    }
}

/// Process configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub cache_backend: BackendConfig,
    pub live: LiveConfig,
    #[serde(default)]
    pub exchange: ExchangeConfig,
    #[serde(default)]
    pub rate_limits: Vec<RateBudget>,
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
    #[serde(default)]
    pub agents: Vec<AgentDef>,
    /// Services whose registry operations bypass the cache backend
    #[serde(default)]
    pub disabled_services: Vec<String>,
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,
    /// Default cycle timeout for agents that do not set their own
    #[serde(default = "default_cycle_timeout_secs")]
    pub cycle_timeout_secs: u64,
}

impl Config {
    /// Get the default config file path
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("cloudcache").join("config.yaml"))
    }

    /// Parse configuration from YAML text
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content).context("Failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from `path`, or from the default location
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::default_path().context("Could not determine config directory")?,
        };

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_yaml(&content)
    }

    fn validate(&self) -> Result<()> {
        if self.cache_backend.base_url.trim().is_empty() {
            anyhow::bail!("cache_backend.base_url must not be empty");
        }
        if self.live.endpoint.trim().is_empty() {
            anyhow::bail!("live.endpoint must not be empty");
        }
        for account in &self.accounts {
            if account.regions.is_empty() {
                anyhow::bail!("Account {} has no regions", account.account_id);
            }
        }
        for budget in &self.rate_limits {
            if budget.capacity == 0 {
                anyhow::bail!("Rate limit for {} has zero capacity", budget.service);
            }
            if budget.window.is_zero() {
                anyhow::bail!("Rate limit for {} has a zero window_ms", budget.service);
            }
        }
        for agent in &self.agents {
            if agent.interval_secs == 0 {
                anyhow::bail!("Agent {} has a zero interval", agent.resource_type);
            }
        }
        Ok(())
    }

    pub fn cycle_timeout(&self, agent: &AgentDef) -> Duration {
        Duration::from_secs(agent.cycle_timeout_secs.unwrap_or(self.cycle_timeout_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackoffStrategy;
    use std::io::Write;

    const MINIMAL: &str = "\
cache_backend:
  base_url: http://cache.internal:7001
live:
  endpoint: http://gateway.internal
";

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = Config::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.cache_backend.api_version, "v2");
        assert_eq!(config.cache_backend.provider, "aws");
        assert!(config.cache_backend.expand);
        assert_eq!(config.cache_backend.connect_timeout_ms, 1_000);
        assert_eq!(config.cache_backend.socket_timeout_ms, 5_000);
        assert_eq!(config.cache_backend.retry.base_delay_ms, 50);
        assert_eq!(config.cache_backend.retry.backoff_ms, 10);
        assert_eq!(config.cache_backend.retry.max_attempts, 3);
        assert_eq!(config.exchange.endpoints, ExchangeEndpoints::default());
        assert_eq!(config.worker_pool_size, 8);
        assert!(config.agents.is_empty());
    }

    #[test]
    fn test_full_config() {
        let yaml = "\
cache_backend:
  base_url: http://cache.internal:7001
  meta_envelope: true
  retry:
    max_attempts: 5
    strategy: exponential
live:
  endpoint: http://gateway.internal
exchange:
  govcloud: https://sts.example.gov
  expiry_buffer_secs: 120
rate_limits:
  - service: ec2
    capacity: 10
    window_ms: 1000
  - service: ec2
    account: \"9999\"
    capacity: 2
    window_ms: 1000
    blocking: false
accounts:
  - account_id: \"1234\"
    regions: [us-east-1, us-west-2]
    role_arn: role/deploy
agents:
  - resource_type: autoScalingGroups
    service: autoscaling
    list_operation: describeAutoScalingGroups
    describe_operation: describeAutoScalingGroups
    ids_param: autoScalingGroupNames
    id_field: autoScalingGroupName
    items_field: autoScalingGroups
    interval_secs: 30
disabled_services: [elbv2]
";
        let config = Config::from_yaml(yaml).unwrap();
        assert!(config.cache_backend.meta_envelope);
        assert_eq!(config.cache_backend.retry.strategy, BackoffStrategy::Exponential);
        assert_eq!(config.cache_backend.retry.base_delay_ms, 50);
        assert_eq!(config.exchange.endpoints.govcloud, "https://sts.example.gov");
        assert_eq!(config.exchange.endpoints.default, "https://sts.amazonaws.com");
        assert_eq!(config.exchange.expiry_buffer_secs, 120);
        assert_eq!(config.rate_limits.len(), 2);
        assert!(!config.rate_limits[1].blocking);
        assert_eq!(config.disabled_services, vec!["elbv2"]);

        let handles = config.accounts[0].handles("autoscaling");
        assert_eq!(handles.len(), 2);
        assert_eq!(handles[1].region(), "us-west-2");
        assert_eq!(handles[0].role_arn(), Some("role/deploy"));

        let agent = &config.agents[0];
        assert_eq!(agent.interval_secs, 30);
        assert_eq!(config.cycle_timeout(agent), Duration::from_secs(300));
    }

    #[test]
    fn test_missing_live_endpoint_is_rejected() {
        let yaml = "cache_backend:\n  base_url: http://cache.internal\nlive:\n  endpoint: \"\"\n";
        assert!(Config::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_account_without_regions_is_rejected() {
        let yaml = format!("{}accounts:\n  - account_id: \"1\"\n    regions: []\n", MINIMAL);
        assert!(Config::from_yaml(&yaml).is_err());
    }

    #[test]
    fn test_zero_capacity_budget_is_rejected() {
        let yaml = format!("{}rate_limits:\n  - service: ec2\n    capacity: 0\n    window_ms: 1000\n", MINIMAL);
        let err = Config::from_yaml(&yaml).unwrap_err();
        assert!(err.to_string().contains("zero capacity"));
    }

    #[test]
    fn test_zero_window_budget_is_rejected() {
        let yaml = format!("{}rate_limits:\n  - service: ec2\n    capacity: 5\n    window_ms: 0\n", MINIMAL);
        let err = Config::from_yaml(&yaml).unwrap_err();
        assert!(err.to_string().contains("zero window_ms"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.live.endpoint, "http://gateway.internal");
        assert_eq!(config.live.timeout_ms, 10_000);
    }

    #[test]
    fn test_load_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(Some(&dir.path().join("absent.yaml"))).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}

//! Gatekeeper configuration.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::conntrack::TrackingPolicy;
use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct GateConfig {
    /// NFQUEUE number used by the redirect rules and the listener.
    pub queue_num: u16,
    /// How long an unclassified connection is let through.
    pub grace_period_ms: u64,
    /// Privileged rule tool.
    pub iptables_bin: String,
    /// Upper bound on waiting for the packet thread to exit.
    pub join_timeout_ms: u64,
    /// Table size that triggers an idle sweep.
    pub max_tracked_connections: usize,
    /// Idle age after which a swept entry is evicted.
    pub idle_timeout_secs: u64,
    /// Initial allow-list.
    pub allowed_domains: Vec<String>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            queue_num: 1,
            grace_period_ms: 2000,
            iptables_bin: "iptables".to_string(),
            join_timeout_ms: 2000,
            max_tracked_connections: 65_536,
            idle_timeout_secs: 300,
            allowed_domains: vec![
                "github.com".to_string(),
                "stackoverflow.com".to_string(),
                "docs.python.org".to_string(),
            ],
        }
    }
}

impl GateConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: GateConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.grace_period_ms == 0 {
            return Err(ConfigError::Invalid("grace_period_ms must be positive".into()));
        }
        if self.join_timeout_ms == 0 {
            return Err(ConfigError::Invalid("join_timeout_ms must be positive".into()));
        }
        if self.max_tracked_connections == 0 {
            return Err(ConfigError::Invalid(
                "max_tracked_connections must be positive".into(),
            ));
        }
        if self.iptables_bin.trim().is_empty() {
            return Err(ConfigError::Invalid("iptables_bin must not be empty".into()));
        }
        Ok(())
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn tracking_policy(&self) -> TrackingPolicy {
        TrackingPolicy {
            grace_period: self.grace_period(),
            max_entries: self.max_tracked_connections,
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
        }
    }
}

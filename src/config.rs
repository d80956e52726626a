//! TOML configuration for a registry node. Every threshold and interval the
//! runtime loops consult lives here; an empty file yields a usable
//! single-node setup.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::replication::{ReplicationOptions, RetryConfig};

pub const CONFIG_FILENAME: &str = "herdbook.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegistryConfig {
    #[serde(default = "default_node_name")]
    pub node_name: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Base URLs of the other registry nodes, e.g. `http://registry-2:8761`.
    #[serde(default)]
    pub peers: Vec<String>,
    #[serde(default)]
    pub lease: LeaseConfig,
    #[serde(default)]
    pub preservation: PreservationConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub replication: ReplicationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LeaseConfig {
    /// How often clients are expected to renew.
    #[serde(default = "default_renewal_interval_secs")]
    pub renewal_interval_secs: u64,
    /// Lease duration = renewal interval x this multiplier.
    #[serde(default = "default_duration_multiplier")]
    pub duration_multiplier: u64,
    #[serde(default = "default_eviction_interval_secs")]
    pub eviction_interval_secs: u64,
    /// Upper bound of the random pause between individual evictions.
    #[serde(default = "default_eviction_jitter_ms")]
    pub eviction_jitter_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PreservationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Fraction of expected renewals per minute that must arrive for
    /// eviction to stay enabled.
    #[serde(default = "default_renewal_percent_threshold")]
    pub renewal_percent_threshold: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    #[serde(default = "default_rebuild_interval_secs")]
    pub rebuild_interval_secs: u64,
    #[serde(default = "default_changelog_capacity")]
    pub changelog_capacity: usize,
    #[serde(default = "default_delta_retention_secs")]
    pub delta_retention_secs: u64,
    /// Delta responses beyond this many live cache entries are served
    /// uncached.
    #[serde(default = "default_delta_entry_cap")]
    pub delta_entry_cap: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReplicationConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_batch_max")]
    pub batch_max: usize,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_replay_log_size")]
    pub replay_log_size: usize,
}

fn default_node_name() -> String {
    "herdbook-1".to_string()
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8761
}
fn default_renewal_interval_secs() -> u64 {
    30
}
fn default_duration_multiplier() -> u64 {
    3
}
fn default_eviction_interval_secs() -> u64 {
    60
}
fn default_eviction_jitter_ms() -> u64 {
    100
}
fn default_true() -> bool {
    true
}
fn default_renewal_percent_threshold() -> f64 {
    0.85
}
fn default_rebuild_interval_secs() -> u64 {
    30
}
fn default_changelog_capacity() -> usize {
    1024
}
fn default_delta_retention_secs() -> u64 {
    180
}
fn default_delta_entry_cap() -> usize {
    32
}
fn default_queue_capacity() -> usize {
    1000
}
fn default_batch_max() -> usize {
    250
}
fn default_heartbeat_interval_secs() -> u64 {
    30
}
fn default_send_timeout_secs() -> u64 {
    5
}
fn default_retry_max_attempts() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    500
}
fn default_replay_log_size() -> usize {
    64
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            renewal_interval_secs: default_renewal_interval_secs(),
            duration_multiplier: default_duration_multiplier(),
            eviction_interval_secs: default_eviction_interval_secs(),
            eviction_jitter_ms: default_eviction_jitter_ms(),
        }
    }
}

impl Default for PreservationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            renewal_percent_threshold: default_renewal_percent_threshold(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            rebuild_interval_secs: default_rebuild_interval_secs(),
            changelog_capacity: default_changelog_capacity(),
            delta_retention_secs: default_delta_retention_secs(),
            delta_entry_cap: default_delta_entry_cap(),
        }
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            batch_max: default_batch_max(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            send_timeout_secs: default_send_timeout_secs(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            replay_log_size: default_replay_log_size(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            node_name: default_node_name(),
            host: default_host(),
            port: default_port(),
            peers: Vec::new(),
            lease: LeaseConfig::default(),
            preservation: PreservationConfig::default(),
            cache: CacheConfig::default(),
            replication: ReplicationConfig::default(),
        }
    }
}

impl RegistryConfig {
    /// Load from `path`, or fall back to defaults when no path is given.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => load_config_from_path(path)?,
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_name.is_empty() {
            anyhow::bail!("node_name must not be empty");
        }
        if self.port == 0 {
            anyhow::bail!("port must be non-zero");
        }
        if self.lease.renewal_interval_secs == 0 {
            anyhow::bail!("lease.renewal_interval_secs must be at least 1");
        }
        if self.lease.duration_multiplier == 0 {
            anyhow::bail!("lease.duration_multiplier must be at least 1");
        }
        let threshold = self.preservation.renewal_percent_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            anyhow::bail!(
                "preservation.renewal_percent_threshold must be in (0, 1], got {}",
                threshold
            );
        }
        if self.replication.batch_max == 0 {
            anyhow::bail!("replication.batch_max must be at least 1");
        }
        for peer in &self.peers {
            if !peer.starts_with("http://") && !peer.starts_with("https://") {
                anyhow::bail!("peer '{}' must be an http(s) base URL", peer);
            }
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn lease_duration_ms(&self) -> u64 {
        self.lease.renewal_interval_secs * self.lease.duration_multiplier * 1000
    }

    pub fn eviction_interval(&self) -> Duration {
        Duration::from_secs(self.lease.eviction_interval_secs)
    }

    pub fn rebuild_interval(&self) -> Duration {
        Duration::from_secs(self.cache.rebuild_interval_secs)
    }

    pub fn delta_retention_ms(&self) -> u64 {
        self.cache.delta_retention_secs * 1000
    }

    pub fn replication_options(&self) -> ReplicationOptions {
        ReplicationOptions {
            node_name: self.node_name.clone(),
            peers: self.peers.clone(),
            queue_capacity: self.replication.queue_capacity,
            batch_max: self.replication.batch_max,
            heartbeat_interval: Duration::from_secs(self.replication.heartbeat_interval_secs),
            send_timeout: Duration::from_secs(self.replication.send_timeout_secs),
            retry: RetryConfig {
                max_attempts: self.replication.retry_max_attempts,
                delay: Duration::from_millis(self.replication.retry_delay_ms),
                ..Default::default()
            },
            replay_log_size: self.replication.replay_log_size,
        }
    }
}

pub fn load_config_from_path(path: impl AsRef<Path>) -> Result<RegistryConfig> {
    let content = std::fs::read_to_string(path.as_ref())
        .with_context(|| format!("Failed to read {}", path.as_ref().display()))?;
    let config: RegistryConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse {}", path.as_ref().display()))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config: RegistryConfig = toml::from_str("").unwrap();
        assert_eq!(config.node_name, "herdbook-1");
        assert_eq!(config.port, 8761);
        assert!(config.peers.is_empty());
        assert_eq!(config.lease.renewal_interval_secs, 30);
        assert_eq!(config.lease.duration_multiplier, 3);
        assert!(config.preservation.enabled);
        assert_eq!(config.cache.changelog_capacity, 1024);
        assert_eq!(config.replication.batch_max, 250);
        config.validate().unwrap();
        assert_eq!(config.lease_duration_ms(), 90_000);
    }

    #[test]
    fn full_toml_parses() {
        let toml = r#"
node_name = "registry-a"
host = "127.0.0.1"
port = 9000
peers = ["http://registry-b:9000", "http://registry-c:9000"]

[lease]
renewal_interval_secs = 10
duration_multiplier = 2

[preservation]
enabled = false
renewal_percent_threshold = 0.5

[cache]
delta_retention_secs = 60

[replication]
batch_max = 50
heartbeat_interval_secs = 5
"#;
        let config: RegistryConfig = toml::from_str(toml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.node_name, "registry-a");
        assert_eq!(config.peers.len(), 2);
        assert_eq!(config.lease_duration_ms(), 20_000);
        assert!(!config.preservation.enabled);
        assert_eq!(config.cache.delta_retention_secs, 60);
        // Untouched sections keep their defaults.
        assert_eq!(config.lease.eviction_interval_secs, 60);
        assert_eq!(config.replication.queue_capacity, 1000);

        let options = config.replication_options();
        assert_eq!(options.node_name, "registry-a");
        assert_eq!(options.batch_max, 50);
        assert_eq!(options.heartbeat_interval, Duration::from_secs(5));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let result = toml::from_str::<RegistryConfig>("renewal_interval = 30");
        assert!(result.is_err());
    }

    #[test]
    fn load_config_not_found() {
        let result = load_config_from_path("/nonexistent/herdbook.toml");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("Failed to read"));
    }

    #[test]
    fn load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILENAME);
        std::fs::write(&path, "node_name = \"from-file\"\n").unwrap();

        let config = RegistryConfig::load_or_default(Some(&path)).unwrap();
        assert_eq!(config.node_name, "from-file");
        assert_eq!(config.port, 8761);
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut config = RegistryConfig::default();
        config.port = 0;
        assert!(config.validate().is_err());

        let mut config = RegistryConfig::default();
        config.preservation.renewal_percent_threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = RegistryConfig::default();
        config.peers = vec!["registry-b:9000".to_string()];
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("http(s) base URL"));
    }
}

//! Configuration types for kvmesh
//!
//! This module defines configuration structures used across components.
//! All sections deserialize with defaults so a partial file is valid.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

/// Default number of partitions
pub const DEFAULT_PARTITION_COUNT: u64 = 271;

/// Root configuration for kvmesh
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Node configuration
    pub node: NodeConfig,
    /// Cluster configuration
    pub cluster: ClusterConfig,
    /// Balancer configuration
    pub balancer: BalancerConfig,
    /// Storage engine configuration
    pub storage: StorageConfig,
    /// Member-to-member transport configuration
    pub transport: TransportConfig,
    /// Per-dmap settings, keyed by dmap name
    pub dmaps: HashMap<String, DMapConfig>,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Validate the configuration, failing fast on unusable values
    pub fn validate(&self) -> Result<()> {
        self.node
            .bind_addr
            .parse::<SocketAddr>()
            .map_err(|e| Error::configuration(format!("invalid bind_addr {}: {e}", self.node.bind_addr)))?;

        if self.cluster.partition_count == 0 {
            return Err(Error::configuration("partition_count must be greater than 0"));
        }
        if self.cluster.replica_count == 0 {
            return Err(Error::configuration("replica_count must be greater than 0"));
        }
        if self.cluster.member_count_quorum == 0 {
            return Err(Error::configuration(
                "member_count_quorum must be greater than 0",
            ));
        }
        if self.cluster.member_failure_threshold == 0 {
            return Err(Error::configuration(
                "member_failure_threshold must be greater than 0",
            ));
        }
        if self.storage.table_capacity == 0 {
            return Err(Error::configuration("table_capacity must be greater than 0"));
        }
        if self.transport.request_timeout_ms == 0 {
            return Err(Error::configuration("request_timeout_ms must be greater than 0"));
        }
        for peer in &self.cluster.peers {
            if !peer.contains(':') {
                return Err(Error::configuration(format!(
                    "peer {peer} must be in host:port form"
                )));
            }
        }
        Ok(())
    }

    /// Name this node advertises to the cluster (`host:port`)
    #[must_use]
    pub fn advertise_name(&self) -> String {
        self.node
            .advertise_addr
            .clone()
            .unwrap_or_else(|| self.node.bind_addr.clone())
    }

    /// Settings for a dmap, falling back to defaults
    #[must_use]
    pub fn dmap(&self, name: &str) -> DMapConfig {
        self.dmaps.get(name).cloned().unwrap_or_default()
    }
}

/// Node identity configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Address the transport server binds to
    pub bind_addr: String,
    /// Address other members use to reach this node, if it differs
    pub advertise_addr: Option<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3320".to_string(),
            advertise_addr: None,
        }
    }
}

/// Cluster configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Number of partitions (fixed for the cluster's lifetime)
    pub partition_count: u64,
    /// Copies of each partition, primary included
    pub replica_count: usize,
    /// Minimum live members required to operate
    pub member_count_quorum: usize,
    /// Static seed members in `host:port` form
    pub peers: Vec<String>,
    /// How often the coordinator broadcasts its routing table (milliseconds)
    pub routing_push_interval_ms: u64,
    /// Consecutive failed broadcasts before a member is removed
    pub member_failure_threshold: u32,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            partition_count: DEFAULT_PARTITION_COUNT,
            replica_count: 1,
            member_count_quorum: 1,
            peers: Vec::new(),
            routing_push_interval_ms: 1000,
            member_failure_threshold: 5,
        }
    }
}

impl ClusterConfig {
    /// Routing broadcast interval
    #[must_use]
    pub const fn routing_push_interval(&self) -> Duration {
        Duration::from_millis(self.routing_push_interval_ms)
    }
}

/// Balancer configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    /// Balance cycle interval (milliseconds)
    pub interval_ms: u64,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self { interval_ms: 1000 }
    }
}

impl BalancerConfig {
    /// Balance cycle interval
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Storage engine configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Entries a table holds before a new one is allocated
    pub table_capacity: usize,
    /// Entries moved per compaction step
    pub compaction_batch: usize,
    /// Pause between compaction steps (milliseconds)
    pub compaction_interval_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            table_capacity: 65_536,
            compaction_batch: 1024,
            compaction_interval_ms: 10,
        }
    }
}

/// Member-to-member transport configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Timeout for a single request (milliseconds)
    pub request_timeout_ms: u64,
    /// Maximum accepted request body (bytes)
    pub max_message_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 5000,
            max_message_size: 256 * 1024 * 1024, // 256 MB
        }
    }
}

impl TransportConfig {
    /// Request timeout
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Per-dmap configuration
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DMapConfig {
    /// Track per-key last access time (carried along on migration)
    pub track_access: bool,
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level filter when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.cluster.partition_count, 271);
        assert_eq!(config.cluster.replica_count, 1);
        assert_eq!(config.advertise_name(), "127.0.0.1:3320");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_partitions() {
        let mut config = Config::default();
        config.cluster.partition_count = 0;
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_validate_rejects_bad_peer() {
        let mut config = Config::default();
        config.cluster.peers.push("no-port".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"cluster": {"partition_count": 7}}"#).unwrap();
        assert_eq!(config.cluster.partition_count, 7);
        assert_eq!(config.cluster.member_count_quorum, 1);
        assert!(!config.dmap("sessions").track_access);
    }
}

//! Process configuration loaded from `config.toml`, mirroring
//! `blockframe::config::Config::load()`'s read-then-parse shape but with
//! fields for the RAID-5 cluster instead of an archive/mount/cache setup.
//!
//! A single `config.toml` describes the whole four-node cluster; the
//! coordinator process and each of the four node processes all load it, and
//! a node binds its *own* identity from a `--node-id` CLI flag rather than
//! from any "current node" default in the file itself (Design Notes flag a
//! hard-coded ambient node id as something to retire).

use std::{fs, path::Path};

use serde::Deserialize;

use crate::error::ConfigError;

/// One storage node's cluster-visible identity: the id the placement
/// formula `P(s) = ((s mod N) + 1)` assigns stripe parity/data roles by, the
/// URL the coordinator reaches it on, and the directory/port it binds when
/// it runs as that node.
#[derive(Debug, Deserialize, Clone)]
pub struct NodeConfig {
    pub id: u32,
    pub url: String,
    pub listen_port: u16,
    pub data_dir: String,
    pub capacity_bytes: u64,
}

/// System parameters from the distilled spec's External Interfaces section.
#[derive(Debug, Deserialize, Clone)]
pub struct ClusterConfig {
    pub nodes: Vec<NodeConfig>,
    /// Stripe cell size in bytes (default 64 KiB; must stay within
    /// `[1 KiB, 1 MiB]`, enforced by [`crate::coordinator::ClusterParams::validate`]).
    pub block_size: usize,
    /// Upper bound on a single upload (default 100 MiB).
    pub max_file_size: u64,
    pub request_timeout_secs: u64,
    pub max_retry_attempts: u32,
    pub retry_delay_secs: u64,
    pub max_connections_per_server: usize,
    pub compression_enabled: bool,
    pub compression_threshold_bytes: usize,
    /// Seconds between `HealthMonitor::check_all` ticks (default 30).
    pub health_check_interval_secs: u64,
    /// Minutes of heartbeat absence before a node is considered stale,
    /// feeding `isHealthy`'s `(now - lastHeartbeat) < T_stale` term.
    pub node_failure_threshold_minutes: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub coordinator_port: u16,
    pub catalog_dir: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    pub level: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub cluster: ClusterConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Reads and parses `path` (typically `config.toml` in the current
    /// directory). Fatal at startup on any failure — a malformed cluster
    /// config should never silently fall back to defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)
            .map_err(|e| ConfigError::Load(format!("reading {}: {e}", path.display())))?;
        toml::from_str(&content).map_err(|e| ConfigError::Load(format!("parsing {}: {e}", path.display())))
    }

    pub fn node(&self, node_id: u32) -> Result<&NodeConfig, ConfigError> {
        self.cluster
            .nodes
            .iter()
            .find(|n| n.id == node_id)
            .ok_or_else(|| {
                ConfigError::Invalid(format!("no node with id {node_id} in cluster config"))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_toml() -> &'static str {
        r#"
        [cluster]
        block_size = 65536
        max_file_size = 104857600
        request_timeout_secs = 10
        max_retry_attempts = 3
        retry_delay_secs = 1
        max_connections_per_server = 8
        compression_enabled = true
        compression_threshold_bytes = 8192
        health_check_interval_secs = 30
        node_failure_threshold_minutes = 2

        [[cluster.nodes]]
        id = 1
        url = "http://127.0.0.1:8101"
        listen_port = 8101
        data_dir = "./data/node1"
        capacity_bytes = 1073741824

        [[cluster.nodes]]
        id = 2
        url = "http://127.0.0.1:8102"
        listen_port = 8102
        data_dir = "./data/node2"
        capacity_bytes = 1073741824

        [server]
        coordinator_port = 8080
        catalog_dir = "./data/catalog"

        [logging]
        level = "info"
        "#
    }

    #[test]
    fn parses_a_well_formed_config() {
        let config: Config = toml::from_str(sample_toml()).unwrap();
        assert_eq!(config.cluster.nodes.len(), 2);
        assert_eq!(config.cluster.block_size, 65536);
        assert_eq!(config.server.coordinator_port, 8080);
    }

    #[test]
    fn node_lookup_finds_by_id_and_rejects_unknown() {
        let config: Config = toml::from_str(sample_toml()).unwrap();
        assert_eq!(config.node(2).unwrap().listen_port, 8102);
        assert!(config.node(99).is_err());
    }

    #[test]
    fn load_surfaces_a_config_error_when_file_is_missing() {
        let result = Config::load(Path::new("/nonexistent/config.toml"));
        assert!(matches!(result, Err(ConfigError::Load(_))));
    }
}

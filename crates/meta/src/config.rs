//! Configuration module for the meta server
//!
//! Supports YAML configuration files with module-based organization. Every
//! section and field has a default, so a partial file (or none) is valid.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaConfig {
    /// HTTP server configuration
    pub server: ServerConfig,
    /// Managed cluster and its bootstrap topology
    pub cluster: ClusterConfig,
    /// Topology store configuration
    pub storage: StorageConfig,
    /// Procedure execution configuration
    pub procedure: ProcedureConfig,
    /// Leadership configuration
    pub election: ElectionConfig,
    /// Logging configuration
    pub log: LogConfig,
}

impl MetaConfig {
    /// Load configuration from YAML file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
        Self::from_yaml(&content)
    }

    /// Load configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_yaml::from_str(yaml).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to YAML file
    pub fn to_file(&self, path: impl AsRef<std::path::Path>) -> Result<(), ConfigError> {
        let yaml =
            serde_yaml::to_string(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;
        std::fs::write(path, yaml).map_err(|e| ConfigError::IoError(e.to_string()))?;
        Ok(())
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cluster.name.is_empty() {
            return Err(ConfigError::Invalid("cluster.name is empty".into()));
        }
        for shard in &self.cluster.shards {
            if !self.cluster.nodes.iter().any(|n| n.name == shard.leader) {
                return Err(ConfigError::Invalid(format!(
                    "bootstrap shard leader {} is not a bootstrap node",
                    shard.leader
                )));
            }
        }
        if self.procedure.step_timeout_ms == 0 {
            return Err(ConfigError::Invalid("procedure.step_timeout_ms is 0".into()));
        }
        Ok(())
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP API listen address
    pub http_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
        }
    }
}

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Cluster name
    pub name: String,
    /// Nodes registered at startup
    pub nodes: Vec<BootstrapNode>,
    /// Shards created at startup if the cluster has none
    pub shards: Vec<BootstrapShard>,
    /// Full reload interval of the topology view in seconds
    pub view_refresh_interval_secs: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            nodes: Vec::new(),
            shards: Vec::new(),
            view_refresh_interval_secs: default_view_refresh_interval_secs(),
        }
    }
}

impl ClusterConfig {
    /// Get view refresh interval as Duration
    pub fn view_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.view_refresh_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootstrapNode {
    pub name: String,
    pub addr: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootstrapShard {
    pub leader: String,
    #[serde(default)]
    pub replicas: Vec<String>,
}

/// Topology store backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    File,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Data storage directory (file backend)
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::File,
            data_dir: PathBuf::from("./meta_data"),
        }
    }
}

/// Procedure execution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcedureConfig {
    /// Retries of a failing step before the procedure fails
    pub max_step_retries: u32,
    /// Pause between step retries in milliseconds
    pub retry_interval_ms: u64,
    /// Timeout of a single step attempt in milliseconds
    pub step_timeout_ms: u64,
    /// Timeout of a shard control request in milliseconds
    pub rpc_timeout_ms: u64,
    /// Finished procedure records kept by gc
    pub gc_keep: usize,
    /// Procedure gc interval in seconds
    pub gc_interval_secs: u64,
}

impl Default for ProcedureConfig {
    fn default() -> Self {
        Self {
            max_step_retries: 3,
            retry_interval_ms: 500,
            step_timeout_ms: 30_000,
            rpc_timeout_ms: 10_000,
            gc_keep: 1000,
            gc_interval_secs: 300,
        }
    }
}

impl ProcedureConfig {
    /// Get shard control request timeout as Duration
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    /// Get step timeout as Duration
    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }
}

/// Leadership configuration
///
/// Without `leader_addr`, or with `leader_addr` equal to `self_addr`, this
/// server is the leader.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ElectionConfig {
    /// Address other replicas use to reach this server
    pub self_addr: String,
    /// Address of the leader replica
    pub leader_addr: Option<String>,
    /// Timeout of a forwarded request in milliseconds
    pub forward_timeout_ms: u64,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            self_addr: default_http_addr(),
            leader_addr: None,
            forward_timeout_ms: 5000,
        }
    }
}

impl ElectionConfig {
    /// Get forward timeout as Duration
    pub fn forward_timeout(&self) -> Duration {
        Duration::from_millis(self.forward_timeout_ms)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

// Default value functions

fn default_http_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_view_refresh_interval_secs() -> u64 {
    10
}

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Serialize error: {0}")]
    SerializeError(String),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

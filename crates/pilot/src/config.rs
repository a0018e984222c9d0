//! Configuration module for the pilot
//!
//! Supports YAML configuration files with module-based organization

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Cluster configuration
    #[serde(default)]
    pub cluster: ClusterConfig,
    /// Config authority configuration
    #[serde(default)]
    pub authority: AuthoritySection,
    /// Balancer configuration
    #[serde(default)]
    pub balancer: BalancerConfig,
    /// Split configuration
    #[serde(default)]
    pub split: SplitConfig,
    /// Migration configuration
    #[serde(default)]
    pub migration: MigrationConfig,
    /// Shard registry configuration
    #[serde(default)]
    pub shards: ShardsConfig,
    /// HTTP API configuration
    #[serde(default)]
    pub http: HttpConfig,
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
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

    /// Merge with another config (other takes precedence)
    pub fn merge(&mut self, other: Config) {
        self.cluster.merge(other.cluster);
        self.authority.merge(other.authority);
        self.balancer.merge(other.balancer);
        self.split.merge(other.split);
        self.migration.merge(other.migration);
        self.shards.merge(other.shards);
        self.http.merge(other.http);
        self.log.merge(other.log);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cluster.replicas.is_empty() {
            return Err(ConfigError::Invalid(
                "cluster.replicas must list at least one config replica".into(),
            ));
        }
        for (i, replica) in self.cluster.replicas.iter().enumerate() {
            if replica.id.is_empty() {
                return Err(ConfigError::Invalid(format!("replica #{} has no id", i)));
            }
            if self.cluster.replicas[..i].iter().any(|r| r.id == replica.id) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate replica id '{}'",
                    replica.id
                )));
            }
        }
        if self.split.sample_size == 0 {
            return Err(ConfigError::Invalid("split.sample_size must be positive".into()));
        }
        Ok(())
    }

    /// Directory holding one sub-directory per config replica
    pub fn replicas_dir(&self) -> PathBuf {
        self.cluster.data_dir.join("replicas")
    }

    /// Directory holding the materialized metadata files
    pub fn metadata_dir(&self) -> PathBuf {
        self.cluster.data_dir.join("config")
    }
}

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Cluster name
    #[serde(default = "default_cluster_name")]
    pub name: String,
    /// Data storage directory
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Config replica set members
    #[serde(default = "default_replicas")]
    pub replicas: Vec<ReplicaConfig>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: default_cluster_name(),
            data_dir: default_data_dir(),
            replicas: default_replicas(),
        }
    }
}

impl ClusterConfig {
    fn merge(&mut self, other: Self) {
        if !other.name.is_empty() {
            self.name = other.name;
        }
        if !other.data_dir.as_os_str().is_empty() {
            self.data_dir = other.data_dir;
        }
        if !other.replicas.is_empty() {
            self.replicas = other.replicas;
        }
    }
}

/// Config replica member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaConfig {
    pub id: String,
    /// Election tie breaker, higher wins
    #[serde(default = "default_replica_priority")]
    pub priority: u32,
}

impl ReplicaConfig {
    pub fn new(id: &str, priority: u32) -> Self {
        Self {
            id: id.to_string(),
            priority,
        }
    }
}

/// Config authority configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthoritySection {
    /// Commit timeout in milliseconds
    #[serde(default = "default_commit_timeout_ms")]
    pub commit_timeout_ms: u64,
}

impl Default for AuthoritySection {
    fn default() -> Self {
        Self {
            commit_timeout_ms: default_commit_timeout_ms(),
        }
    }
}

impl AuthoritySection {
    fn merge(&mut self, other: Self) {
        if other.commit_timeout_ms > 0 {
            self.commit_timeout_ms = other.commit_timeout_ms;
        }
    }

    /// Get commit timeout as Duration
    pub fn commit_timeout(&self) -> Duration {
        Duration::from_millis(self.commit_timeout_ms)
    }
}

/// Balancer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancerConfig {
    /// Round interval in milliseconds
    #[serde(default = "default_round_interval_ms")]
    pub round_interval_ms: u64,
    /// Maximum allowed difference between the most and least loaded shard
    #[serde(default = "default_imbalance_threshold")]
    pub imbalance_threshold: usize,
    /// Migrations started per round across all namespaces
    #[serde(default = "default_max_migrations_per_round")]
    pub max_migrations_per_round: usize,
    /// Split oversized chunks before balancing
    #[serde(default = "default_true")]
    pub auto_split: bool,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            round_interval_ms: default_round_interval_ms(),
            imbalance_threshold: default_imbalance_threshold(),
            max_migrations_per_round: default_max_migrations_per_round(),
            auto_split: true,
        }
    }
}

impl BalancerConfig {
    fn merge(&mut self, other: Self) {
        if other.round_interval_ms > 0 {
            self.round_interval_ms = other.round_interval_ms;
        }
        if other.imbalance_threshold > 0 {
            self.imbalance_threshold = other.imbalance_threshold;
        }
        if other.max_migrations_per_round > 0 {
            self.max_migrations_per_round = other.max_migrations_per_round;
        }
        self.auto_split = other.auto_split;
    }

    /// Get round interval as Duration
    pub fn round_interval(&self) -> Duration {
        Duration::from_millis(self.round_interval_ms)
    }
}

/// Split configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitConfig {
    /// Chunks estimated above this size are split
    #[serde(default = "default_max_chunk_bytes")]
    pub max_chunk_bytes: u64,
    /// Chunks holding more documents than this are split
    #[serde(default = "default_max_chunk_documents")]
    pub max_chunk_documents: u64,
    /// Keys sampled to estimate the median of a large chunk
    #[serde(default = "default_sample_size")]
    pub sample_size: usize,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            max_chunk_bytes: default_max_chunk_bytes(),
            max_chunk_documents: default_max_chunk_documents(),
            sample_size: default_sample_size(),
        }
    }
}

impl SplitConfig {
    fn merge(&mut self, other: Self) {
        if other.max_chunk_bytes > 0 {
            self.max_chunk_bytes = other.max_chunk_bytes;
        }
        if other.max_chunk_documents > 0 {
            self.max_chunk_documents = other.max_chunk_documents;
        }
        if other.sample_size > 0 {
            self.sample_size = other.sample_size;
        }
    }
}

/// Migration configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Document transfer timeout in milliseconds
    #[serde(default = "default_transfer_timeout_ms")]
    pub transfer_timeout_ms: u64,
    /// Finished tickets kept for inspection
    #[serde(default = "default_history_size")]
    pub history_size: usize,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            transfer_timeout_ms: default_transfer_timeout_ms(),
            history_size: default_history_size(),
        }
    }
}

impl MigrationConfig {
    fn merge(&mut self, other: Self) {
        if other.transfer_timeout_ms > 0 {
            self.transfer_timeout_ms = other.transfer_timeout_ms;
        }
        if other.history_size > 0 {
            self.history_size = other.history_size;
        }
    }

    /// Get transfer timeout as Duration
    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }
}

/// Shard registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardsConfig {
    /// Heartbeat timeout in seconds
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,
    /// Liveness check interval in seconds
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    /// Shards registered at startup when missing
    #[serde(default)]
    pub bootstrap: Vec<BootstrapShard>,
}

impl Default for ShardsConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
            check_interval_secs: default_check_interval_secs(),
            bootstrap: Vec::new(),
        }
    }
}

impl ShardsConfig {
    fn merge(&mut self, other: Self) {
        if other.heartbeat_timeout_secs > 0 {
            self.heartbeat_timeout_secs = other.heartbeat_timeout_secs;
        }
        if other.check_interval_secs > 0 {
            self.check_interval_secs = other.check_interval_secs;
        }
        if !other.bootstrap.is_empty() {
            self.bootstrap = other.bootstrap;
        }
    }

    /// Get heartbeat timeout as Duration
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    /// Get check interval as Duration
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

/// Shard registered at startup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapShard {
    pub id: String,
    pub host: String,
}

/// HTTP API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Listen address
    #[serde(default = "default_http_addr")]
    pub addr: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            addr: default_http_addr(),
        }
    }
}

impl HttpConfig {
    fn merge(&mut self, other: Self) {
        if !other.addr.is_empty() {
            self.addr = other.addr;
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl LogConfig {
    fn merge(&mut self, other: Self) {
        if !other.level.is_empty() {
            self.level = other.level;
        }
    }
}

// Default value functions

fn default_cluster_name() -> String {
    "pilot".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_replicas() -> Vec<ReplicaConfig> {
    vec![
        ReplicaConfig::new("config0", 1),
        ReplicaConfig::new("config1", 1),
        ReplicaConfig::new("config2", 1),
    ]
}

fn default_replica_priority() -> u32 {
    1
}

fn default_commit_timeout_ms() -> u64 {
    5000 // 5 seconds
}

fn default_round_interval_ms() -> u64 {
    10000 // 10 seconds
}

fn default_imbalance_threshold() -> usize {
    2
}

fn default_max_migrations_per_round() -> usize {
    4
}

fn default_true() -> bool {
    true
}

fn default_max_chunk_bytes() -> u64 {
    64 * 1024 * 1024 // 64MB
}

fn default_max_chunk_documents() -> u64 {
    250_000
}

fn default_sample_size() -> usize {
    1000
}

fn default_transfer_timeout_ms() -> u64 {
    30000 // 30 seconds
}

fn default_history_size() -> usize {
    100
}

fn default_heartbeat_timeout_secs() -> u64 {
    30
}

fn default_check_interval_secs() -> u64 {
    5
}

fn default_http_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
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
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

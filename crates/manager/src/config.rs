//! Configuration module for the cluster manager
//!
//! Supports YAML configuration files with module-based organization

use cluster_core::{ClusterSettings, DiscoveryNode, NodeRole};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Cluster configuration
    #[serde(default)]
    pub cluster: ClusterConfig,
    /// Local node configuration
    #[serde(default)]
    pub node: NodeConfig,
    /// Gateway recovery configuration
    #[serde(default)]
    pub gateway: GatewayConfig,
    /// Initial allocation settings of a brand new cluster
    #[serde(default)]
    pub allocation: Option<ClusterSettings>,
    /// Node liveness configuration
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    /// HTTP admin API configuration
    #[serde(default)]
    pub http: HttpConfig,
    /// Storage configuration
    #[serde(default)]
    pub storage: StorageConfig,
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
        let config: Config =
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
        self.node.merge(other.node);
        self.gateway.merge(other.gateway);
        if other.allocation.is_some() {
            self.allocation = other.allocation;
        }
        self.heartbeat.merge(other.heartbeat);
        self.http.merge(other.http);
        self.storage.merge(other.storage);
        self.log.merge(other.log);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node.node_id.is_empty() {
            return Err(ConfigError::Invalid("node.node_id must not be empty".to_string()));
        }
        if self.gateway.required_allocation == 0 {
            return Err(ConfigError::Invalid(
                "gateway.required_allocation must be at least 1".to_string(),
            ));
        }
        if let Some(settings) = &self.allocation {
            settings
                .validate()
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        }
        Ok(())
    }

    /// Settings a fresh cluster starts with
    pub fn initial_settings(&self) -> ClusterSettings {
        self.allocation.clone().unwrap_or_default()
    }
}

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Cluster name
    #[serde(default = "default_cluster_name")]
    pub name: String,
    /// Nodes known before they register (cluster-manager-eligible peers, data nodes)
    #[serde(default)]
    pub seed_nodes: Vec<SeedNode>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: default_cluster_name(),
            seed_nodes: Vec::new(),
        }
    }
}

impl ClusterConfig {
    fn merge(&mut self, other: Self) {
        if !other.name.is_empty() {
            self.name = other.name;
        }
        if !other.seed_nodes.is_empty() {
            self.seed_nodes = other.seed_nodes;
        }
    }
}

/// A node listed in the configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedNode {
    pub id: String,
    pub address: String,
    #[serde(default = "default_seed_roles")]
    pub roles: BTreeSet<NodeRole>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl SeedNode {
    pub fn to_discovery_node(&self) -> DiscoveryNode {
        self.attributes.iter().fold(
            DiscoveryNode::new(&self.id, &self.address).with_roles(self.roles.iter().copied()),
            |node, (k, v)| node.with_attribute(k, v),
        )
    }
}

/// Local node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node ID
    #[serde(default = "default_node_id")]
    pub node_id: String,
    /// Advertised address
    #[serde(default = "default_node_address")]
    pub address: String,
    /// Roles of the manager node itself
    #[serde(default = "default_local_roles")]
    pub roles: BTreeSet<NodeRole>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            address: default_node_address(),
            roles: default_local_roles(),
        }
    }
}

impl NodeConfig {
    fn merge(&mut self, other: Self) {
        if !other.node_id.is_empty() {
            self.node_id = other.node_id;
        }
        if !other.address.is_empty() {
            self.address = other.address;
        }
        if !other.roles.is_empty() {
            self.roles = other.roles;
        }
    }

    pub fn to_discovery_node(&self) -> DiscoveryNode {
        DiscoveryNode::new(&self.node_id, &self.address).with_roles(self.roles.iter().copied())
    }
}

/// Gateway recovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Minimum number of cluster-manager-eligible nodes that must answer
    #[serde(default = "default_required_allocation")]
    pub required_allocation: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            required_allocation: default_required_allocation(),
        }
    }
}

impl GatewayConfig {
    fn merge(&mut self, other: Self) {
        if other.required_allocation > 0 {
            self.required_allocation = other.required_allocation;
        }
    }
}

/// Node liveness configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// A node silent for longer than this leaves the cluster
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub timeout_secs: u64,
    /// Liveness check interval
    #[serde(default = "default_heartbeat_check_interval_secs")]
    pub check_interval_secs: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_heartbeat_timeout_secs(),
            check_interval_secs: default_heartbeat_check_interval_secs(),
        }
    }
}

impl HeartbeatConfig {
    fn merge(&mut self, other: Self) {
        if other.timeout_secs > 0 {
            self.timeout_secs = other.timeout_secs;
        }
        if other.check_interval_secs > 0 {
            self.check_interval_secs = other.check_interval_secs;
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

/// HTTP admin API configuration
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

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory; every node keeps its metadata in `<data_dir>/<node_id>`
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl StorageConfig {
    fn merge(&mut self, other: Self) {
        if !other.data_dir.as_os_str().is_empty() {
            self.data_dir = other.data_dir;
        }
    }

    pub fn node_dir(&self, node_id: &str) -> PathBuf {
        self.data_dir.join(node_id)
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
    "default".to_string()
}

fn default_node_id() -> String {
    "manager-1".to_string()
}

fn default_node_address() -> String {
    "127.0.0.1:9300".to_string()
}

fn default_local_roles() -> BTreeSet<NodeRole> {
    BTreeSet::from([NodeRole::ClusterManager])
}

fn default_seed_roles() -> BTreeSet<NodeRole> {
    BTreeSet::from([NodeRole::ClusterManager, NodeRole::Data])
}

fn default_required_allocation() -> usize {
    1
}

fn default_heartbeat_timeout_secs() -> u64 {
    30
}

fn default_heartbeat_check_interval_secs() -> u64 {
    5
}

fn default_http_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./manager_data")
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

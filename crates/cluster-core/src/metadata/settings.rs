//! Dynamic `cluster.routing.allocation.*` settings
//!
//! Settings live in `Metadata` so they are versioned, persisted and updatable at runtime
//! through the same pipeline as every other cluster state change.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;
use crate::filters::NodeFilters;

/// Cluster-wide settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterSettings {
    #[serde(default)]
    pub allocation: AllocationSettings,
}

impl ClusterSettings {
    /// Apply a JSON merge patch and validate the result
    ///
    /// Non-empty objects merge into the current value, `null` resets a key to its default,
    /// anything else (including `{}`) replaces.
    pub fn with_patch(&self, patch: &serde_json::Value) -> Result<ClusterSettings, CoreError> {
        let mut current = serde_json::to_value(self)
            .map_err(|e| CoreError::InvalidSetting(e.to_string()))?;
        merge_json(&mut current, patch);
        let updated: ClusterSettings = serde_json::from_value(current)
            .map_err(|e| CoreError::InvalidSetting(e.to_string()))?;
        updated.validate()?;
        Ok(updated)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        self.allocation.validate()
    }
}

fn merge_json(target: &mut serde_json::Value, patch: &serde_json::Value) {
    match (target, patch) {
        (serde_json::Value::Object(target), serde_json::Value::Object(patch)) => {
            for (key, value) in patch {
                if value.is_null() {
                    target.remove(key);
                    continue;
                }
                let nested = value.as_object().is_some_and(|o| !o.is_empty());
                match target.get_mut(key) {
                    Some(existing) if nested && existing.is_object() => merge_json(existing, value),
                    _ => {
                        target.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

/// Which shards may be allocated at all
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnableAllocation {
    #[default]
    All,
    Primaries,
    NewPrimaries,
    None,
}

/// Which shards may be rebalanced
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnableRebalance {
    #[default]
    All,
    Primaries,
    Replicas,
    None,
}

/// When rebalancing is allowed to start
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterRebalanceType {
    Always,
    IndicesPrimariesActive,
    #[default]
    IndicesAllActive,
}

/// Allocation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationSettings {
    #[serde(default)]
    pub enable: EnableAllocation,
    #[serde(default)]
    pub rebalance_enable: EnableRebalance,
    #[serde(default)]
    pub allow_rebalance: ClusterRebalanceType,
    /// Concurrent relocations allowed cluster-wide (-1 for unlimited)
    #[serde(default = "default_cluster_concurrent_rebalance")]
    pub cluster_concurrent_rebalance: i32,
    #[serde(default = "default_node_concurrent_recoveries")]
    pub node_concurrent_incoming_recoveries: u32,
    #[serde(default = "default_node_concurrent_recoveries")]
    pub node_concurrent_outgoing_recoveries: u32,
    #[serde(default = "default_node_initial_primaries_recoveries")]
    pub node_initial_primaries_recoveries: u32,
    /// Also forbid copies of the same shard on nodes sharing a host
    #[serde(default)]
    pub same_shard_host: bool,
    #[serde(default)]
    pub awareness: AwarenessSettings,
    /// Cluster-level require/include/exclude filters
    #[serde(default)]
    pub filters: NodeFilters,
    /// Cluster-level cap of shards per node
    #[serde(default)]
    pub total_shards_per_node: Option<u32>,
    #[serde(default)]
    pub disk: DiskThresholdSettings,
    #[serde(default)]
    pub balance: BalanceSettings,
    /// Allocation failures after which a shard is no longer retried automatically
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_base_ms")]
    pub retry_delay_base_ms: u64,
    #[serde(default = "default_retry_delay_max_ms")]
    pub retry_delay_max_ms: u64,
}

fn default_cluster_concurrent_rebalance() -> i32 {
    2
}

fn default_node_concurrent_recoveries() -> u32 {
    2
}

fn default_node_initial_primaries_recoveries() -> u32 {
    4
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_delay_base_ms() -> u64 {
    5_000
}

fn default_retry_delay_max_ms() -> u64 {
    300_000
}

impl Default for AllocationSettings {
    fn default() -> Self {
        Self {
            enable: EnableAllocation::default(),
            rebalance_enable: EnableRebalance::default(),
            allow_rebalance: ClusterRebalanceType::default(),
            cluster_concurrent_rebalance: default_cluster_concurrent_rebalance(),
            node_concurrent_incoming_recoveries: default_node_concurrent_recoveries(),
            node_concurrent_outgoing_recoveries: default_node_concurrent_recoveries(),
            node_initial_primaries_recoveries: default_node_initial_primaries_recoveries(),
            same_shard_host: false,
            awareness: AwarenessSettings::default(),
            filters: NodeFilters::default(),
            total_shards_per_node: None,
            disk: DiskThresholdSettings::default(),
            balance: BalanceSettings::default(),
            max_retries: default_max_retries(),
            retry_delay_base_ms: default_retry_delay_base_ms(),
            retry_delay_max_ms: default_retry_delay_max_ms(),
        }
    }
}

impl AllocationSettings {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.cluster_concurrent_rebalance < -1 {
            return Err(CoreError::InvalidSetting(format!(
                "cluster_concurrent_rebalance must be >= -1, got {}",
                self.cluster_concurrent_rebalance
            )));
        }
        if self.retry_delay_base_ms > self.retry_delay_max_ms {
            return Err(CoreError::InvalidSetting(format!(
                "retry_delay_base_ms ({}) exceeds retry_delay_max_ms ({})",
                self.retry_delay_base_ms, self.retry_delay_max_ms
            )));
        }
        self.disk.validate()?;
        self.balance.validate()
    }
}

/// Awareness: spread copies across values of node attributes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AwarenessSettings {
    pub attributes: Vec<String>,
    /// Forced attribute values; copies are never crowded into the values that exist today
    pub force: BTreeMap<String, Vec<String>>,
}

/// Disk watermark, either a used-space percentage or an amount of free bytes
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Watermark {
    Percent(f64),
    Bytes(u64),
}

impl Watermark {
    /// Free bytes that must remain on a disk of `total_bytes`
    pub fn min_free_bytes(&self, total_bytes: u64) -> u64 {
        match self {
            Watermark::Percent(p) => {
                let free_ratio = (100.0 - p).max(0.0) / 100.0;
                (total_bytes as f64 * free_ratio) as u64
            }
            Watermark::Bytes(b) => *b,
        }
    }

    /// Whether a disk with `free_bytes` left out of `total_bytes` is past this watermark
    pub fn exceeded(&self, free_bytes: u64, total_bytes: u64) -> bool {
        free_bytes < self.min_free_bytes(total_bytes)
    }
}

impl FromStr for Watermark {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim().to_ascii_lowercase();
        let invalid = || CoreError::InvalidSetting(format!("invalid disk watermark [{}]", s));

        if let Some(pct) = raw.strip_suffix('%') {
            let value: f64 = pct.trim().parse().map_err(|_| invalid())?;
            if !(0.0..=100.0).contains(&value) {
                return Err(invalid());
            }
            return Ok(Watermark::Percent(value));
        }

        const UNITS: [(&str, u64); 5] = [
            ("tb", 1 << 40),
            ("gb", 1 << 30),
            ("mb", 1 << 20),
            ("kb", 1 << 10),
            ("b", 1),
        ];
        for (suffix, multiplier) in UNITS {
            if let Some(number) = raw.strip_suffix(suffix) {
                let value: u64 = number.trim().parse().map_err(|_| invalid())?;
                return Ok(Watermark::Bytes(value.saturating_mul(multiplier)));
            }
        }
        raw.parse::<u64>().map(Watermark::Bytes).map_err(|_| invalid())
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Watermark::Percent(p) => write!(f, "{}%", p),
            Watermark::Bytes(b) => write!(f, "{}b", b),
        }
    }
}

impl Serialize for Watermark {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Watermark {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Disk-based allocation thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskThresholdSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// No new shards allocated past this watermark
    #[serde(default = "default_low")]
    pub low: Watermark,
    /// Shards relocated away past this watermark
    #[serde(default = "default_high")]
    pub high: Watermark,
    #[serde(default = "default_flood_stage")]
    pub flood_stage: Watermark,
    /// Count incoming relocations against the target's free space
    #[serde(default = "default_true")]
    pub include_relocations: bool,
}

fn default_true() -> bool {
    true
}

fn default_low() -> Watermark {
    Watermark::Percent(85.0)
}

fn default_high() -> Watermark {
    Watermark::Percent(90.0)
}

fn default_flood_stage() -> Watermark {
    Watermark::Percent(95.0)
}

impl Default for DiskThresholdSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            low: default_low(),
            high: default_high(),
            flood_stage: default_flood_stage(),
            include_relocations: true,
        }
    }
}

impl DiskThresholdSettings {
    pub fn validate(&self) -> Result<(), CoreError> {
        let ordered = match (self.low, self.high, self.flood_stage) {
            (Watermark::Percent(l), Watermark::Percent(h), Watermark::Percent(f)) => l <= h && h <= f,
            (Watermark::Bytes(l), Watermark::Bytes(h), Watermark::Bytes(f)) => l >= h && h >= f,
            _ => {
                return Err(CoreError::InvalidSetting(
                    "disk watermarks must all be percentages or all be byte values".to_string(),
                ))
            }
        };
        if !ordered {
            return Err(CoreError::InvalidSetting(format!(
                "disk watermarks out of order: low [{}], high [{}], flood_stage [{}]",
                self.low, self.high, self.flood_stage
            )));
        }
        Ok(())
    }
}

/// Weight factors of the balanced allocator
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BalanceSettings {
    #[serde(default = "default_index_factor")]
    pub index: f32,
    #[serde(default = "default_shard_factor")]
    pub shard: f32,
    /// Minimal weight delta before a rebalance move is considered
    #[serde(default = "default_threshold")]
    pub threshold: f32,
}

fn default_index_factor() -> f32 {
    0.55
}

fn default_shard_factor() -> f32 {
    0.45
}

fn default_threshold() -> f32 {
    1.0
}

impl Default for BalanceSettings {
    fn default() -> Self {
        Self {
            index: default_index_factor(),
            shard: default_shard_factor(),
            threshold: default_threshold(),
        }
    }
}

impl BalanceSettings {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.index < 0.0 || self.shard < 0.0 || self.index + self.shard <= 0.0 {
            return Err(CoreError::InvalidSetting(format!(
                "balance factors must be non-negative with a positive sum, got index [{}] shard [{}]",
                self.index, self.shard
            )));
        }
        if self.threshold <= 0.0 {
            return Err(CoreError::InvalidSetting(format!(
                "balance threshold must be positive, got [{}]",
                self.threshold
            )));
        }
        Ok(())
    }
}

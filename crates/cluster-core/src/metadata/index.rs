//! Index metadata

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::CoreError;
use crate::filters::NodeFilters;
use crate::shard::{Index, ShardId};

static NO_ALLOCATION_IDS: BTreeSet<String> = BTreeSet::new();

/// Open / closed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexState {
    #[default]
    Open,
    Close,
}

/// Where the data of an index lives
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorePool {
    /// Locally attached storage, needs data nodes
    #[default]
    Local,
    /// Remote-backed storage, served by search nodes
    Remote,
}

impl fmt::Display for StorePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorePool::Local => write!(f, "local"),
            StorePool::Remote => write!(f, "remote"),
        }
    }
}

/// `min-max` replica range that follows the number of eligible nodes (`max` may be `all`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoExpandReplicas {
    pub min: u32,
    /// None means `all`
    pub max: Option<u32>,
}

impl AutoExpandReplicas {
    /// Replica count for `eligible_nodes` nodes, None when it cannot fit the range
    pub fn desired_replicas(&self, eligible_nodes: usize) -> Option<u32> {
        let max = match self.max {
            Some(max) => max,
            None => (eligible_nodes as u32).saturating_sub(1),
        };
        let wanted = (eligible_nodes as u32).saturating_sub(1);
        let replicas = wanted.clamp(self.min, max.max(self.min));
        if replicas >= self.min && replicas <= max {
            Some(replicas)
        } else {
            None
        }
    }
}

impl FromStr for AutoExpandReplicas {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || {
            CoreError::InvalidSetting(format!(
                "auto_expand_replicas must be [min-max] or [min-all], got [{}]",
                s
            ))
        };
        let (min, max) = s.trim().split_once('-').ok_or_else(invalid)?;
        let min: u32 = min.trim().parse().map_err(|_| invalid())?;
        let max = match max.trim() {
            "all" => None,
            n => {
                let max: u32 = n.parse().map_err(|_| invalid())?;
                if max < min {
                    return Err(invalid());
                }
                Some(max)
            }
        };
        Ok(Self { min, max })
    }
}

impl fmt::Display for AutoExpandReplicas {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.max {
            Some(max) => write!(f, "{}-{}", self.min, max),
            None => write!(f, "{}-all", self.min),
        }
    }
}

impl Serialize for AutoExpandReplicas {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for AutoExpandReplicas {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Per-index settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSettings {
    pub number_of_shards: u32,
    #[serde(default)]
    pub number_of_replicas: u32,
    #[serde(default)]
    pub auto_expand_replicas: Option<AutoExpandReplicas>,
    /// `index.routing.allocation.{require,include,exclude}.*`
    #[serde(default)]
    pub filters: NodeFilters,
    #[serde(default)]
    pub total_shards_per_node: Option<u32>,
    /// Higher priority indices are allocated first
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default)]
    pub store_pool: StorePool,
    /// How long replicas of a departed node wait for it to come back (0 disables)
    #[serde(default = "default_node_left_delayed_timeout_ms")]
    pub node_left_delayed_timeout_ms: u64,
    #[serde(default = "Utc::now")]
    pub creation_date: DateTime<Utc>,
}

fn default_priority() -> i32 {
    1
}

fn default_node_left_delayed_timeout_ms() -> u64 {
    60_000
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            number_of_shards: 1,
            number_of_replicas: 1,
            auto_expand_replicas: None,
            filters: NodeFilters::default(),
            total_shards_per_node: None,
            priority: default_priority(),
            store_pool: StorePool::default(),
            node_left_delayed_timeout_ms: default_node_left_delayed_timeout_ms(),
            creation_date: Utc::now(),
        }
    }
}

/// Index metadata
///
/// Primary terms and in-sync allocation ids are kept per shard ordinal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub index: Index,
    /// Bumped on every change
    pub version: u64,
    pub state: IndexState,
    pub settings: IndexSettings,
    pub primary_terms: Vec<u64>,
    pub in_sync_allocation_ids: Vec<BTreeSet<String>>,
}

impl IndexMetadata {
    pub fn builder(name: impl Into<String>) -> IndexMetadataBuilder {
        IndexMetadataBuilder::new(name)
    }

    /// Builder seeded with this metadata
    pub fn to_builder(&self) -> IndexMetadataBuilder {
        IndexMetadataBuilder {
            name: self.index.name.clone(),
            uuid: Some(self.index.uuid.clone()),
            version: self.version,
            state: self.state,
            settings: self.settings.clone(),
            primary_terms: self.primary_terms.clone(),
            in_sync_allocation_ids: self.in_sync_allocation_ids.clone(),
        }
    }

    pub fn name(&self) -> &str {
        &self.index.name
    }

    pub fn number_of_shards(&self) -> u32 {
        self.settings.number_of_shards
    }

    pub fn number_of_replicas(&self) -> u32 {
        self.settings.number_of_replicas
    }

    /// Copies per shard (primary + replicas)
    pub fn copies_per_shard(&self) -> u32 {
        self.settings.number_of_replicas + 1
    }

    pub fn is_open(&self) -> bool {
        self.state == IndexState::Open
    }

    pub fn shard_id(&self, shard: u32) -> ShardId {
        ShardId::new(self.index.clone(), shard)
    }

    pub fn primary_term(&self, shard: u32) -> u64 {
        self.primary_terms.get(shard as usize).copied().unwrap_or(0)
    }

    pub fn in_sync_allocation_ids(&self, shard: u32) -> &BTreeSet<String> {
        self.in_sync_allocation_ids
            .get(shard as usize)
            .unwrap_or(&NO_ALLOCATION_IDS)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        let invalid = |reason: String| CoreError::InvalidIndexSettings {
            index: self.index.name.clone(),
            reason,
        };
        if self.index.name.is_empty() {
            return Err(invalid("index name must not be empty".to_string()));
        }
        if self.settings.number_of_shards == 0 {
            return Err(invalid("number_of_shards must be at least 1".to_string()));
        }
        let shards = self.settings.number_of_shards as usize;
        if self.primary_terms.len() != shards {
            return Err(invalid(format!(
                "expected {} primary terms, found {}",
                shards,
                self.primary_terms.len()
            )));
        }
        if self.in_sync_allocation_ids.len() != shards {
            return Err(invalid(format!(
                "expected {} in-sync allocation id sets, found {}",
                shards,
                self.in_sync_allocation_ids.len()
            )));
        }
        if self.settings.total_shards_per_node == Some(0) {
            return Err(invalid("total_shards_per_node must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Index metadata builder
#[derive(Debug, Clone)]
pub struct IndexMetadataBuilder {
    name: String,
    uuid: Option<String>,
    version: u64,
    state: IndexState,
    settings: IndexSettings,
    primary_terms: Vec<u64>,
    in_sync_allocation_ids: Vec<BTreeSet<String>>,
}

impl IndexMetadataBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uuid: None,
            version: 1,
            state: IndexState::Open,
            settings: IndexSettings::default(),
            primary_terms: Vec::new(),
            in_sync_allocation_ids: Vec::new(),
        }
    }

    pub fn uuid(mut self, uuid: impl Into<String>) -> Self {
        self.uuid = Some(uuid.into());
        self
    }

    pub fn version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn bump_version(mut self) -> Self {
        self.version += 1;
        self
    }

    pub fn state(mut self, state: IndexState) -> Self {
        self.state = state;
        self
    }

    pub fn settings(mut self, settings: IndexSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn number_of_shards(mut self, shards: u32) -> Self {
        self.settings.number_of_shards = shards;
        self
    }

    pub fn number_of_replicas(mut self, replicas: u32) -> Self {
        self.settings.number_of_replicas = replicas;
        self
    }

    pub fn auto_expand_replicas(mut self, range: Option<AutoExpandReplicas>) -> Self {
        self.settings.auto_expand_replicas = range;
        self
    }

    pub fn filters(mut self, filters: NodeFilters) -> Self {
        self.settings.filters = filters;
        self
    }

    pub fn total_shards_per_node(mut self, limit: Option<u32>) -> Self {
        self.settings.total_shards_per_node = limit;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.settings.priority = priority;
        self
    }

    pub fn store_pool(mut self, pool: StorePool) -> Self {
        self.settings.store_pool = pool;
        self
    }

    pub fn node_left_delayed_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.settings.node_left_delayed_timeout_ms = timeout_ms;
        self
    }

    pub fn primary_term(mut self, shard: u32, term: u64) -> Self {
        let idx = shard as usize;
        if self.primary_terms.len() <= idx {
            self.primary_terms.resize(idx + 1, 0);
        }
        self.primary_terms[idx] = term;
        self
    }

    pub fn in_sync_allocation_ids(mut self, shard: u32, ids: BTreeSet<String>) -> Self {
        let idx = shard as usize;
        if self.in_sync_allocation_ids.len() <= idx {
            self.in_sync_allocation_ids.resize(idx + 1, BTreeSet::new());
        }
        self.in_sync_allocation_ids[idx] = ids;
        self
    }

    /// Build, sizing per-shard vectors to the shard count
    pub fn build(mut self) -> Result<IndexMetadata, CoreError> {
        let shards = self.settings.number_of_shards as usize;
        self.primary_terms.resize(shards, 0);
        self.in_sync_allocation_ids.resize(shards, BTreeSet::new());
        let metadata = IndexMetadata {
            index: Index::new(
                self.name,
                self.uuid.unwrap_or_else(|| Uuid::new_v4().simple().to_string()),
            ),
            version: self.version,
            state: self.state,
            settings: self.settings,
            primary_terms: self.primary_terms,
            in_sync_allocation_ids: self.in_sync_allocation_ids,
        };
        metadata.validate()?;
        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_expand_parse() {
        let range: AutoExpandReplicas = "0-1".parse().unwrap();
        assert_eq!(range, AutoExpandReplicas { min: 0, max: Some(1) });
        let range: AutoExpandReplicas = "1-all".parse().unwrap();
        assert_eq!(range.max, None);
        assert_eq!(range.to_string(), "1-all");
        assert!("2-1".parse::<AutoExpandReplicas>().is_err());
        assert!("x".parse::<AutoExpandReplicas>().is_err());
    }

    #[test]
    fn test_auto_expand_desired_replicas() {
        let zero_to_all: AutoExpandReplicas = "0-all".parse().unwrap();
        assert_eq!(zero_to_all.desired_replicas(1), Some(0));
        assert_eq!(zero_to_all.desired_replicas(4), Some(3));

        let zero_to_one: AutoExpandReplicas = "0-1".parse().unwrap();
        assert_eq!(zero_to_one.desired_replicas(5), Some(1));

        let two_to_all: AutoExpandReplicas = "2-all".parse().unwrap();
        assert_eq!(two_to_all.desired_replicas(1), None);
    }

    #[test]
    fn test_builder_sizes_shard_vectors() {
        let meta = IndexMetadata::builder("logs")
            .uuid("u1")
            .number_of_shards(3)
            .primary_term(1, 4)
            .build()
            .unwrap();
        assert_eq!(meta.primary_terms, vec![0, 4, 0]);
        assert_eq!(meta.in_sync_allocation_ids.len(), 3);
        assert!(meta.in_sync_allocation_ids(7).is_empty());
    }

    #[test]
    fn test_zero_shards_rejected() {
        let err = IndexMetadata::builder("bad").number_of_shards(0).build();
        assert!(matches!(err, Err(CoreError::InvalidIndexSettings { .. })));
    }
}

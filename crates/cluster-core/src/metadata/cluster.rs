//! Cluster metadata

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::{ClusterSettings, IndexMetadata};
use crate::error::CoreError;
use crate::shard::{Index, ShardId};

/// Cluster metadata
///
/// Everything that must survive a full cluster restart: settings and index metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub cluster_uuid: String,
    /// Bumped on every change
    pub version: u64,
    #[serde(default)]
    pub settings: ClusterSettings,
    #[serde(default)]
    pub indices: BTreeMap<String, IndexMetadata>,
}

impl Default for Metadata {
    fn default() -> Self {
        Self {
            cluster_uuid: Uuid::new_v4().to_string(),
            version: 0,
            settings: ClusterSettings::default(),
            indices: BTreeMap::new(),
        }
    }
}

impl Metadata {
    pub fn builder() -> MetadataBuilder {
        MetadataBuilder {
            metadata: Metadata::default(),
        }
    }

    /// Builder seeded with this metadata
    pub fn to_builder(&self) -> MetadataBuilder {
        MetadataBuilder {
            metadata: self.clone(),
        }
    }

    pub fn index(&self, name: &str) -> Option<&IndexMetadata> {
        self.indices.get(name)
    }

    /// Index metadata, checking the uuid still matches
    pub fn index_by_id(&self, index: &Index) -> Option<&IndexMetadata> {
        self.indices
            .get(&index.name)
            .filter(|meta| meta.index.uuid == index.uuid)
    }

    pub fn index_for_shard(&self, shard_id: &ShardId) -> Option<&IndexMetadata> {
        self.index_by_id(&shard_id.index)
    }

    pub fn has_index(&self, name: &str) -> bool {
        self.indices.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &IndexMetadata> {
        self.indices.values()
    }

    /// Total number of shard copies across open indices
    pub fn total_copies(&self) -> usize {
        self.indices
            .values()
            .filter(|m| m.is_open())
            .map(|m| (m.number_of_shards() * m.copies_per_shard()) as usize)
            .sum()
    }
}

/// Metadata builder
#[derive(Debug, Clone)]
pub struct MetadataBuilder {
    metadata: Metadata,
}

impl MetadataBuilder {
    pub fn cluster_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.metadata.cluster_uuid = uuid.into();
        self
    }

    pub fn version(mut self, version: u64) -> Self {
        self.metadata.version = version;
        self
    }

    pub fn bump_version(mut self) -> Self {
        self.metadata.version += 1;
        self
    }

    pub fn settings(mut self, settings: ClusterSettings) -> Self {
        self.metadata.settings = settings;
        self
    }

    /// Add or replace an index
    pub fn put(mut self, index: IndexMetadata) -> Self {
        self.metadata.indices.insert(index.index.name.clone(), index);
        self
    }

    pub fn remove(mut self, name: &str) -> Self {
        self.metadata.indices.remove(name);
        self
    }

    pub fn index(&self, name: &str) -> Option<&IndexMetadata> {
        self.metadata.indices.get(name)
    }

    pub fn build(self) -> Result<Metadata, CoreError> {
        self.metadata.settings.validate()?;
        for index in self.metadata.indices.values() {
            index.validate()?;
        }
        Ok(self.metadata)
    }
}

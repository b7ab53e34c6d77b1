//! Routing table: index -> shard -> copies
//!
//! The table stores one entry per shard copy. Relocation targets are not stored, they are
//! derived from their RELOCATING source, so an index with `S` shards and `R` replicas
//! always has exactly `S * (R + 1)` entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::error::CoreError;
use crate::metadata::{IndexMetadata, Metadata};
use crate::shard::{Index, RecoverySource, ShardId, ShardRouting, ShardRoutingState};
use crate::unassigned::{UnassignedInfo, UnassignedReason};

/// All copies of one shard, primary first
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexShardRoutingTable {
    pub shard_id: ShardId,
    shards: Vec<ShardRouting>,
}

impl IndexShardRoutingTable {
    pub fn new(shard_id: ShardId, mut shards: Vec<ShardRouting>) -> Self {
        shards.sort_by_key(|s| !s.primary);
        Self { shard_id, shards }
    }

    pub fn shards(&self) -> &[ShardRouting] {
        &self.shards
    }

    pub fn iter(&self) -> impl Iterator<Item = &ShardRouting> {
        self.shards.iter()
    }

    pub fn size(&self) -> usize {
        self.shards.len()
    }

    pub fn primary_shard(&self) -> Option<&ShardRouting> {
        self.shards.iter().find(|s| s.primary)
    }

    pub fn replica_shards(&self) -> impl Iterator<Item = &ShardRouting> {
        self.shards.iter().filter(|s| !s.primary)
    }

    pub fn active_shards(&self) -> impl Iterator<Item = &ShardRouting> {
        self.shards.iter().filter(|s| s.active())
    }

    pub fn assigned_shards(&self) -> impl Iterator<Item = &ShardRouting> {
        self.shards.iter().filter(|s| s.assigned_to_node())
    }

    pub fn primary_active(&self) -> bool {
        self.primary_shard().map(|p| p.active()).unwrap_or(false)
    }

    pub fn all_active(&self) -> bool {
        self.shards.iter().all(|s| s.active())
    }

    /// Copy with the given allocation id (relocation targets included)
    pub fn by_allocation_id(&self, allocation_id: &str) -> Option<ShardRouting> {
        for shard in &self.shards {
            if shard.allocation_id_str() == Some(allocation_id) {
                return Some(shard.clone());
            }
            if let Some(target) = shard.target_relocating_shard() {
                if target.allocation_id_str() == Some(allocation_id) {
                    return Some(target);
                }
            }
        }
        None
    }

    /// Every node holding a copy, relocation targets included
    pub fn node_ids(&self) -> BTreeSet<&str> {
        let mut nodes = BTreeSet::new();
        for shard in &self.shards {
            if let Some(node) = shard.node_id() {
                nodes.insert(node);
            }
            if shard.relocating() {
                if let Some(target) = shard.relocating_node_id.as_deref() {
                    nodes.insert(target);
                }
            }
        }
        nodes
    }
}

/// Routing table of one index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRoutingTable {
    pub index: Index,
    pub shards: BTreeMap<u32, IndexShardRoutingTable>,
}

impl IndexRoutingTable {
    pub fn new(index: Index) -> Self {
        Self {
            index,
            shards: BTreeMap::new(),
        }
    }

    /// Fresh table with every copy unassigned
    fn unassigned(
        meta: &IndexMetadata,
        primary_source: impl Fn(u32) -> RecoverySource,
        reason: UnassignedReason,
        now: DateTime<Utc>,
    ) -> Self {
        let mut table = IndexRoutingTable::new(meta.index.clone());
        for shard in 0..meta.number_of_shards() {
            let shard_id = meta.shard_id(shard);
            let info = UnassignedInfo::new(reason, None, now);
            let mut copies = Vec::with_capacity(meta.copies_per_shard() as usize);
            copies.push(ShardRouting::new_unassigned(
                shard_id.clone(),
                true,
                primary_source(shard),
                info.clone(),
            ));
            for _ in 0..meta.number_of_replicas() {
                copies.push(ShardRouting::new_unassigned(
                    shard_id.clone(),
                    false,
                    RecoverySource::Peer,
                    info.clone(),
                ));
            }
            table
                .shards
                .insert(shard, IndexShardRoutingTable::new(shard_id, copies));
        }
        table
    }

    pub fn name(&self) -> &str {
        &self.index.name
    }

    pub fn shard(&self, id: u32) -> Option<&IndexShardRoutingTable> {
        self.shards.get(&id)
    }

    pub fn number_of_shards(&self) -> usize {
        self.shards.len()
    }

    pub fn copies(&self) -> impl Iterator<Item = &ShardRouting> {
        self.shards.values().flat_map(|s| s.iter())
    }

    pub fn primaries_active(&self) -> bool {
        self.shards.values().all(|s| s.primary_active())
    }

    pub fn all_active(&self) -> bool {
        self.shards.values().all(|s| s.all_active())
    }

    fn validate(&self, meta: &IndexMetadata) -> Result<(), CoreError> {
        let violation = |msg: String| CoreError::InvariantViolation(format!("{} {}", self.index, msg));

        if self.shards.len() != meta.number_of_shards() as usize {
            return Err(violation(format!(
                "has {} shard tables, metadata expects {}",
                self.shards.len(),
                meta.number_of_shards()
            )));
        }
        for (ordinal, table) in &self.shards {
            if table.shard_id != meta.shard_id(*ordinal) {
                return Err(violation(format!("shard table {} is keyed as {}", table.shard_id, ordinal)));
            }
            if table.size() != meta.copies_per_shard() as usize {
                return Err(violation(format!(
                    "shard {} has {} copies, expected {}",
                    ordinal,
                    table.size(),
                    meta.copies_per_shard()
                )));
            }
            let primaries = table.iter().filter(|s| s.primary).count();
            if primaries != 1 {
                return Err(violation(format!("shard {} has {} primaries", ordinal, primaries)));
            }
            let mut nodes = BTreeSet::new();
            for copy in table.iter() {
                if copy.shard_id != table.shard_id {
                    return Err(violation(format!("copy {} is filed under shard {}", copy, ordinal)));
                }
                copy.check_invariants().map_err(violation)?;
                if copy.is_relocation_target() {
                    return Err(violation(format!("relocation target {} stored in the table", copy)));
                }
                let mut held = vec![copy.node_id()];
                if copy.relocating() {
                    held.push(copy.relocating_node_id.as_deref());
                }
                for node in held.into_iter().flatten() {
                    if !nodes.insert(node) {
                        return Err(violation(format!(
                            "shard {} has two copies on node {}",
                            ordinal, node
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Routing table of the cluster
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingTable {
    pub version: u64,
    pub indices: BTreeMap<String, IndexRoutingTable>,
}

impl RoutingTable {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn builder(&self) -> RoutingTableBuilder {
        RoutingTableBuilder {
            version: self.version,
            indices: self.indices.clone(),
        }
    }

    pub fn index(&self, name: &str) -> Option<&IndexRoutingTable> {
        self.indices.get(name)
    }

    pub fn has_index(&self, name: &str) -> bool {
        self.indices.contains_key(name)
    }

    pub fn shard_table(&self, shard_id: &ShardId) -> Option<&IndexShardRoutingTable> {
        self.indices
            .get(&shard_id.index.name)
            .filter(|t| t.index == shard_id.index)
            .and_then(|t| t.shard(shard_id.id))
    }

    /// Every stored copy, ordered by index name then shard
    pub fn all_shards(&self) -> impl Iterator<Item = &ShardRouting> {
        self.indices.values().flat_map(|t| t.copies())
    }

    pub fn shards_with_state(&self, state: ShardRoutingState) -> Vec<&ShardRouting> {
        self.all_shards().filter(|s| s.state == state).collect()
    }

    /// Same placement, ignoring the version counter
    pub fn same_routing(&self, other: &RoutingTable) -> bool {
        self.indices == other.indices
    }

    /// Check the table against `metadata`
    pub fn validate(&self, metadata: &Metadata) -> Result<(), CoreError> {
        for (name, table) in &self.indices {
            let meta = metadata.index_by_id(&table.index).ok_or_else(|| {
                CoreError::InvariantViolation(format!(
                    "routing table references unknown index {}",
                    table.index
                ))
            })?;
            if !meta.is_open() {
                return Err(CoreError::InvariantViolation(format!(
                    "closed index [{}] has a routing table",
                    name
                )));
            }
            table.validate(meta)?;
        }
        for meta in metadata.iter().filter(|m| m.is_open()) {
            if !self.indices.contains_key(meta.name()) {
                return Err(CoreError::InvariantViolation(format!(
                    "open index {} has no routing table",
                    meta.index
                )));
            }
        }
        Ok(())
    }
}

fn existing_or_empty(meta: &IndexMetadata, shard: u32) -> RecoverySource {
    if meta.in_sync_allocation_ids(shard).is_empty() {
        RecoverySource::EmptyStore
    } else {
        RecoverySource::ExistingStore { force_stale: false }
    }
}

/// Routing table builder
#[derive(Debug, Clone, Default)]
pub struct RoutingTableBuilder {
    version: u64,
    indices: BTreeMap<String, IndexRoutingTable>,
}

impl RoutingTableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn add_unassigned(
        &mut self,
        meta: &IndexMetadata,
        primary_source: impl Fn(u32) -> RecoverySource,
        reason: UnassignedReason,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        if self.indices.contains_key(meta.name()) {
            return Err(CoreError::InvalidIndexSettings {
                index: meta.name().to_string(),
                reason: "index already has a routing table".to_string(),
            });
        }
        if !meta.is_open() {
            return Ok(());
        }
        self.indices.insert(
            meta.name().to_string(),
            IndexRoutingTable::unassigned(meta, primary_source, reason, now),
        );
        Ok(())
    }

    /// Newly created index: primaries start from an empty store
    pub fn add_as_new(&mut self, meta: &IndexMetadata, now: DateTime<Utc>) -> Result<(), CoreError> {
        self.add_unassigned(meta, |_| RecoverySource::EmptyStore, UnassignedReason::IndexCreated, now)
    }

    /// Index known from persisted metadata after a full cluster restart
    ///
    /// Shards that never had a started copy (empty in-sync set) start from an empty store.
    pub fn add_as_recovery(&mut self, meta: &IndexMetadata, now: DateTime<Utc>) -> Result<(), CoreError> {
        self.add_unassigned(
            meta,
            |shard| existing_or_empty(meta, shard),
            UnassignedReason::ClusterRecovered,
            now,
        )
    }

    /// Closed index being opened again
    pub fn add_as_from_close_to_open(
        &mut self,
        meta: &IndexMetadata,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        self.add_unassigned(
            meta,
            |shard| existing_or_empty(meta, shard),
            UnassignedReason::IndexReopened,
            now,
        )
    }

    /// New index restored from a snapshot
    pub fn add_as_restore(
        &mut self,
        meta: &IndexMetadata,
        repository: &str,
        snapshot: &str,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        self.add_unassigned(
            meta,
            |_| RecoverySource::Snapshot {
                repository: repository.to_string(),
                snapshot: snapshot.to_string(),
            },
            UnassignedReason::NewIndexRestored,
            now,
        )
    }

    /// Add or replace a whole index table
    pub fn put(&mut self, table: IndexRoutingTable) {
        self.indices.insert(table.index.name.clone(), table);
    }

    pub fn remove_index(&mut self, name: &str) -> bool {
        self.indices.remove(name).is_some()
    }

    pub fn index(&self, name: &str) -> Option<&IndexRoutingTable> {
        self.indices.get(name)
    }

    /// Add one unassigned replica to every shard of `name`
    pub fn add_replica(&mut self, name: &str, now: DateTime<Utc>) -> Result<(), CoreError> {
        let table = self
            .indices
            .get_mut(name)
            .ok_or_else(|| CoreError::IndexNotFound(name.to_string()))?;
        for shard_table in table.shards.values_mut() {
            let replica = ShardRouting::new_unassigned(
                shard_table.shard_id.clone(),
                false,
                RecoverySource::Peer,
                UnassignedInfo::new(UnassignedReason::ReplicaAdded, None, now),
            );
            shard_table.shards.push(replica);
        }
        Ok(())
    }

    /// Remove one replica from every shard of `name`, least advanced copy first
    pub fn remove_replica(&mut self, name: &str) -> Result<(), CoreError> {
        let table = self
            .indices
            .get_mut(name)
            .ok_or_else(|| CoreError::IndexNotFound(name.to_string()))?;
        for shard_table in table.shards.values_mut() {
            let victim = shard_table
                .shards
                .iter()
                .enumerate()
                .filter(|(_, s)| !s.primary)
                .min_by_key(|(_, s)| match s.state {
                    ShardRoutingState::Unassigned => 0,
                    ShardRoutingState::Initializing => 1,
                    ShardRoutingState::Relocating => 2,
                    ShardRoutingState::Started => 3,
                })
                .map(|(i, _)| i);
            match victim {
                Some(i) => {
                    let removed = shard_table.shards.remove(i);
                    debug!("Removed replica {} from routing table", removed);
                }
                None => {
                    return Err(CoreError::InvalidIndexSettings {
                        index: name.to_string(),
                        reason: format!("shard {} has no replica to remove", shard_table.shard_id),
                    })
                }
            }
        }
        Ok(())
    }

    /// Bring every shard of `meta` to its configured replica count
    pub fn update_number_of_replicas(
        &mut self,
        meta: &IndexMetadata,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        let current = self
            .indices
            .get(meta.name())
            .and_then(|t| t.shards.values().next())
            .map(|s| s.size() as u32 - 1)
            .ok_or_else(|| CoreError::IndexNotFound(meta.name().to_string()))?;
        let wanted = meta.number_of_replicas();
        for _ in wanted..current {
            self.remove_replica(meta.name())?;
        }
        for _ in current..wanted {
            self.add_replica(meta.name(), now)?;
        }
        Ok(())
    }

    /// Build, bumping the version
    pub fn build(self) -> RoutingTable {
        RoutingTable {
            version: self.version + 1,
            indices: self.indices,
        }
    }
}

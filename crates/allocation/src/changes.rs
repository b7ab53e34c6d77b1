//! Routing change observer
//!
//! Every mutation of `RoutingNodes` is reported here. At the end of a pass the collected
//! changes tell whether a new routing table is needed, and are folded into the index
//! metadata: primary term bumps and in-sync allocation id updates.

use cluster_core::{
    CoreError, IndexShardRoutingTable, Metadata, RecoverySource, RoutingTable, ShardId,
    ShardRouting, UnassignedReason,
};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, trace};

#[derive(Debug, Default, Clone)]
struct ShardUpdates {
    term_bump_on_failure: bool,
    term_bump_on_init: bool,
    retain_term: bool,
    /// A fresh or forced-stale primary started: the in-sync set restarts from it
    reset_in_sync: Option<String>,
    added: BTreeSet<String>,
    /// Ids of failed or vacated copies; only dropped while a primary is active
    removed: BTreeSet<String>,
    /// Ids reported stale by the primary
    stale: BTreeSet<String>,
}

impl ShardUpdates {
    fn new_primary_term(&self, old: u64) -> u64 {
        if self.term_bump_on_failure || (self.term_bump_on_init && !self.retain_term) {
            old + 1
        } else {
            old
        }
    }

    fn new_in_sync(
        &self,
        old: &BTreeSet<String>,
        table: Option<&IndexShardRoutingTable>,
        copies: usize,
    ) -> BTreeSet<String> {
        let primary_active = table.map(|t| t.primary_active()).unwrap_or(false);
        let mut ids = match &self.reset_in_sync {
            Some(id) => BTreeSet::from([id.clone()]),
            None => old.clone(),
        };
        ids.extend(self.added.iter().cloned());
        if primary_active {
            for id in &self.removed {
                ids.remove(id);
            }
        }
        for id in &self.stale {
            ids.remove(id);
        }
        if ids.is_empty() && !primary_active {
            return old.clone();
        }
        if primary_active && ids.len() > copies {
            if let Some(table) = table {
                let active: BTreeSet<&str> = table
                    .active_shards()
                    .filter_map(|s| s.allocation_id_str())
                    .collect();
                ids.retain(|id| active.contains(id.as_str()));
            }
        }
        ids
    }
}

/// Changes made during one allocation pass
#[derive(Debug, Default, Clone)]
pub struct RoutingChanges {
    routing_changed: bool,
    updates: BTreeMap<ShardId, ShardUpdates>,
}

impl RoutingChanges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the pass produced anything worth publishing
    pub fn has_changes(&self) -> bool {
        self.routing_changed || !self.updates.is_empty()
    }

    fn updates(&mut self, shard_id: &ShardId) -> &mut ShardUpdates {
        self.updates.entry(shard_id.clone()).or_default()
    }

    pub fn shard_initialized(&mut self, unassigned: &ShardRouting, initialized: &ShardRouting) {
        trace!("Initialized {} from {}", initialized, unassigned.shard_id);
        self.routing_changed = true;
        if initialized.primary {
            self.updates(&initialized.shard_id).term_bump_on_init = true;
        }
    }

    /// The primary being initialized is the copy that was primary under the current term
    pub fn retain_primary_term(&mut self, shard_id: &ShardId) {
        self.updates(shard_id).retain_term = true;
    }

    pub fn shard_started(&mut self, initializing: &ShardRouting, started: &ShardRouting) {
        self.routing_changed = true;
        let Some(id) = started.allocation_id_str().map(str::to_string) else {
            return;
        };
        let fresh_primary = started.primary
            && matches!(
                initializing.recovery_source,
                Some(RecoverySource::EmptyStore)
                    | Some(RecoverySource::ExistingStore { force_stale: true })
            );
        let updates = self.updates(&started.shard_id);
        if fresh_primary {
            updates.reset_in_sync = Some(id);
        } else {
            updates.added.insert(id);
        }
    }

    pub fn relocation_started(&mut self, _source: &ShardRouting, _target: &ShardRouting) {
        self.routing_changed = true;
    }

    /// The target of a relocation started; the source copy is gone
    pub fn relocation_completed(&mut self, source: &ShardRouting) {
        self.routing_changed = true;
        if let Some(id) = source.allocation_id_str() {
            self.updates(&source.shard_id).removed.insert(id.to_string());
        }
    }

    pub fn relocation_cancelled(&mut self, _source: &ShardRouting) {
        self.routing_changed = true;
    }

    /// A replica's relocation source failed; the target recovers from the primary instead
    pub fn relocation_source_removed(&mut self, _target: &ShardRouting) {
        self.routing_changed = true;
    }

    pub fn replica_promoted(&mut self, replica: &ShardRouting) {
        debug!("Promoted replica {} to primary", replica);
        self.routing_changed = true;
    }

    pub fn shard_failed(&mut self, failed: &ShardRouting, reason: UnassignedReason) {
        self.routing_changed = true;
        if !failed.active() {
            return;
        }
        let updates = self.updates(&failed.shard_id);
        if reason != UnassignedReason::NodeLeft {
            if let Some(id) = failed.allocation_id_str() {
                updates.removed.insert(id.to_string());
            }
        }
        if failed.primary {
            updates.term_bump_on_failure = true;
        }
    }

    pub fn unassigned_info_updated(&mut self, _shard: &ShardRouting) {
        self.routing_changed = true;
    }

    /// Drop `allocation_id` from the in-sync set
    pub fn mark_stale(&mut self, shard_id: &ShardId, allocation_id: &str) {
        self.updates(shard_id).stale.insert(allocation_id.to_string());
    }

    /// Allocation ids of `shard_id` marked stale so far in this pass
    pub fn stale_ids(&self, shard_id: &ShardId) -> BTreeSet<String> {
        self.updates
            .get(shard_id)
            .map(|u| u.stale.clone())
            .unwrap_or_default()
    }

    /// Fold the collected primary term and in-sync updates into `metadata`
    ///
    /// `routing_table` is the table produced by the same pass.
    pub fn apply_to_metadata(
        &self,
        metadata: &Metadata,
        routing_table: &RoutingTable,
    ) -> Result<Metadata, CoreError> {
        let mut builders = BTreeMap::new();
        for (shard_id, updates) in &self.updates {
            let Some(index_meta) = metadata.index_for_shard(shard_id) else {
                continue;
            };
            let shard = shard_id.id;
            let old_term = index_meta.primary_term(shard);
            let old_in_sync = index_meta.in_sync_allocation_ids(shard);
            let new_term = updates.new_primary_term(old_term);
            let new_in_sync = updates.new_in_sync(
                old_in_sync,
                routing_table.shard_table(shard_id),
                index_meta.copies_per_shard() as usize,
            );
            if new_term == old_term && &new_in_sync == old_in_sync {
                continue;
            }
            if new_term != old_term {
                debug!("Primary term of {} bumped from {} to {}", shard_id, old_term, new_term);
            }
            let name = index_meta.name().to_string();
            let builder = builders
                .remove(&name)
                .unwrap_or_else(|| index_meta.to_builder().bump_version());
            builders.insert(
                name,
                builder
                    .primary_term(shard, new_term)
                    .in_sync_allocation_ids(shard, new_in_sync),
            );
        }

        if builders.is_empty() {
            return Ok(metadata.clone());
        }
        let mut metadata_builder = metadata.to_builder().bump_version();
        for (_, builder) in builders {
            metadata_builder = metadata_builder.put(builder.build()?);
        }
        metadata_builder.build()
    }
}

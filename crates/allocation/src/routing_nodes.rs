//! Per-node view of the routing table, mutable for the duration of one allocation pass
//!
//! Built from a `ClusterState` at the start of a pass, owned by exactly one
//! `RoutingAllocation`, and converted back into an immutable `RoutingTable` at the end.
//! Relocation targets are materialized here as INITIALIZING copies on their target node.

use chrono::{DateTime, Utc};
use cluster_core::{
    AllocationStatus, ClusterState, IndexRoutingTable, IndexShardRoutingTable, NodeId,
    RecoverySource, RoutingTable, ShardId, ShardRouting, UnassignedInfo, UnassignedReason,
};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, trace};

use crate::changes::RoutingChanges;

/// Shards hosted by one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingNode {
    node_id: NodeId,
    shards: BTreeMap<ShardId, ShardRouting>,
}

impl RoutingNode {
    fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            shards: BTreeMap::new(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn get(&self, shard_id: &ShardId) -> Option<&ShardRouting> {
        self.shards.get(shard_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ShardRouting> {
        self.shards.values()
    }

    /// Every entry, including copies relocating away
    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    /// Shards counted for balancing: copies relocating away are excluded
    pub fn num_shards(&self) -> usize {
        self.shards.values().filter(|s| !s.relocating()).count()
    }

    pub fn num_shards_for_index(&self, index: &str) -> usize {
        self.shards
            .values()
            .filter(|s| !s.relocating() && s.shard_id.index_name() == index)
            .count()
    }

    pub fn initializing(&self) -> impl Iterator<Item = &ShardRouting> {
        self.shards.values().filter(|s| s.initializing())
    }

    fn add(&mut self, shard: ShardRouting) {
        let previous = self.shards.insert(shard.shard_id.clone(), shard);
        debug_assert!(previous.is_none(), "node {} already holds a copy", self.node_id);
    }

    fn update(&mut self, shard: ShardRouting) {
        self.shards.insert(shard.shard_id.clone(), shard);
    }

    fn remove(&mut self, shard_id: &ShardId) -> Option<ShardRouting> {
        self.shards.remove(shard_id)
    }
}

/// Mutable routing state of one allocation pass
#[derive(Debug, Clone)]
pub struct RoutingNodes {
    nodes: BTreeMap<NodeId, RoutingNode>,
    unassigned: Vec<ShardRouting>,
    /// Unassigned copies set aside for the rest of the pass
    ignored: Vec<ShardRouting>,
}

impl RoutingNodes {
    pub fn new(state: &ClusterState) -> Self {
        let mut nodes: BTreeMap<NodeId, RoutingNode> = state
            .nodes
            .data_nodes()
            .map(|n| (n.id.clone(), RoutingNode::new(n.id.clone())))
            .collect();
        let mut unassigned = Vec::new();

        for shard in state.routing_table.all_shards() {
            let Some(node_id) = shard.current_node_id.clone() else {
                unassigned.push(shard.clone());
                continue;
            };
            if let Some(target) = shard.target_relocating_shard() {
                if let Some(target_node) = target.current_node_id.clone() {
                    nodes
                        .entry(target_node.clone())
                        .or_insert_with(|| RoutingNode::new(target_node))
                        .add(target);
                }
            }
            nodes
                .entry(node_id.clone())
                .or_insert_with(|| RoutingNode::new(node_id))
                .add(shard.clone());
        }

        Self {
            nodes,
            unassigned,
            ignored: Vec::new(),
        }
    }

    pub fn node(&self, node_id: &str) -> Option<&RoutingNode> {
        self.nodes.get(node_id)
    }

    /// All routing nodes ordered by id, including nodes that already left the cluster
    pub fn nodes(&self) -> impl Iterator<Item = &RoutingNode> {
        self.nodes.values()
    }

    fn node_mut(&mut self, node_id: &str) -> &mut RoutingNode {
        self.nodes
            .entry(node_id.to_string())
            .or_insert_with(|| RoutingNode::new(node_id.to_string()))
    }

    pub fn unassigned(&self) -> &[ShardRouting] {
        &self.unassigned
    }

    pub fn ignored(&self) -> &[ShardRouting] {
        &self.ignored
    }

    /// Copies that are not on any node, ignored ones included
    pub fn all_unassigned(&self) -> impl Iterator<Item = &ShardRouting> {
        self.unassigned.iter().chain(self.ignored.iter())
    }

    /// Every copy on a node, relocation targets included
    pub fn assigned(&self) -> impl Iterator<Item = &ShardRouting> {
        self.nodes.values().flat_map(|n| n.iter())
    }

    pub fn assigned_shards(&self, shard_id: &ShardId) -> Vec<&ShardRouting> {
        self.nodes
            .values()
            .filter_map(|n| n.get(shard_id))
            .collect()
    }

    pub fn by_allocation_id(&self, shard_id: &ShardId, allocation_id: &str) -> Option<&ShardRouting> {
        self.nodes
            .values()
            .filter_map(|n| n.get(shard_id))
            .find(|s| s.allocation_id_str() == Some(allocation_id))
    }

    pub fn active_primary(&self, shard_id: &ShardId) -> Option<&ShardRouting> {
        self.nodes
            .values()
            .filter_map(|n| n.get(shard_id))
            .find(|s| s.primary && s.active())
    }

    /// Number of active copies of the shard
    pub fn active_copies(&self, shard_id: &ShardId) -> usize {
        self.nodes
            .values()
            .filter_map(|n| n.get(shard_id))
            .filter(|s| s.active())
            .count()
    }

    pub fn has_unassigned_shards(&self) -> bool {
        !self.unassigned.is_empty() || !self.ignored.is_empty()
    }

    pub fn has_unassigned_primaries(&self) -> bool {
        self.all_unassigned().any(|s| s.primary)
    }

    pub fn has_inactive_shards(&self) -> bool {
        self.has_unassigned_shards() || self.assigned().any(|s| s.initializing())
    }

    pub fn has_inactive_primaries(&self) -> bool {
        self.has_unassigned_primaries() || self.assigned().any(|s| s.primary && s.initializing())
    }

    /// Relocations in flight
    pub fn relocating_shards(&self) -> usize {
        self.assigned().filter(|s| s.relocating()).count()
    }

    /// Peer recoveries targeting `node_id` (replicas and relocation targets)
    pub fn incoming_recoveries(&self, node_id: &str) -> usize {
        self.node(node_id)
            .map(|n| {
                n.initializing()
                    .filter(|s| !s.primary || s.is_relocation_target())
                    .count()
            })
            .unwrap_or(0)
    }

    /// Peer recoveries reading from `node_id`
    ///
    /// A relocation reads from its source; an initializing replica reads from the
    /// active primary.
    pub fn outgoing_recoveries(&self, node_id: &str) -> usize {
        let Some(node) = self.node(node_id) else {
            return 0;
        };
        let mut count = 0;
        for shard in node.iter() {
            if shard.relocating() {
                count += 1;
            } else if shard.primary && shard.active() {
                count += self
                    .assigned_shards(&shard.shard_id)
                    .into_iter()
                    .filter(|s| !s.primary && s.initializing() && !s.is_relocation_target())
                    .count();
            }
        }
        count
    }

    /// Primaries recovering from a store (not from a peer) on `node_id`
    pub fn initial_primaries_recoveries(&self, node_id: &str) -> usize {
        self.node(node_id)
            .map(|n| {
                n.initializing()
                    .filter(|s| s.primary && !s.is_relocation_target())
                    .count()
            })
            .unwrap_or(0)
    }

    /// Take every pending unassigned copy, leaving the queue empty
    pub fn drain_unassigned(&mut self) -> Vec<ShardRouting> {
        std::mem::take(&mut self.unassigned)
    }

    /// Put an unassigned copy back in the queue
    pub fn push_unassigned(&mut self, shard: ShardRouting) {
        debug_assert!(shard.unassigned());
        self.unassigned.push(shard);
    }

    /// Remove the first pending unassigned copy matching `predicate`
    pub fn take_unassigned(&mut self, predicate: impl Fn(&ShardRouting) -> bool) -> Option<ShardRouting> {
        let pos = self.unassigned.iter().position(predicate)?;
        Some(self.unassigned.remove(pos))
    }

    /// Set an unassigned copy aside for the rest of the pass, recording why
    pub fn ignore_shard(
        &mut self,
        shard: ShardRouting,
        status: AllocationStatus,
        changes: &mut RoutingChanges,
    ) {
        let shard = match &shard.unassigned_info {
            Some(info) if info.last_allocation_status != status => {
                let updated = shard.update_unassigned(
                    info.clone().with_status(status),
                    shard.recovery_source.clone().unwrap_or(RecoverySource::Peer),
                );
                changes.unassigned_info_updated(&updated);
                updated
            }
            _ => shard,
        };
        trace!("Ignoring {} ({})", shard.shard_id, status);
        self.ignored.push(shard);
    }

    /// Replace the unassigned info of every pending and ignored copy through `update`
    ///
    /// `update` returns None to leave a copy unchanged.
    pub fn update_unassigned_infos(
        &mut self,
        changes: &mut RoutingChanges,
        update: impl Fn(&ShardRouting, &UnassignedInfo) -> Option<UnassignedInfo>,
    ) {
        for shard in self.unassigned.iter_mut().chain(self.ignored.iter_mut()) {
            let Some(info) = &shard.unassigned_info else {
                continue;
            };
            if let Some(new_info) = update(shard, info) {
                if &new_info != info {
                    let source = shard
                        .recovery_source
                        .clone()
                        .unwrap_or(RecoverySource::Peer);
                    *shard = shard.update_unassigned(new_info, source);
                    changes.unassigned_info_updated(shard);
                }
            }
        }
    }

    /// UNASSIGNED -> INITIALIZING on `node_id`
    ///
    /// `unassigned` must already be out of the unassigned queue.
    pub fn initialize_shard(
        &mut self,
        unassigned: &ShardRouting,
        node_id: &str,
        existing_allocation_id: Option<&str>,
        expected_shard_size: Option<u64>,
        changes: &mut RoutingChanges,
    ) -> ShardRouting {
        let initialized = unassigned.initialize(node_id, existing_allocation_id, expected_shard_size);
        self.node_mut(node_id).add(initialized.clone());
        changes.shard_initialized(unassigned, &initialized);
        debug!("Initializing {} on node {}", initialized.shard_id, node_id);
        initialized
    }

    /// INITIALIZING -> STARTED; completing a relocation drops the source copy
    pub fn start_shard(&mut self, initializing: &ShardRouting, changes: &mut RoutingChanges) -> ShardRouting {
        let started = initializing.move_to_started();
        if let Some(node_id) = initializing.node_id() {
            self.node_mut(node_id).update(started.clone());
        }
        changes.shard_started(initializing, &started);

        if initializing.is_relocation_target() {
            let source = initializing
                .relocating_node_id
                .as_deref()
                .and_then(|source_node| self.nodes.get_mut(source_node))
                .and_then(|n| n.remove(&initializing.shard_id));
            if let Some(source) = source {
                debug!(
                    "Relocation of {} from {} to {} completed",
                    source.shard_id,
                    source.node_id().unwrap_or("-"),
                    started.node_id().unwrap_or("-")
                );
                changes.relocation_completed(&source);
            }
        }
        started
    }

    /// STARTED -> RELOCATING, adding the INITIALIZING target on `target_node`
    pub fn relocate_shard(
        &mut self,
        started: &ShardRouting,
        target_node: &str,
        expected_shard_size: Option<u64>,
        changes: &mut RoutingChanges,
    ) -> ShardRouting {
        let source = started.relocate(target_node, expected_shard_size);
        if let Some(node_id) = started.node_id() {
            self.node_mut(node_id).update(source.clone());
        }
        if let Some(target) = source.target_relocating_shard() {
            self.node_mut(target_node).add(target.clone());
            changes.relocation_started(&source, &target);
        }
        debug!(
            "Relocating {} from {} to {}",
            source.shard_id,
            source.node_id().unwrap_or("-"),
            target_node
        );
        source
    }

    /// RELOCATING -> STARTED, dropping the target copy
    pub fn cancel_relocation(&mut self, source: &ShardRouting, changes: &mut RoutingChanges) -> ShardRouting {
        if let Some(target_node) = source.relocating_node_id.as_deref() {
            if let Some(node) = self.nodes.get_mut(target_node) {
                node.remove(&source.shard_id);
            }
        }
        let cancelled = source.cancel_relocation();
        if let Some(node_id) = source.node_id() {
            self.node_mut(node_id).update(cancelled.clone());
        }
        changes.relocation_cancelled(&cancelled);
        cancelled
    }

    fn relocation_source_of(&self, target: &ShardRouting) -> Option<ShardRouting> {
        let source_node = target.relocating_node_id.as_deref()?;
        self.node(source_node)?
            .get(&target.shard_id)
            .filter(|s| s.relocating())
            .cloned()
    }

    fn relocation_target_of(&self, source: &ShardRouting) -> Option<ShardRouting> {
        let target_node = source.relocating_node_id.as_deref()?;
        self.node(target_node)?
            .get(&source.shard_id)
            .filter(|s| s.is_relocation_target())
            .cloned()
    }

    /// Active in-sync replica that takes over when the primary fails, lowest node id first
    fn promotion_candidate(&self, shard_id: &ShardId, in_sync: &BTreeSet<String>) -> Option<ShardRouting> {
        self.assigned_shards(shard_id)
            .into_iter()
            .filter(|s| !s.primary && s.active())
            .filter(|s| s.allocation_id_str().map(|id| in_sync.contains(id)).unwrap_or(false))
            .min_by(|a, b| a.current_node_id.cmp(&b.current_node_id))
            .cloned()
    }

    /// Fail an assigned copy
    ///
    /// * a failed primary first fails its initializing replicas, they recover from it
    /// * a failed relocation target cancels the relocation; nothing becomes unassigned
    /// * a failed relocation source drops (primary) or detaches (replica) its target
    /// * a failed active primary is replaced by an active in-sync replica when one exists,
    ///   the old primary becomes an unassigned replica
    /// * without such a replica the primary stays unassigned and the out-of-sync active
    ///   replicas are failed with it
    pub fn fail_shard(
        &mut self,
        failed: &ShardRouting,
        info: UnassignedInfo,
        in_sync: &BTreeSet<String>,
        changes: &mut RoutingChanges,
    ) {
        let Some(failed) = failed
            .allocation_id_str()
            .and_then(|aid| self.by_allocation_id(&failed.shard_id, aid))
            .cloned()
        else {
            debug!("Ignoring failure of {}, no such copy", failed);
            return;
        };
        debug!("Failing shard {} ({})", failed, info.short_summary());

        if failed.primary {
            let initializing_replicas: Vec<String> = self
                .assigned_shards(&failed.shard_id)
                .into_iter()
                .filter(|s| !s.primary && s.initializing())
                .filter_map(|s| s.allocation_id_str().map(str::to_string))
                .collect();
            for allocation_id in initializing_replicas {
                let Some(replica) = self.by_allocation_id(&failed.shard_id, &allocation_id).cloned() else {
                    continue;
                };
                let replica_info = UnassignedInfo::new(
                    UnassignedReason::PrimaryFailed,
                    Some("primary failed while replica initializing".to_string()),
                    info.unassigned_at,
                )
                .with_failed_allocations(replica.failed_allocations())
                .with_last_allocated_node(replica.current_node_id.clone());
                self.fail_shard(&replica, replica_info, in_sync, changes);
            }
        }

        if failed.relocating() {
            if let Some(target) = self.relocation_target_of(&failed) {
                if let Some(node) = target.node_id().and_then(|n| self.nodes.get_mut(n)) {
                    node.remove(&target.shard_id);
                }
                if !failed.primary {
                    let detached = target.remove_relocation_source();
                    if let Some(node_id) = detached.node_id() {
                        self.node_mut(node_id).add(detached.clone());
                    }
                    if let Some(node) = failed.node_id().and_then(|n| self.nodes.get_mut(n)) {
                        node.remove(&failed.shard_id);
                    }
                    changes.relocation_source_removed(&detached);
                    changes.shard_failed(&failed, info.reason);
                    return;
                }
            }
        }

        if failed.is_relocation_target() {
            if let Some(node) = failed.node_id().and_then(|n| self.nodes.get_mut(n)) {
                node.remove(&failed.shard_id);
            }
            if let Some(source) = self.relocation_source_of(&failed) {
                let cancelled = source.cancel_relocation();
                if let Some(node_id) = source.node_id() {
                    self.node_mut(node_id).update(cancelled.clone());
                }
                changes.relocation_cancelled(&cancelled);
            }
            return;
        }

        if let Some(node) = failed.node_id().and_then(|n| self.nodes.get_mut(n)) {
            node.remove(&failed.shard_id);
        }
        changes.shard_failed(&failed, info.reason);

        if failed.primary && failed.active() {
            if let Some(candidate) = self.promotion_candidate(&failed.shard_id, in_sync) {
                let demoted = failed.move_to_unassigned(info).move_unassigned_from_primary();
                self.unassigned.push(demoted);
                let promoted = candidate.move_active_replica_to_primary();
                if let Some(node_id) = promoted.node_id() {
                    self.node_mut(node_id).update(promoted.clone());
                }
                changes.replica_promoted(&promoted);
                return;
            }
            let unassigned_at = info.unassigned_at;
            self.unassigned.push(failed.move_to_unassigned(info));
            let out_of_sync: Vec<String> = self
                .assigned_shards(&failed.shard_id)
                .into_iter()
                .filter(|s| !s.primary && s.active())
                .filter_map(|s| s.allocation_id_str().map(str::to_string))
                .collect();
            for allocation_id in out_of_sync {
                let Some(replica) = self.by_allocation_id(&failed.shard_id, &allocation_id).cloned() else {
                    continue;
                };
                let replica_info = UnassignedInfo::new(
                    UnassignedReason::PrimaryFailed,
                    Some("primary failed without an in-sync replica".to_string()),
                    unassigned_at,
                )
                .with_failed_allocations(replica.failed_allocations())
                .with_last_allocated_node(replica.current_node_id.clone());
                self.fail_shard(&replica, replica_info, in_sync, changes);
            }
            return;
        }
        self.unassigned.push(failed.move_to_unassigned(info));
    }

    /// Fail every copy on `node_id` with reason NODE_LEFT and forget the node
    pub fn remove_node(
        &mut self,
        node_id: &str,
        now: DateTime<Utc>,
        delay_for: impl Fn(&ShardRouting) -> bool,
        in_sync_for: impl Fn(&ShardId) -> BTreeSet<String>,
        changes: &mut RoutingChanges,
    ) {
        let allocation_ids: Vec<(ShardId, String)> = match self.node(node_id) {
            Some(node) => node
                .iter()
                .filter_map(|s| Some((s.shard_id.clone(), s.allocation_id_str()?.to_string())))
                .collect(),
            None => return,
        };
        for (shard_id, allocation_id) in allocation_ids {
            let Some(shard) = self
                .node(node_id)
                .and_then(|n| n.get(&shard_id))
                .filter(|s| s.allocation_id_str() == Some(allocation_id.as_str()))
                .cloned()
            else {
                continue;
            };
            let info = UnassignedInfo::new(
                UnassignedReason::NodeLeft,
                Some(format!("node_left [{}]", node_id)),
                now,
            )
            .with_delayed(delay_for(&shard))
            .with_last_allocated_node(Some(node_id.to_string()));
            let in_sync = in_sync_for(&shard_id);
            self.fail_shard(&shard, info, &in_sync, changes);
        }
        if let Some(node) = self.nodes.remove(node_id) {
            debug_assert!(node.is_empty(), "node {} still holds shards", node_id);
        }
    }

    /// Convert back into an immutable routing table (relocation targets are not stored)
    pub fn into_routing_table(self, previous: &RoutingTable) -> RoutingTable {
        let mut grouped: BTreeMap<ShardId, Vec<ShardRouting>> = BTreeMap::new();
        let stored = self
            .nodes
            .into_values()
            .flat_map(|n| n.shards.into_values())
            .filter(|s| !s.is_relocation_target())
            .chain(self.unassigned)
            .chain(self.ignored);
        for shard in stored {
            grouped.entry(shard.shard_id.clone()).or_default().push(shard);
        }

        let mut indices: BTreeMap<String, IndexRoutingTable> = BTreeMap::new();
        for (shard_id, mut copies) in grouped {
            copies.sort_by(|a, b| {
                (!a.primary, a.current_node_id.is_none(), &a.current_node_id)
                    .cmp(&(!b.primary, b.current_node_id.is_none(), &b.current_node_id))
            });
            let table = indices
                .entry(shard_id.index.name.clone())
                .or_insert_with(|| IndexRoutingTable::new(shard_id.index.clone()));
            table
                .shards
                .insert(shard_id.id, IndexShardRoutingTable::new(shard_id, copies));
        }
        RoutingTable {
            version: previous.version + 1,
            indices,
        }
    }
}

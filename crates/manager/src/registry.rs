//! Registries of node-reported information
//!
//! Data nodes push what they know (copies on disk, disk usage, snapshot progress) to the
//! manager. The registries keep the latest reports and hand snapshots of them to the
//! allocation engine, which never waits on a node.

use allocation::{
    ClusterInfo, ClusterInfoService, DiskUsage, FetchResult, NodeShardState, RestoreShardState,
    ShardStateFetcher, SnapshotsInfo, SnapshotsInfoService,
};
use cluster_core::{DiscoveryNodes, NodeId, ShardId};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

#[derive(Default)]
struct ShardStates {
    copies: BTreeMap<ShardId, BTreeMap<NodeId, NodeShardState>>,
    /// Nodes that sent at least one report since they joined
    reported: BTreeSet<NodeId>,
}

/// Shard copies found on the disks of the data nodes
#[derive(Default)]
pub struct ShardStateRegistry {
    inner: RwLock<ShardStates>,
}

impl ShardStateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace everything `node_id` holds with `copies`
    pub fn report(&self, node_id: &str, copies: Vec<(ShardId, NodeShardState)>) {
        let mut inner = self.inner.write();
        for holders in inner.copies.values_mut() {
            holders.remove(node_id);
        }
        let count = copies.len();
        for (shard_id, mut state) in copies {
            state.node_id = node_id.to_string();
            inner
                .copies
                .entry(shard_id)
                .or_default()
                .insert(node_id.to_string(), state);
        }
        inner.copies.retain(|_, holders| !holders.is_empty());
        inner.reported.insert(node_id.to_string());
        debug!("Node {} reported {} shard copies", node_id, count);
    }

    /// Drop everything known about a node that left
    pub fn forget_node(&self, node_id: &str) {
        let mut inner = self.inner.write();
        for holders in inner.copies.values_mut() {
            holders.remove(node_id);
        }
        inner.copies.retain(|_, holders| !holders.is_empty());
        if inner.reported.remove(node_id) {
            info!("Forgot shard states of node {}", node_id);
        }
    }

    pub fn has_reported(&self, node_id: &str) -> bool {
        self.inner.read().reported.contains(node_id)
    }

    /// Copies of one shard, by node
    pub fn copies(&self, shard_id: &ShardId) -> Vec<NodeShardState> {
        self.inner
            .read()
            .copies
            .get(shard_id)
            .map(|holders| holders.values().cloned().collect())
            .unwrap_or_default()
    }
}

impl ShardStateFetcher for ShardStateRegistry {
    fn fetch(&self, shard_id: &ShardId, nodes: &DiscoveryNodes) -> FetchResult {
        let inner = self.inner.read();
        let waiting: Vec<&str> = nodes
            .data_nodes()
            .map(|n| n.id.as_str())
            .filter(|id| !inner.reported.contains(*id))
            .collect();
        if !waiting.is_empty() {
            debug!("Shard states of {} pending from {:?}", shard_id, waiting);
            return FetchResult::Fetching;
        }

        let copies = inner
            .copies
            .get(shard_id)
            .map(|holders| {
                holders
                    .iter()
                    .filter(|(node_id, _)| nodes.contains(node_id))
                    .map(|(_, state)| state.clone())
                    .collect()
            })
            .unwrap_or_default();
        FetchResult::Data(copies)
    }
}

/// Disk usage and shard sizes reported by the nodes
#[derive(Default)]
pub struct ClusterInfoRegistry {
    info: RwLock<ClusterInfo>,
}

impl ClusterInfoRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_disk_usage(&self, node_id: &str, usage: DiskUsage) {
        debug!(
            "Disk usage of {}: {:.1}% of {} bytes",
            node_id,
            usage.used_percent(),
            usage.total_bytes
        );
        self.info.write().disk_usages.insert(node_id.to_string(), usage);
    }

    pub fn set_shard_size(&self, shard_id: ShardId, size_bytes: u64) {
        self.info.write().shard_sizes.insert(shard_id, size_bytes);
    }

    pub fn remove_node(&self, node_id: &str) {
        self.info.write().disk_usages.remove(node_id);
    }

    pub fn remove_index(&self, index_name: &str) {
        self.info
            .write()
            .shard_sizes
            .retain(|shard_id, _| shard_id.index_name() != index_name);
    }
}

impl ClusterInfoService for ClusterInfoRegistry {
    fn cluster_info(&self) -> ClusterInfo {
        self.info.read().clone()
    }
}

/// Snapshot and restore progress
#[derive(Default)]
pub struct SnapshotsRegistry {
    info: RwLock<SnapshotsInfo>,
}

impl SnapshotsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole picture, as sent by the snapshot coordinator
    pub fn replace(&self, info: SnapshotsInfo) {
        info!(
            "Snapshots updated: {} shards snapshotting, {} restores",
            info.snapshotting.len(),
            info.restores.len()
        );
        *self.info.write() = info;
    }

    pub fn set_restore_state(&self, shard_id: ShardId, state: RestoreShardState) {
        self.info.write().restores.insert(shard_id, state);
    }
}

impl SnapshotsInfoService for SnapshotsRegistry {
    fn snapshots_info(&self) -> SnapshotsInfo {
        self.info.read().clone()
    }
}

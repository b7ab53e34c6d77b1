//! Snapshots of external information consumed by the deciders
//!
//! Both services are read once at the start of a reroute pass; the deciders only see the
//! snapshot.

use cluster_core::{NodeId, ShardId, ShardRouting};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Disk usage of one node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskUsage {
    pub total_bytes: u64,
    pub free_bytes: u64,
}

impl DiskUsage {
    pub fn new(total_bytes: u64, free_bytes: u64) -> Self {
        Self {
            total_bytes,
            free_bytes: free_bytes.min(total_bytes),
        }
    }

    pub fn used_bytes(&self) -> u64 {
        self.total_bytes - self.free_bytes
    }

    pub fn used_percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        100.0 * self.used_bytes() as f64 / self.total_bytes as f64
    }
}

/// Disk usage and shard sizes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterInfo {
    pub disk_usages: BTreeMap<NodeId, DiskUsage>,
    /// Store size of each shard (replicas are assumed as large as their primary)
    pub shard_sizes: BTreeMap<ShardId, u64>,
}

impl ClusterInfo {
    pub fn disk_usage(&self, node_id: &str) -> Option<&DiskUsage> {
        self.disk_usages.get(node_id)
    }

    pub fn shard_size(&self, shard: &ShardRouting) -> Option<u64> {
        self.shard_sizes.get(&shard.shard_id).copied()
    }

    /// Known size, falling back to the expected size carried by the copy
    pub fn shard_size_or(&self, shard: &ShardRouting, default: u64) -> u64 {
        self.shard_size(shard)
            .or(shard.expected_shard_size)
            .unwrap_or(default)
    }
}

/// Source of `ClusterInfo` snapshots
pub trait ClusterInfoService: Send + Sync {
    fn cluster_info(&self) -> ClusterInfo;
}

/// Reports nothing; disk-based deciders then always say YES
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyClusterInfoService;

impl ClusterInfoService for EmptyClusterInfoService {
    fn cluster_info(&self) -> ClusterInfo {
        ClusterInfo::default()
    }
}

/// Restore progress of one shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreShardState {
    Init,
    Started,
    Success,
    Failed,
}

impl RestoreShardState {
    pub fn failed(&self) -> bool {
        *self == RestoreShardState::Failed
    }
}

/// In-progress snapshots and restores
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotsInfo {
    /// Primary shards currently being snapshotted, with the node they are read from
    pub snapshotting: BTreeMap<ShardId, NodeId>,
    pub restores: BTreeMap<ShardId, RestoreShardState>,
}

impl SnapshotsInfo {
    pub fn is_snapshotting(&self, shard_id: &ShardId, node_id: &str) -> bool {
        self.snapshotting.get(shard_id).map(String::as_str) == Some(node_id)
    }

    pub fn restore_state(&self, shard_id: &ShardId) -> Option<RestoreShardState> {
        self.restores.get(shard_id).copied()
    }
}

/// Source of `SnapshotsInfo` snapshots
pub trait SnapshotsInfoService: Send + Sync {
    fn snapshots_info(&self) -> SnapshotsInfo;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EmptySnapshotsInfoService;

impl SnapshotsInfoService for EmptySnapshotsInfoService {
    fn snapshots_info(&self) -> SnapshotsInfo {
        SnapshotsInfo::default()
    }
}

//! Request and response bodies of the manager operations

use allocation::{
    AllocationCommands, FailedShardEntry, NodeShardState, RerouteExplanation, RerouteOptions,
    RestoreShardState, SnapshotsInfo, StaleShard,
};
use cluster_core::{
    DiscoveryNode, Index, IndexSettings, Metadata, NodeId, NodeRole, RoutingTable, ShardId,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::warn;

fn default_roles() -> BTreeSet<NodeRole> {
    [NodeRole::ClusterManager, NodeRole::Data].into_iter().collect()
}

/// Resolve an index name to its identity; an explicit uuid wins over the metadata
fn resolve_index(metadata: &Metadata, name: &str, uuid: Option<&str>) -> Option<Index> {
    match uuid {
        Some(uuid) => Some(Index::new(name, uuid)),
        None => metadata.index(name).map(|meta| meta.index.clone()),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateIndexRequest {
    pub name: String,
    #[serde(default)]
    pub settings: IndexSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterNodeRequest {
    pub node_id: NodeId,
    pub address: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_roles")]
    pub roles: BTreeSet<NodeRole>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    /// Copies found on the node's disk
    #[serde(default)]
    pub shards: Vec<ShardStateReport>,
}

impl RegisterNodeRequest {
    pub fn to_discovery_node(&self) -> DiscoveryNode {
        let node = DiscoveryNode::new(&self.node_id, &self.address).with_roles(self.roles.iter().copied());
        let node = match &self.name {
            Some(name) => node.with_name(name),
            None => node,
        };
        self.attributes
            .iter()
            .fold(node, |node, (k, v)| node.with_attribute(k, v))
    }
}

/// One shard copy a node holds on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardStateReport {
    pub index: String,
    /// Defaults to the uuid of the index in the current metadata
    #[serde(default)]
    pub index_uuid: Option<String>,
    pub shard: u32,
    pub allocation_id: String,
    #[serde(default)]
    pub primary: bool,
    #[serde(default)]
    pub primary_term: u64,
    #[serde(default)]
    pub max_seq_no: i64,
    #[serde(default)]
    pub store_error: Option<String>,
}

impl ShardStateReport {
    /// Turn reports into registry entries; copies of unknown indices are skipped
    pub fn resolve_all(
        node_id: &str,
        reports: Vec<ShardStateReport>,
        metadata: &Metadata,
    ) -> Vec<(ShardId, NodeShardState)> {
        reports
            .into_iter()
            .filter_map(|report| {
                let Some(index) = resolve_index(metadata, &report.index, report.index_uuid.as_deref()) else {
                    warn!(
                        "Node {} reported a copy of unknown index [{}], ignoring",
                        node_id, report.index
                    );
                    return None;
                };
                let state = NodeShardState {
                    node_id: node_id.to_string(),
                    allocation_id: Some(report.allocation_id),
                    primary: report.primary,
                    primary_term: report.primary_term,
                    max_seq_no: report.max_seq_no,
                    store_error: report.store_error,
                };
                Some((ShardId::new(index, report.shard), state))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateReplicasRequest {
    pub number_of_replicas: u32,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct DiskUsageRequest {
    pub total_bytes: u64,
    pub free_bytes: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FailedShardsRequest {
    #[serde(default)]
    pub failed: Vec<FailedShardEntry>,
    #[serde(default)]
    pub stale: Vec<StaleShard>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RerouteRequest {
    #[serde(default)]
    pub commands: AllocationCommands,
    #[serde(flatten)]
    pub options: RerouteOptions,
}

#[derive(Debug, Clone, Serialize)]
pub struct RerouteResponse {
    /// False for a dry run: the computed state was not published
    pub acknowledged: bool,
    pub state_version: u64,
    pub explanations: Vec<RerouteExplanation>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoutingResponse {
    pub version: u64,
    pub state_uuid: String,
    pub routing_table: Arc<RoutingTable>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotShard {
    pub index: String,
    pub shard: u32,
    pub node: NodeId,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RestoreShard {
    pub index: String,
    pub shard: u32,
    pub state: RestoreShardState,
}

/// Full picture of running snapshots and restores
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SnapshotsUpdate {
    #[serde(default)]
    pub snapshotting: Vec<SnapshotShard>,
    #[serde(default)]
    pub restores: Vec<RestoreShard>,
}

impl SnapshotsUpdate {
    pub fn resolve(self, metadata: &Metadata) -> SnapshotsInfo {
        let mut info = SnapshotsInfo::default();
        for entry in self.snapshotting {
            if let Some(index) = resolve_index(metadata, &entry.index, None) {
                info.snapshotting.insert(ShardId::new(index, entry.shard), entry.node);
            }
        }
        for entry in self.restores {
            if let Some(index) = resolve_index(metadata, &entry.index, None) {
                info.restores.insert(ShardId::new(index, entry.shard), entry.state);
            }
        }
        info
    }
}

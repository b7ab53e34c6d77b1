//! Cluster health: a read-only projection of the routing table

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::metadata::IndexMetadata;
use crate::routing::{IndexRoutingTable, IndexShardRoutingTable};
use crate::shard::{RecoverySource, ShardRouting};
use crate::state::ClusterState;
use crate::unassigned::{AllocationStatus, UnassignedReason};

/// Health status, ordered from best to worst
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Every copy active
    Green,
    /// Every primary active, some replica not
    Yellow,
    /// Some primary not active
    Red,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Green => write!(f, "green"),
            HealthStatus::Yellow => write!(f, "yellow"),
            HealthStatus::Red => write!(f, "red"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardCounts {
    pub active_primary_shards: usize,
    pub active_shards: usize,
    pub relocating_shards: usize,
    pub initializing_shards: usize,
    pub unassigned_shards: usize,
    pub delayed_unassigned_shards: usize,
}

impl ShardCounts {
    fn add(&mut self, other: &ShardCounts) {
        self.active_primary_shards += other.active_primary_shards;
        self.active_shards += other.active_shards;
        self.relocating_shards += other.relocating_shards;
        self.initializing_shards += other.initializing_shards;
        self.unassigned_shards += other.unassigned_shards;
        self.delayed_unassigned_shards += other.delayed_unassigned_shards;
    }

    fn count(&mut self, copy: &ShardRouting) {
        if copy.active() {
            self.active_shards += 1;
            if copy.primary {
                self.active_primary_shards += 1;
            }
            if copy.relocating() {
                self.relocating_shards += 1;
                // the derived target is recovering
                self.initializing_shards += 1;
            }
        } else if copy.initializing() {
            self.initializing_shards += 1;
        } else {
            self.unassigned_shards += 1;
            if copy.unassigned_info.as_ref().map(|i| i.delayed).unwrap_or(false) {
                self.delayed_unassigned_shards += 1;
            }
        }
    }
}

/// Health of one shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardHealth {
    pub status: HealthStatus,
    pub primary_active: bool,
    #[serde(flatten)]
    pub counts: ShardCounts,
}

impl ShardHealth {
    pub fn from_table(table: &IndexShardRoutingTable) -> Self {
        let mut counts = ShardCounts::default();
        for copy in table.iter() {
            counts.count(copy);
        }
        let primary_active = table.primary_active();
        let status = if primary_active {
            if table.all_active() {
                HealthStatus::Green
            } else {
                HealthStatus::Yellow
            }
        } else {
            table
                .primary_shard()
                .map(inactive_primary_health)
                .unwrap_or(HealthStatus::Red)
        };
        Self {
            status,
            primary_active,
            counts,
        }
    }
}

/// A primary of a freshly created index that has not failed yet is only yellow
fn inactive_primary_health(primary: &ShardRouting) -> HealthStatus {
    if primary.recovery_source != Some(RecoverySource::EmptyStore) {
        return HealthStatus::Red;
    }
    if primary.initializing() {
        return HealthStatus::Yellow;
    }
    match &primary.unassigned_info {
        Some(info)
            if info.reason == UnassignedReason::IndexCreated
                && matches!(
                    info.last_allocation_status,
                    AllocationStatus::NoAttempt | AllocationStatus::DecidersThrottled
                ) =>
        {
            HealthStatus::Yellow
        }
        _ => HealthStatus::Red,
    }
}

/// Health of one index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexHealth {
    pub status: HealthStatus,
    pub number_of_shards: u32,
    pub number_of_replicas: u32,
    #[serde(flatten)]
    pub counts: ShardCounts,
    pub shards: BTreeMap<u32, ShardHealth>,
}

impl IndexHealth {
    pub fn new(meta: &IndexMetadata, table: Option<&IndexRoutingTable>) -> Self {
        let mut counts = ShardCounts::default();
        let mut shards = BTreeMap::new();
        let mut status = HealthStatus::Green;
        match table {
            Some(table) => {
                for (ordinal, shard_table) in &table.shards {
                    let health = ShardHealth::from_table(shard_table);
                    counts.add(&health.counts);
                    status = status.max(health.status);
                    shards.insert(*ordinal, health);
                }
            }
            None => status = HealthStatus::Red,
        }
        Self {
            status,
            number_of_shards: meta.number_of_shards(),
            number_of_replicas: meta.number_of_replicas(),
            counts,
            shards,
        }
    }
}

/// Health of the cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterHealth {
    pub cluster_name: String,
    pub status: HealthStatus,
    pub number_of_nodes: usize,
    pub number_of_data_nodes: usize,
    #[serde(flatten)]
    pub counts: ShardCounts,
    pub indices: BTreeMap<String, IndexHealth>,
}

impl ClusterHealth {
    /// Project `state` into a health report; closed indices are skipped
    pub fn from_state(state: &ClusterState) -> Self {
        let mut counts = ShardCounts::default();
        let mut status = HealthStatus::Green;
        let mut indices = BTreeMap::new();
        for meta in state.metadata.iter().filter(|m| m.is_open()) {
            let health = IndexHealth::new(meta, state.routing_table.index(meta.name()));
            counts.add(&health.counts);
            status = status.max(health.status);
            indices.insert(meta.name().to_string(), health);
        }
        Self {
            cluster_name: state.cluster_name.clone(),
            status,
            number_of_nodes: state.nodes.len(),
            number_of_data_nodes: state.nodes.data_nodes().count(),
            counts,
            indices,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Metadata;
    use crate::node::DiscoveryNodes;
    use crate::routing::{IndexShardRoutingTable, RoutingTableBuilder};
    use crate::unassigned::UnassignedInfo;
    use chrono::Utc;

    fn state_with(meta: &IndexMetadata, copies: Option<Vec<ShardRouting>>) -> ClusterState {
        let mut builder = RoutingTableBuilder::new();
        builder.add_as_new(meta, Utc::now()).unwrap();
        if let Some(copies) = copies {
            let mut table = builder.index(meta.name()).unwrap().clone();
            table
                .shards
                .insert(0, IndexShardRoutingTable::new(meta.shard_id(0), copies));
            builder.put(table);
        }
        let metadata = Metadata::builder().put(meta.clone()).build().unwrap();
        ClusterState::new("test", metadata, DiscoveryNodes::new())
            .builder()
            .routing_table(builder.build())
            .build()
    }

    fn meta() -> IndexMetadata {
        IndexMetadata::builder("logs")
            .uuid("u1")
            .number_of_shards(1)
            .number_of_replicas(1)
            .build()
            .unwrap()
    }

    #[test]
    fn test_new_index_is_yellow_until_failed() {
        let meta = meta();
        let health = ClusterHealth::from_state(&state_with(&meta, None));
        assert_eq!(health.status, HealthStatus::Yellow);
        assert_eq!(health.counts.unassigned_shards, 2);
    }

    #[test]
    fn test_green_yellow_red() {
        let meta = meta();
        let table = state_with(&meta, None);
        let shard = table.routing_table.shard_table(&meta.shard_id(0)).unwrap();
        let primary = shard.primary_shard().unwrap().clone();
        let replica = shard.replica_shards().next().unwrap().clone();

        let started_primary = primary.initialize("n1", None, None).move_to_started();
        let started_replica = replica.initialize("n2", None, None).move_to_started();

        let green = state_with(&meta, Some(vec![started_primary.clone(), started_replica.clone()]));
        assert_eq!(ClusterHealth::from_state(&green).status, HealthStatus::Green);

        let yellow = state_with(&meta, Some(vec![started_primary.clone(), replica.clone()]));
        assert_eq!(ClusterHealth::from_state(&yellow).status, HealthStatus::Yellow);

        let failed = started_primary.move_to_unassigned(UnassignedInfo::new(
            UnassignedReason::AllocationFailed,
            None,
            Utc::now(),
        ));
        let red = state_with(&meta, Some(vec![failed, started_replica]));
        let health = ClusterHealth::from_state(&red);
        assert_eq!(health.status, HealthStatus::Red);
        assert_eq!(health.counts.active_shards, 1);
        assert_eq!(health.counts.active_primary_shards, 0);
    }
}

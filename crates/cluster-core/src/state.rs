//! Published cluster state
//!
//! A `ClusterState` is never mutated once built. Every change goes through
//! `ClusterState::builder`, which produces a new value with a bumped version and a new uuid.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::metadata::Metadata;
use crate::node::DiscoveryNodes;
use crate::routing::RoutingTable;

/// Cluster state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterState {
    pub cluster_name: String,
    pub version: u64,
    pub state_uuid: String,
    pub metadata: Arc<Metadata>,
    pub routing_table: Arc<RoutingTable>,
    pub nodes: Arc<DiscoveryNodes>,
}

impl ClusterState {
    /// Initial state at version 0
    pub fn new(cluster_name: impl Into<String>, metadata: Metadata, nodes: DiscoveryNodes) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            version: 0,
            state_uuid: Uuid::new_v4().to_string(),
            metadata: Arc::new(metadata),
            routing_table: Arc::new(RoutingTable::empty()),
            nodes: Arc::new(nodes),
        }
    }

    /// Copy-on-write builder seeded with this state
    pub fn builder(&self) -> ClusterStateBuilder {
        ClusterStateBuilder {
            cluster_name: self.cluster_name.clone(),
            version: self.version,
            metadata: self.metadata.clone(),
            routing_table: self.routing_table.clone(),
            nodes: self.nodes.clone(),
        }
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn routing_table(&self) -> &RoutingTable {
        &self.routing_table
    }

    pub fn nodes(&self) -> &DiscoveryNodes {
        &self.nodes
    }

    /// Whether this state has the same content as `other` (version and uuid ignored)
    pub fn same_content(&self, other: &ClusterState) -> bool {
        self.routing_table.same_routing(&other.routing_table)
            && self.metadata == other.metadata
            && self.nodes == other.nodes
    }
}

/// Cluster state builder
#[derive(Debug, Clone)]
pub struct ClusterStateBuilder {
    cluster_name: String,
    version: u64,
    metadata: Arc<Metadata>,
    routing_table: Arc<RoutingTable>,
    nodes: Arc<DiscoveryNodes>,
}

impl ClusterStateBuilder {
    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Arc::new(metadata);
        self
    }

    pub fn routing_table(mut self, routing_table: RoutingTable) -> Self {
        self.routing_table = Arc::new(routing_table);
        self
    }

    pub fn nodes(mut self, nodes: DiscoveryNodes) -> Self {
        self.nodes = Arc::new(nodes);
        self
    }

    /// Build the next state: version + 1, fresh uuid
    pub fn build(self) -> ClusterState {
        ClusterState {
            cluster_name: self.cluster_name,
            version: self.version + 1,
            state_uuid: Uuid::new_v4().to_string(),
            metadata: self.metadata,
            routing_table: self.routing_table,
            nodes: self.nodes,
        }
    }
}

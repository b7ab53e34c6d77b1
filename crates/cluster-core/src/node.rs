//! Discovery node definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Node ID
pub type NodeId = String;

/// Role a node plays in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    /// Eligible to be elected cluster manager
    ClusterManager,
    /// Holds shards on locally attached storage
    Data,
    /// Runs ingest pipelines
    Ingest,
    /// Serves shards backed by remote storage
    Search,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::ClusterManager => write!(f, "cluster_manager"),
            NodeRole::Data => write!(f, "data"),
            NodeRole::Ingest => write!(f, "ingest"),
            NodeRole::Search => write!(f, "search"),
        }
    }
}

/// A node known to the cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryNode {
    /// Node ID
    pub id: NodeId,
    /// Human readable name
    pub name: String,
    /// Transport address (host:port)
    pub address: String,
    /// Roles
    pub roles: BTreeSet<NodeRole>,
    /// Custom attributes (zone, rack, ...), used by filtering and awareness
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    /// Time the node joined
    pub joined_at: DateTime<Utc>,
}

impl DiscoveryNode {
    /// Create a cluster-manager-eligible data node
    pub fn new(id: impl Into<NodeId>, address: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            address: address.into(),
            roles: [NodeRole::ClusterManager, NodeRole::Data].into_iter().collect(),
            attributes: BTreeMap::new(),
            joined_at: Utc::now(),
        }
    }

    /// Replace the role set
    pub fn with_roles(mut self, roles: impl IntoIterator<Item = NodeRole>) -> Self {
        self.roles = roles.into_iter().collect();
        self
    }

    /// Add a custom attribute
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn has_role(&self, role: NodeRole) -> bool {
        self.roles.contains(&role)
    }

    /// Whether shards may be allocated to this node at all
    pub fn can_hold_shards(&self) -> bool {
        self.has_role(NodeRole::Data) || self.has_role(NodeRole::Search)
    }

    pub fn is_data_node(&self) -> bool {
        self.has_role(NodeRole::Data)
    }

    pub fn is_search_node(&self) -> bool {
        self.has_role(NodeRole::Search)
    }

    pub fn is_cluster_manager_eligible(&self) -> bool {
        self.has_role(NodeRole::ClusterManager)
    }

    /// Host name: the `host` attribute if present, otherwise the address without port
    pub fn host(&self) -> &str {
        if let Some(host) = self.attributes.get("host") {
            return host;
        }
        match self.address.rsplit_once(':') {
            Some((host, _)) => host,
            None => &self.address,
        }
    }
}

/// Difference between two node sets
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodesDelta {
    pub added: Vec<NodeId>,
    pub removed: Vec<NodeId>,
}

impl NodesDelta {
    pub fn has_changes(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }
}

/// The set of nodes currently in the cluster
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryNodes {
    nodes: BTreeMap<NodeId, DiscoveryNode>,
    /// Node running this process (if it is part of the set)
    pub local_node_id: Option<NodeId>,
    /// Currently elected cluster manager
    pub cluster_manager_node_id: Option<NodeId>,
}

impl DiscoveryNodes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a node
    pub fn with_node(mut self, node: DiscoveryNode) -> Self {
        self.nodes.insert(node.id.clone(), node);
        self
    }

    /// Remove a node; clears the elected manager if it was that node
    pub fn without_node(mut self, node_id: &str) -> Self {
        self.nodes.remove(node_id);
        if self.cluster_manager_node_id.as_deref() == Some(node_id) {
            self.cluster_manager_node_id = None;
        }
        self
    }

    pub fn with_cluster_manager(mut self, node_id: Option<NodeId>) -> Self {
        self.cluster_manager_node_id = node_id;
        self
    }

    pub fn with_local_node(mut self, node_id: Option<NodeId>) -> Self {
        self.local_node_id = node_id;
        self
    }

    pub fn get(&self, node_id: &str) -> Option<&DiscoveryNode> {
        self.nodes.get(node_id)
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All nodes, ordered by id
    pub fn iter(&self) -> impl Iterator<Item = &DiscoveryNode> {
        self.nodes.values()
    }

    /// Nodes that may hold shards, ordered by id
    pub fn data_nodes(&self) -> impl Iterator<Item = &DiscoveryNode> {
        self.nodes.values().filter(|n| n.can_hold_shards())
    }

    pub fn cluster_manager_eligible_nodes(&self) -> impl Iterator<Item = &DiscoveryNode> {
        self.nodes.values().filter(|n| n.is_cluster_manager_eligible())
    }

    /// Compute nodes added and removed relative to `previous`
    pub fn delta(&self, previous: &DiscoveryNodes) -> NodesDelta {
        NodesDelta {
            added: self
                .nodes
                .keys()
                .filter(|id| !previous.contains(id))
                .cloned()
                .collect(),
            removed: previous
                .nodes
                .keys()
                .filter(|id| !self.contains(id))
                .cloned()
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_from_address_or_attribute() {
        let node = DiscoveryNode::new("n1", "10.0.0.1:9300");
        assert_eq!(node.host(), "10.0.0.1");

        let node = node.with_attribute("host", "rack-a-host");
        assert_eq!(node.host(), "rack-a-host");
    }

    #[test]
    fn test_nodes_delta() {
        let before = DiscoveryNodes::new()
            .with_node(DiscoveryNode::new("n1", "a:1"))
            .with_node(DiscoveryNode::new("n2", "b:1"));
        let after = before
            .clone()
            .without_node("n1")
            .with_node(DiscoveryNode::new("n3", "c:1"));

        let delta = after.delta(&before);
        assert_eq!(delta.added, vec!["n3".to_string()]);
        assert_eq!(delta.removed, vec!["n1".to_string()]);
        assert!(delta.has_changes());
    }

    #[test]
    fn test_data_nodes_filter_roles() {
        let nodes = DiscoveryNodes::new()
            .with_node(DiscoveryNode::new("data", "a:1"))
            .with_node(DiscoveryNode::new("manager", "b:1").with_roles([NodeRole::ClusterManager]))
            .with_node(DiscoveryNode::new("search", "c:1").with_roles([NodeRole::Search]));

        let ids: Vec<_> = nodes.data_nodes().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["data", "search"]);
        assert_eq!(nodes.cluster_manager_eligible_nodes().count(), 2);
    }
}

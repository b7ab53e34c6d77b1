//! Working context of one allocation pass

use chrono::{DateTime, Utc};
use cluster_core::{AllocationSettings, ClusterState, DiscoveryNodes, IndexMetadata, Metadata, ShardId};

use crate::changes::RoutingChanges;
use crate::commands::RerouteExplanation;
use crate::deciders::AllocationDeciders;
use crate::info::{ClusterInfo, SnapshotsInfo};
use crate::routing_nodes::RoutingNodes;

/// How much the decider chain records
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DebugMode {
    /// Stop at the first NO, keep only non-YES verdicts
    #[default]
    Off,
    /// Evaluate every decider and keep every verdict
    On,
    /// Evaluate every decider, keep only non-YES verdicts
    ExcludeYesDecisions,
}

/// Per-pass allocation context
///
/// Owns the `RoutingNodes` of the pass; everything else is a read-only snapshot.
pub struct RoutingAllocation<'a> {
    pub routing_nodes: RoutingNodes,
    pub changes: RoutingChanges,
    deciders: &'a AllocationDeciders,
    state: &'a ClusterState,
    cluster_info: ClusterInfo,
    snapshots_info: SnapshotsInfo,
    current_time: DateTime<Utc>,
    debug_mode: DebugMode,
    /// Manual commands may allocate even when allocation is disabled
    ignore_disable: bool,
    explanations: Vec<RerouteExplanation>,
}

impl<'a> RoutingAllocation<'a> {
    pub fn new(
        deciders: &'a AllocationDeciders,
        state: &'a ClusterState,
        cluster_info: ClusterInfo,
        snapshots_info: SnapshotsInfo,
        current_time: DateTime<Utc>,
    ) -> Self {
        Self {
            routing_nodes: RoutingNodes::new(state),
            changes: RoutingChanges::new(),
            deciders,
            state,
            cluster_info,
            snapshots_info,
            current_time,
            debug_mode: DebugMode::Off,
            ignore_disable: false,
            explanations: Vec::new(),
        }
    }

    pub fn deciders(&self) -> &'a AllocationDeciders {
        self.deciders
    }

    pub fn state(&self) -> &'a ClusterState {
        self.state
    }

    pub fn metadata(&self) -> &'a Metadata {
        &self.state.metadata
    }

    pub fn nodes(&self) -> &'a DiscoveryNodes {
        &self.state.nodes
    }

    pub fn settings(&self) -> &'a AllocationSettings {
        &self.state.metadata.settings.allocation
    }

    pub fn index_metadata(&self, shard_id: &ShardId) -> Option<&'a IndexMetadata> {
        self.state.metadata.index_for_shard(shard_id)
    }

    pub fn cluster_info(&self) -> &ClusterInfo {
        &self.cluster_info
    }

    pub fn snapshots_info(&self) -> &SnapshotsInfo {
        &self.snapshots_info
    }

    pub fn current_time(&self) -> DateTime<Utc> {
        self.current_time
    }

    pub fn debug_mode(&self) -> DebugMode {
        self.debug_mode
    }

    pub fn set_debug_mode(&mut self, mode: DebugMode) {
        self.debug_mode = mode;
    }

    /// Whether every decider must be evaluated
    pub fn debug_decision(&self) -> bool {
        self.debug_mode != DebugMode::Off
    }

    pub fn ignore_disable(&self) -> bool {
        self.ignore_disable
    }

    pub fn set_ignore_disable(&mut self, ignore: bool) {
        self.ignore_disable = ignore;
    }

    pub fn add_explanation(&mut self, explanation: RerouteExplanation) {
        self.explanations.push(explanation);
    }

    pub fn take_explanations(&mut self) -> Vec<RerouteExplanation> {
        std::mem::take(&mut self.explanations)
    }

    /// Hand back the routing nodes and the recorded changes at the end of the pass
    pub fn into_parts(self) -> (RoutingNodes, RoutingChanges) {
        (self.routing_nodes, self.changes)
    }

    /// Data nodes of the cluster that have a routing node, ordered by id
    pub fn data_node_ids(&self) -> Vec<String> {
        self.state
            .nodes
            .data_nodes()
            .filter(|n| self.routing_nodes.node(&n.id).is_some())
            .map(|n| n.id.clone())
            .collect()
    }
}

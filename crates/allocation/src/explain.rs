//! Allocation explain
//!
//! Answers "why is this copy where it is, or why is it unassigned" without changing the
//! cluster. The allocators are asked for their decision in debug mode so that every
//! decider verdict is part of the answer.

use cluster_core::{NodeId, ShardRouting, ShardRoutingState, UnassignedInfo};
use serde::{Deserialize, Serialize};

use crate::allocation::{DebugMode, RoutingAllocation};
use crate::allocator::{ShardAllocationDecision, ShardsAllocator};
use crate::error::{AllocationError, Result};
use crate::gateway::GatewayAllocator;

/// Which copy to explain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterAllocationExplainRequest {
    pub index: String,
    pub shard: u32,
    pub primary: bool,
    /// Pick the copy on this node; otherwise an unassigned copy is preferred
    #[serde(default)]
    pub current_node: Option<NodeId>,
    /// Keep YES verdicts in the per-node decisions
    #[serde(default)]
    pub include_yes_decisions: bool,
}

/// Explanation of one copy
#[derive(Debug, Clone, Serialize)]
pub struct ClusterAllocationExplanation {
    pub index: String,
    pub shard: u32,
    pub primary: bool,
    pub current_state: ShardRoutingState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_node: Option<NodeId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relocating_node: Option<NodeId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allocation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unassigned_info: Option<UnassignedInfo>,
    #[serde(flatten)]
    pub decision: ShardAllocationDecision,
}

/// Locate the copy `request` designates
pub fn find_shard(allocation: &RoutingAllocation<'_>, request: &ClusterAllocationExplainRequest) -> Result<ShardRouting> {
    let meta = allocation
        .metadata()
        .index(&request.index)
        .ok_or_else(|| AllocationError::IndexNotFound(request.index.clone()))?;
    if request.shard >= meta.number_of_shards() {
        return Err(AllocationError::ShardNotFound(format!("[{}][{}]", request.index, request.shard)));
    }
    let shard_id = meta.shard_id(request.shard);
    let table = allocation
        .state()
        .routing_table()
        .shard_table(&shard_id)
        .ok_or_else(|| AllocationError::ShardNotFound(shard_id.to_string()))?;

    let mut copies: Vec<&ShardRouting> = table.iter().filter(|s| s.primary == request.primary).collect();
    if let Some(node) = &request.current_node {
        if !allocation.nodes().contains(node) {
            return Err(AllocationError::NodeNotFound(node.clone()));
        }
        copies.retain(|s| s.node_id() == Some(node.as_str()));
    }
    copies.sort_by_key(|s| !s.unassigned());
    copies.first().map(|s| (*s).clone()).ok_or_else(|| {
        AllocationError::IllegalArgument(match &request.current_node {
            Some(node) => format!(
                "unable to find a {} copy of {} on node [{}]",
                if request.primary { "primary" } else { "replica" },
                shard_id,
                node
            ),
            None => format!(
                "unable to find a {} copy of {}",
                if request.primary { "primary" } else { "replica" },
                shard_id
            ),
        })
    })
}

/// Pick the first unassigned copy, primaries first; used when no request is given
pub fn first_unassigned(allocation: &RoutingAllocation<'_>) -> Result<ShardRouting> {
    let mut unassigned: Vec<&ShardRouting> = allocation.routing_nodes.unassigned().iter().collect();
    unassigned.sort_by_key(|s| (!s.primary, s.shard_id.clone()));
    unassigned.first().map(|s| (*s).clone()).ok_or_else(|| {
        AllocationError::IllegalArgument(
            "unable to find any unassigned shards to explain, specify the target shard in the request".to_string(),
        )
    })
}

/// Explain `shard` against the given allocation
pub fn explain_shard(
    shard: &ShardRouting,
    allocation: &mut RoutingAllocation<'_>,
    gateway: &GatewayAllocator,
    allocator: &dyn ShardsAllocator,
    include_yes_decisions: bool,
) -> ClusterAllocationExplanation {
    allocation.set_debug_mode(if include_yes_decisions {
        DebugMode::On
    } else {
        DebugMode::ExcludeYesDecisions
    });

    let decision = if shard.unassigned() {
        match gateway.decide_unassigned(shard, allocation) {
            Some(decision) => ShardAllocationDecision {
                allocate: Some(decision),
                ..Default::default()
            },
            None => allocator.decide_shard_allocation(shard, allocation),
        }
    } else {
        allocator.decide_shard_allocation(shard, allocation)
    };

    ClusterAllocationExplanation {
        index: shard.shard_id.index_name().to_string(),
        shard: shard.shard_id.id,
        primary: shard.primary,
        current_state: shard.state,
        current_node: shard.current_node_id.clone(),
        relocating_node: shard.relocating_node_id.clone(),
        allocation_id: shard.allocation_id_str().map(str::to_string),
        unassigned_info: shard.unassigned_info.clone(),
        decision,
    }
}

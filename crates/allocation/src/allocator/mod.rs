//! Shards allocators and the decisions they explain

mod balanced;

pub use balanced::{BalancedShardsAllocator, WeightFunction};

use cluster_core::{NodeId, ShardRouting};
use serde::Serialize;

use crate::allocation::RoutingAllocation;
use crate::decision::{Decision, DecisionKind};

/// Places unassigned shards, moves shards that may not remain, and rebalances
pub trait ShardsAllocator: Send + Sync {
    /// Run one allocation pass over `allocation.routing_nodes`
    fn allocate(&self, allocation: &mut RoutingAllocation<'_>);

    /// Explain what `allocate` would do with `shard`, without changing anything
    fn decide_shard_allocation(&self, shard: &ShardRouting, allocation: &RoutingAllocation<'_>) -> ShardAllocationDecision;
}

/// Outcome of an allocation question, as shown to operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationDecision {
    Yes,
    Throttled,
    No,
    /// A move is possible but would not improve the balance
    WorseBalance,
    /// Waiting for shard state from the nodes
    AwaitingInfo,
    /// Postponed until the node-left delay expires
    AllocationDelayed,
    NoValidShardCopy,
    NoAttempt,
}

impl AllocationDecision {
    pub fn from_kind(kind: DecisionKind) -> Self {
        match kind {
            DecisionKind::Yes => AllocationDecision::Yes,
            DecisionKind::Throttle => AllocationDecision::Throttled,
            DecisionKind::No => AllocationDecision::No,
        }
    }
}

/// Verdict of the decider chain for one node
#[derive(Debug, Clone, Serialize)]
pub struct NodeAllocationResult {
    pub node_id: NodeId,
    pub node_decision: AllocationDecision,
    pub deciders: Decision,
    /// Position of the node when ordered by balance weight (1 is best)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight_ranking: Option<usize>,
    /// The node holds a copy of the shard on disk
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_in_sync: Option<bool>,
}

impl NodeAllocationResult {
    pub fn new(node_id: impl Into<NodeId>, deciders: Decision) -> Self {
        Self {
            node_id: node_id.into(),
            node_decision: AllocationDecision::from_kind(deciders.kind()),
            deciders,
            weight_ranking: None,
            store_in_sync: None,
        }
    }
}

/// What to do with an unassigned copy
#[derive(Debug, Clone, Serialize)]
pub struct AllocateUnassignedDecision {
    pub decision: AllocationDecision,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_node: Option<NodeId>,
    /// Allocation id of an existing copy to reuse
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allocation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_delay_ms: Option<i64>,
    pub explanation: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub node_decisions: Vec<NodeAllocationResult>,
}

impl AllocateUnassignedDecision {
    pub fn no_attempt(explanation: impl Into<String>) -> Self {
        Self::new(AllocationDecision::NoAttempt, None, explanation)
    }

    pub fn new(decision: AllocationDecision, target_node: Option<NodeId>, explanation: impl Into<String>) -> Self {
        Self {
            decision,
            target_node,
            allocation_id: None,
            remaining_delay_ms: None,
            explanation: explanation.into(),
            node_decisions: Vec::new(),
        }
    }

    pub fn with_node_decisions(mut self, node_decisions: Vec<NodeAllocationResult>) -> Self {
        self.node_decisions = node_decisions;
        self
    }

    pub fn with_allocation_id(mut self, allocation_id: Option<String>) -> Self {
        self.allocation_id = allocation_id;
        self
    }

    pub fn with_remaining_delay_ms(mut self, remaining_delay_ms: Option<i64>) -> Self {
        self.remaining_delay_ms = remaining_delay_ms;
        self
    }

    pub fn is_yes(&self) -> bool {
        self.decision == AllocationDecision::Yes
    }
}

/// Whether an assigned copy must move away from its node
#[derive(Debug, Clone, Serialize)]
pub struct MoveDecision {
    pub can_remain: Decision,
    pub decision: AllocationDecision,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_node: Option<NodeId>,
    pub explanation: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub node_decisions: Vec<NodeAllocationResult>,
}

/// Whether an assigned copy would be moved to improve the balance
#[derive(Debug, Clone, Serialize)]
pub struct RebalanceDecision {
    pub can_rebalance: Decision,
    pub decision: AllocationDecision,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_node: Option<NodeId>,
    /// Weight ranking of the node currently holding the copy
    pub current_node_ranking: usize,
    pub explanation: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub node_decisions: Vec<NodeAllocationResult>,
}

/// Everything the allocators can say about one copy
#[derive(Debug, Clone, Default, Serialize)]
pub struct ShardAllocationDecision {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allocate: Option<AllocateUnassignedDecision>,
    #[serde(rename = "move", skip_serializing_if = "Option::is_none")]
    pub move_decision: Option<MoveDecision>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rebalance: Option<RebalanceDecision>,
}

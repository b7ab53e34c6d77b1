//! Allocation deciders
//!
//! Each decider is one placement rule. Deciders are stateless: they only read the
//! `RoutingAllocation` they are given. `AllocationDeciders` runs them in a fixed order
//! and folds their verdicts into one `Decision`.

mod awareness;
mod cluster_rebalance;
mod concurrent_rebalance;
mod disk_threshold;
mod enable;
mod filter;
mod max_retry;
mod rebalance_only_when_active;
mod replica_after_primary_active;
mod restore_in_progress;
mod same_shard;
mod shards_limit;
mod snapshot_in_progress;
mod target_pool;
mod throttling;

pub use awareness::AwarenessAllocationDecider;
pub use cluster_rebalance::ClusterRebalanceAllocationDecider;
pub use concurrent_rebalance::ConcurrentRebalanceAllocationDecider;
pub use disk_threshold::DiskThresholdDecider;
pub use enable::EnableAllocationDecider;
pub use filter::FilterAllocationDecider;
pub use max_retry::MaxRetryAllocationDecider;
pub use rebalance_only_when_active::RebalanceOnlyWhenActiveAllocationDecider;
pub use replica_after_primary_active::ReplicaAfterPrimaryActiveAllocationDecider;
pub use restore_in_progress::RestoreInProgressAllocationDecider;
pub use same_shard::SameShardAllocationDecider;
pub use shards_limit::ShardsLimitAllocationDecider;
pub use snapshot_in_progress::SnapshotInProgressAllocationDecider;
pub use target_pool::TargetPoolAllocationDecider;
pub use throttling::ThrottlingAllocationDecider;

use cluster_core::{DiscoveryNode, IndexMetadata, ShardRouting};

use crate::allocation::{DebugMode, RoutingAllocation};
use crate::decision::Decision;
use crate::routing_nodes::RoutingNode;

/// A single placement rule
///
/// Every method defaults to YES; a decider overrides the questions it has an opinion on.
pub trait AllocationDecider: Send + Sync {
    /// Label attached to the decisions of this decider
    fn name(&self) -> &'static str;

    /// Can `shard` be allocated (or relocated) to `node`?
    fn can_allocate(
        &self,
        _shard: &ShardRouting,
        _node: &RoutingNode,
        _allocation: &RoutingAllocation<'_>,
    ) -> Decision {
        Decision::ALWAYS
    }

    /// Can `shard` stay where it is?
    fn can_remain(
        &self,
        _shard: &ShardRouting,
        _node: &RoutingNode,
        _allocation: &RoutingAllocation<'_>,
    ) -> Decision {
        Decision::ALWAYS
    }

    /// Can `shard` take part in rebalancing?
    fn can_rebalance_shard(&self, _shard: &ShardRouting, _allocation: &RoutingAllocation<'_>) -> Decision {
        Decision::ALWAYS
    }

    /// Can the cluster rebalance at all?
    fn can_rebalance(&self, _allocation: &RoutingAllocation<'_>) -> Decision {
        Decision::ALWAYS
    }

    /// Last-resort allocation of an unassigned primary after every candidate said NO
    ///
    /// By default a NO from `can_allocate` is overridden; deciders whose rules must hold
    /// even then return `can_allocate` unchanged.
    fn can_force_allocate_primary(
        &self,
        shard: &ShardRouting,
        node: &RoutingNode,
        allocation: &RoutingAllocation<'_>,
    ) -> Decision {
        debug_assert!(shard.primary, "force allocation of a replica {}", shard);
        let decision = self.can_allocate(shard, node, allocation);
        if decision.is_no() {
            Decision::yes(
                self.name(),
                format!(
                    "primary shard [{}] allowed to force allocate on node [{}]",
                    shard.shard_id,
                    node.node_id()
                ),
            )
        } else {
            decision
        }
    }

    /// Does `node` count towards the auto-expanded replica count of `index`?
    fn should_auto_expand_to_node(
        &self,
        _index: &IndexMetadata,
        _node: &DiscoveryNode,
        _allocation: &RoutingAllocation<'_>,
    ) -> Decision {
        Decision::ALWAYS
    }
}

/// Ordered decider chain
pub struct AllocationDeciders {
    deciders: Vec<Box<dyn AllocationDecider>>,
}

impl AllocationDeciders {
    pub fn new(deciders: Vec<Box<dyn AllocationDecider>>) -> Self {
        Self { deciders }
    }

    /// The built-in chain
    pub fn with_defaults() -> Self {
        Self::new(vec![
            Box::new(MaxRetryAllocationDecider),
            Box::new(ReplicaAfterPrimaryActiveAllocationDecider),
            Box::new(RebalanceOnlyWhenActiveAllocationDecider),
            Box::new(ClusterRebalanceAllocationDecider),
            Box::new(ConcurrentRebalanceAllocationDecider),
            Box::new(EnableAllocationDecider),
            Box::new(RestoreInProgressAllocationDecider),
            Box::new(SnapshotInProgressAllocationDecider),
            Box::new(FilterAllocationDecider),
            Box::new(SameShardAllocationDecider),
            Box::new(DiskThresholdDecider),
            Box::new(ThrottlingAllocationDecider),
            Box::new(ShardsLimitAllocationDecider),
            Box::new(AwarenessAllocationDecider),
            Box::new(TargetPoolAllocationDecider),
        ])
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.deciders.iter().map(|d| d.name()).collect()
    }

    /// Run `ask` on every decider and fold the verdicts
    ///
    /// Outside debug mode the first NO is returned as is.
    fn fold(
        &self,
        allocation: &RoutingAllocation<'_>,
        ask: impl Fn(&dyn AllocationDecider) -> Decision,
    ) -> Decision {
        let mut combined = Decision::multi();
        for decider in &self.deciders {
            let decision = ask(decider.as_ref());
            if decision.is_no() && !allocation.debug_decision() {
                return decision;
            }
            let keep = match allocation.debug_mode() {
                DebugMode::On => true,
                DebugMode::Off | DebugMode::ExcludeYesDecisions => !decision.is_yes(),
            };
            if keep {
                combined.add(decision);
            }
        }
        combined
    }

    pub fn can_allocate(
        &self,
        shard: &ShardRouting,
        node: &RoutingNode,
        allocation: &RoutingAllocation<'_>,
    ) -> Decision {
        self.fold(allocation, |d| d.can_allocate(shard, node, allocation))
    }

    pub fn can_remain(
        &self,
        shard: &ShardRouting,
        node: &RoutingNode,
        allocation: &RoutingAllocation<'_>,
    ) -> Decision {
        debug_assert!(shard.assigned_to_node(), "can_remain on unassigned {}", shard);
        self.fold(allocation, |d| d.can_remain(shard, node, allocation))
    }

    pub fn can_rebalance_shard(&self, shard: &ShardRouting, allocation: &RoutingAllocation<'_>) -> Decision {
        self.fold(allocation, |d| d.can_rebalance_shard(shard, allocation))
    }

    pub fn can_rebalance(&self, allocation: &RoutingAllocation<'_>) -> Decision {
        self.fold(allocation, |d| d.can_rebalance(allocation))
    }

    pub fn can_force_allocate_primary(
        &self,
        shard: &ShardRouting,
        node: &RoutingNode,
        allocation: &RoutingAllocation<'_>,
    ) -> Decision {
        self.fold(allocation, |d| d.can_force_allocate_primary(shard, node, allocation))
    }

    pub fn should_auto_expand_to_node(
        &self,
        index: &IndexMetadata,
        node: &DiscoveryNode,
        allocation: &RoutingAllocation<'_>,
    ) -> Decision {
        self.fold(allocation, |d| d.should_auto_expand_to_node(index, node, allocation))
    }
}

impl Default for AllocationDeciders {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Small cluster fixtures shared by the decider unit tests

    use chrono::Utc;
    use cluster_core::{
        ClusterSettings, ClusterState, DiscoveryNode, DiscoveryNodes, IndexMetadata,
        IndexMetadataBuilder, Metadata, RoutingTableBuilder,
    };

    pub fn state(nodes: Vec<DiscoveryNode>, indices: Vec<IndexMetadataBuilder>) -> ClusterState {
        state_with_settings(nodes, indices, ClusterSettings::default())
    }

    pub fn state_with_settings(
        nodes: Vec<DiscoveryNode>,
        indices: Vec<IndexMetadataBuilder>,
        settings: ClusterSettings,
    ) -> ClusterState {
        let mut metadata = Metadata::builder().settings(settings);
        let mut routing = RoutingTableBuilder::new();
        for builder in indices {
            let meta: IndexMetadata = builder.build().unwrap();
            routing.add_as_new(&meta, Utc::now()).unwrap();
            metadata = metadata.put(meta);
        }
        let nodes = nodes
            .into_iter()
            .fold(DiscoveryNodes::new(), |acc, n| acc.with_node(n));
        ClusterState::new("test", metadata.build().unwrap(), nodes)
            .builder()
            .routing_table(routing.build())
            .build()
    }

    pub fn node(id: &str) -> DiscoveryNode {
        DiscoveryNode::new(id, format!("{}.local:9300", id))
    }

    pub fn index(name: &str, shards: u32, replicas: u32) -> IndexMetadataBuilder {
        IndexMetadata::builder(name)
            .uuid(format!("{}-uuid", name))
            .number_of_shards(shards)
            .number_of_replicas(replicas)
    }
}

//! Copies of a shard are only rebalanced once every copy of it is active

use cluster_core::ShardRouting;

use super::AllocationDecider;
use crate::allocation::RoutingAllocation;
use crate::decision::Decision;

const NAME: &str = "rebalance_only_when_active";

pub struct RebalanceOnlyWhenActiveAllocationDecider;

impl AllocationDecider for RebalanceOnlyWhenActiveAllocationDecider {
    fn name(&self) -> &'static str {
        NAME
    }

    fn can_rebalance_shard(&self, shard: &ShardRouting, allocation: &RoutingAllocation<'_>) -> Decision {
        let copies = allocation
            .index_metadata(&shard.shard_id)
            .map(|m| m.copies_per_shard() as usize)
            .unwrap_or(0);
        if allocation.routing_nodes.active_copies(&shard.shard_id) < copies {
            return Decision::no(
                NAME,
                "rebalancing is not allowed until all replicas in the cluster are active",
            );
        }
        Decision::yes(NAME, "rebalancing is allowed as all replicas are active in the cluster")
    }
}

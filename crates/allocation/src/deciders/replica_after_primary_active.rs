//! Replicas are only allocated once their primary is active

use cluster_core::ShardRouting;

use super::AllocationDecider;
use crate::allocation::RoutingAllocation;
use crate::decision::Decision;
use crate::routing_nodes::RoutingNode;

const NAME: &str = "replica_after_primary_active";

pub struct ReplicaAfterPrimaryActiveAllocationDecider;

impl AllocationDecider for ReplicaAfterPrimaryActiveAllocationDecider {
    fn name(&self) -> &'static str {
        NAME
    }

    fn can_allocate(&self, shard: &ShardRouting, _node: &RoutingNode, allocation: &RoutingAllocation<'_>) -> Decision {
        if shard.primary {
            return Decision::yes(NAME, "shard is primary and can be allocated");
        }
        if allocation.routing_nodes.active_primary(&shard.shard_id).is_none() {
            return Decision::no(NAME, "primary shard for this replica is not yet active");
        }
        Decision::yes(NAME, "primary shard for this replica is already active")
    }
}

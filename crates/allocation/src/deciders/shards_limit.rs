//! Caps the number of shards per node, per index and cluster-wide

use cluster_core::ShardRouting;

use super::AllocationDecider;
use crate::allocation::RoutingAllocation;
use crate::decision::Decision;
use crate::routing_nodes::RoutingNode;

const NAME: &str = "shards_limit";

pub struct ShardsLimitAllocationDecider;

impl ShardsLimitAllocationDecider {
    /// `allow_equal` is false when allocating (the new copy adds one) and true when remaining
    fn decide(
        &self,
        shard: &ShardRouting,
        node: &RoutingNode,
        allocation: &RoutingAllocation<'_>,
        allow_equal: bool,
    ) -> Decision {
        let over = |count: usize, limit: u32| {
            if allow_equal {
                count > limit as usize
            } else {
                count >= limit as usize
            }
        };

        let index_limit = allocation
            .index_metadata(&shard.shard_id)
            .and_then(|m| m.settings.total_shards_per_node);
        if let Some(limit) = index_limit {
            let count = node.num_shards_for_index(shard.shard_id.index_name());
            if over(count, limit) {
                return Decision::no(
                    NAME,
                    format!(
                        "too many shards [{}] allocated to this node for index [{}], index setting \
                         [total_shards_per_node={}]",
                        count,
                        shard.shard_id.index_name(),
                        limit
                    ),
                );
            }
        }
        if let Some(limit) = allocation.settings().total_shards_per_node {
            let count = node.num_shards();
            if over(count, limit) {
                return Decision::no(
                    NAME,
                    format!(
                        "too many shards [{}] allocated to this node, cluster setting [total_shards_per_node={}]",
                        count, limit
                    ),
                );
            }
        }
        if index_limit.is_none() && allocation.settings().total_shards_per_node.is_none() {
            return Decision::yes(NAME, "total shard limits are disabled");
        }
        Decision::yes(NAME, "the shard count is under index and cluster total shards per node limits")
    }
}

impl AllocationDecider for ShardsLimitAllocationDecider {
    fn name(&self) -> &'static str {
        NAME
    }

    fn can_allocate(&self, shard: &ShardRouting, node: &RoutingNode, allocation: &RoutingAllocation<'_>) -> Decision {
        self.decide(shard, node, allocation, false)
    }

    fn can_remain(&self, shard: &ShardRouting, node: &RoutingNode, allocation: &RoutingAllocation<'_>) -> Decision {
        self.decide(shard, node, allocation, true)
    }
}

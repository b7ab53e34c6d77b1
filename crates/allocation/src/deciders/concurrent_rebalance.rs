//! Caps the number of relocations in flight cluster-wide

use cluster_core::ShardRouting;

use super::AllocationDecider;
use crate::allocation::RoutingAllocation;
use crate::decision::Decision;

const NAME: &str = "concurrent_rebalance";

pub struct ConcurrentRebalanceAllocationDecider;

impl AllocationDecider for ConcurrentRebalanceAllocationDecider {
    fn name(&self) -> &'static str {
        NAME
    }

    fn can_rebalance_shard(&self, _shard: &ShardRouting, allocation: &RoutingAllocation<'_>) -> Decision {
        self.can_rebalance(allocation)
    }

    fn can_rebalance(&self, allocation: &RoutingAllocation<'_>) -> Decision {
        let limit = allocation.settings().cluster_concurrent_rebalance;
        if limit < 0 {
            return Decision::yes(NAME, "unlimited concurrent rebalances are allowed");
        }
        let relocating = allocation.routing_nodes.relocating_shards();
        if relocating >= limit as usize {
            return Decision::throttle(
                NAME,
                format!(
                    "reached the limit of concurrently rebalancing shards [{}], cluster setting \
                     [cluster_concurrent_rebalance={}]",
                    relocating, limit
                ),
            );
        }
        Decision::yes(
            NAME,
            format!(
                "below threshold [{}] for concurrent rebalances, current rebalance shard count [{}]",
                limit, relocating
            ),
        )
    }
}

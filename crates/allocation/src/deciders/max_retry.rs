//! Stops automatic retries of shards that keep failing, and backs off between attempts

use cluster_core::ShardRouting;

use super::AllocationDecider;
use crate::allocation::RoutingAllocation;
use crate::decision::Decision;
use crate::routing_nodes::RoutingNode;

const NAME: &str = "max_retry";

pub struct MaxRetryAllocationDecider;

impl MaxRetryAllocationDecider {
    fn decide(&self, shard: &ShardRouting, allocation: &RoutingAllocation<'_>) -> Decision {
        let Some(info) = &shard.unassigned_info else {
            return Decision::yes(NAME, "shard has no previous failures");
        };
        let settings = allocation.settings();
        if info.failed_allocations >= settings.max_retries {
            return Decision::no(
                NAME,
                format!(
                    "shard has exceeded the maximum number of retries [{}] on failed allocation attempts - \
                     manually call [/api/v1/reroute?retry_failed=true] to retry, [unassigned_info[{}]]",
                    settings.max_retries,
                    info.short_summary()
                ),
            );
        }
        if info.failed_allocations > 0 {
            let retry_at = info.retry_at(settings.retry_delay_base_ms, settings.retry_delay_max_ms);
            if allocation.current_time() < retry_at {
                return Decision::throttle(
                    NAME,
                    format!(
                        "shard failed [{}] times, backing off until [{}]",
                        info.failed_allocations,
                        retry_at.to_rfc3339()
                    ),
                );
            }
        }
        Decision::yes(
            NAME,
            format!(
                "shard has failed allocating [{}] times but [{}] retries are allowed",
                info.failed_allocations, settings.max_retries
            ),
        )
    }
}

impl AllocationDecider for MaxRetryAllocationDecider {
    fn name(&self) -> &'static str {
        NAME
    }

    fn can_allocate(&self, shard: &ShardRouting, _node: &RoutingNode, allocation: &RoutingAllocation<'_>) -> Decision {
        self.decide(shard, allocation)
    }

    fn can_force_allocate_primary(
        &self,
        shard: &ShardRouting,
        _node: &RoutingNode,
        allocation: &RoutingAllocation<'_>,
    ) -> Decision {
        self.decide(shard, allocation)
    }
}

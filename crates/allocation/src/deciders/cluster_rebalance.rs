//! Gates rebalancing on the activity of the cluster's shards (`allow_rebalance`)

use cluster_core::{ClusterRebalanceType, ShardRouting};

use super::AllocationDecider;
use crate::allocation::RoutingAllocation;
use crate::decision::Decision;

const NAME: &str = "cluster_rebalance";

pub struct ClusterRebalanceAllocationDecider;

impl AllocationDecider for ClusterRebalanceAllocationDecider {
    fn name(&self) -> &'static str {
        NAME
    }

    fn can_rebalance_shard(&self, _shard: &ShardRouting, allocation: &RoutingAllocation<'_>) -> Decision {
        self.can_rebalance(allocation)
    }

    fn can_rebalance(&self, allocation: &RoutingAllocation<'_>) -> Decision {
        let nodes = &allocation.routing_nodes;
        match allocation.settings().allow_rebalance {
            ClusterRebalanceType::Always => {
                Decision::yes(NAME, "all shards are always allowed to be rebalanced")
            }
            ClusterRebalanceType::IndicesPrimariesActive => {
                if nodes.has_unassigned_primaries() {
                    return Decision::no(
                        NAME,
                        "the cluster has unassigned primary shards and cluster setting \
                         [allow_rebalance] is set to [indices_primaries_active]",
                    );
                }
                if nodes.has_inactive_primaries() {
                    return Decision::no(
                        NAME,
                        "the cluster has inactive primary shards and cluster setting \
                         [allow_rebalance] is set to [indices_primaries_active]",
                    );
                }
                Decision::yes(NAME, "all primary shards are active")
            }
            ClusterRebalanceType::IndicesAllActive => {
                if nodes.has_unassigned_shards() {
                    return Decision::no(
                        NAME,
                        "the cluster has unassigned shards and cluster setting \
                         [allow_rebalance] is set to [indices_all_active]",
                    );
                }
                if nodes.has_inactive_shards() {
                    return Decision::no(
                        NAME,
                        "the cluster has inactive shards and cluster setting \
                         [allow_rebalance] is set to [indices_all_active]",
                    );
                }
                Decision::yes(NAME, "all shards are active")
            }
        }
    }
}

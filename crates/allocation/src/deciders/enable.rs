//! Cluster-wide switches for allocation (`enable`) and rebalancing (`rebalance_enable`)
//!
//! Manual allocation commands bypass the allocation switch.

use cluster_core::{EnableAllocation, EnableRebalance, RecoverySource, ShardRouting};

use super::AllocationDecider;
use crate::allocation::RoutingAllocation;
use crate::decision::Decision;
use crate::routing_nodes::RoutingNode;

const NAME: &str = "enable";

pub struct EnableAllocationDecider;

impl AllocationDecider for EnableAllocationDecider {
    fn name(&self) -> &'static str {
        NAME
    }

    fn can_allocate(&self, shard: &ShardRouting, _node: &RoutingNode, allocation: &RoutingAllocation<'_>) -> Decision {
        if allocation.ignore_disable() {
            return Decision::yes(NAME, "explicitly ignoring any disabling of allocation due to manual allocation commands");
        }
        match allocation.settings().enable {
            EnableAllocation::All => Decision::yes(NAME, "all allocations are allowed"),
            EnableAllocation::None => {
                Decision::no(NAME, "no allocations are allowed due to cluster setting [enable=none]")
            }
            EnableAllocation::NewPrimaries => {
                let new_primary = shard.primary
                    && !shard.active()
                    && !matches!(shard.recovery_source, Some(RecoverySource::ExistingStore { .. }));
                if new_primary {
                    Decision::yes(NAME, "new primary allocations are allowed")
                } else {
                    Decision::no(
                        NAME,
                        "non-new primary allocations are forbidden due to cluster setting [enable=new_primaries]",
                    )
                }
            }
            EnableAllocation::Primaries => {
                if shard.primary {
                    Decision::yes(NAME, "primary allocations are allowed")
                } else {
                    Decision::no(
                        NAME,
                        "replica allocations are forbidden due to cluster setting [enable=primaries]",
                    )
                }
            }
        }
    }

    fn can_rebalance_shard(&self, shard: &ShardRouting, allocation: &RoutingAllocation<'_>) -> Decision {
        match allocation.settings().rebalance_enable {
            EnableRebalance::All => Decision::yes(NAME, "all rebalancing is allowed"),
            EnableRebalance::None => {
                Decision::no(NAME, "no rebalancing is allowed due to cluster setting [rebalance_enable=none]")
            }
            EnableRebalance::Primaries if shard.primary => {
                Decision::yes(NAME, "primary rebalancing is allowed")
            }
            EnableRebalance::Primaries => Decision::no(
                NAME,
                "replica rebalancing is forbidden due to cluster setting [rebalance_enable=primaries]",
            ),
            EnableRebalance::Replicas if !shard.primary => {
                Decision::yes(NAME, "replica rebalancing is allowed")
            }
            EnableRebalance::Replicas => Decision::no(
                NAME,
                "primary rebalancing is forbidden due to cluster setting [rebalance_enable=replicas]",
            ),
        }
    }

    fn can_rebalance(&self, allocation: &RoutingAllocation<'_>) -> Decision {
        if allocation.settings().rebalance_enable == EnableRebalance::None {
            return Decision::no(NAME, "no rebalancing is allowed due to cluster setting [rebalance_enable=none]");
        }
        Decision::yes(NAME, "rebalancing is not globally disabled")
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::deciders::AllocationDeciders;
    use crate::info::{ClusterInfo, SnapshotsInfo};
    use chrono::Utc;
    use cluster_core::ClusterSettings;

    #[test]
    fn test_primaries_only() {
        let mut settings = ClusterSettings::default();
        settings.allocation.enable = EnableAllocation::Primaries;
        let state = state_with_settings(vec![node("n1")], vec![index("logs", 1, 1)], settings);
        let deciders = AllocationDeciders::with_defaults();
        let mut allocation =
            RoutingAllocation::new(&deciders, &state, ClusterInfo::default(), SnapshotsInfo::default(), Utc::now());
        let node = allocation.routing_nodes.node("n1").unwrap().clone();
        let primary = allocation.routing_nodes.unassigned().iter().find(|s| s.primary).unwrap().clone();
        let replica = allocation.routing_nodes.unassigned().iter().find(|s| !s.primary).unwrap().clone();

        let decider = EnableAllocationDecider;
        assert!(decider.can_allocate(&primary, &node, &allocation).is_yes());
        assert!(decider.can_allocate(&replica, &node, &allocation).is_no());

        allocation.set_ignore_disable(true);
        assert!(decider.can_allocate(&replica, &node, &allocation).is_yes());
    }
}

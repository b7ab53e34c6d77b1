//! Limits concurrent recoveries per node
//!
//! Primaries recovering from a store count against `node_initial_primaries_recoveries`;
//! peer recoveries count against the incoming limit of the target and the outgoing
//! limit of the node they read from.

use cluster_core::ShardRouting;

use super::AllocationDecider;
use crate::allocation::RoutingAllocation;
use crate::decision::Decision;
use crate::routing_nodes::RoutingNode;

const NAME: &str = "throttling";

pub struct ThrottlingAllocationDecider;

impl AllocationDecider for ThrottlingAllocationDecider {
    fn name(&self) -> &'static str {
        NAME
    }

    fn can_allocate(&self, shard: &ShardRouting, node: &RoutingNode, allocation: &RoutingAllocation<'_>) -> Decision {
        let settings = allocation.settings();
        let nodes = &allocation.routing_nodes;

        if shard.primary && shard.unassigned() {
            let recoveries = nodes.initial_primaries_recoveries(node.node_id());
            if recoveries >= settings.node_initial_primaries_recoveries as usize {
                return Decision::throttle(
                    NAME,
                    format!(
                        "reached the limit of ongoing initial primary recoveries [{}], cluster setting \
                         [node_initial_primaries_recoveries={}]",
                        recoveries, settings.node_initial_primaries_recoveries
                    ),
                );
            }
            return Decision::yes(
                NAME,
                format!("below primary recovery limit of [{}]", settings.node_initial_primaries_recoveries),
            );
        }

        let incoming = nodes.incoming_recoveries(node.node_id());
        if incoming >= settings.node_concurrent_incoming_recoveries as usize {
            return Decision::throttle(
                NAME,
                format!(
                    "reached the limit of incoming shard recoveries [{}], cluster setting \
                     [node_concurrent_incoming_recoveries={}]",
                    incoming, settings.node_concurrent_incoming_recoveries
                ),
            );
        }

        // Peer recoveries read from the relocation source or from the active primary
        let source_node = if shard.assigned_to_node() {
            shard.node_id().map(str::to_string)
        } else {
            nodes
                .active_primary(&shard.shard_id)
                .and_then(|p| p.node_id())
                .map(str::to_string)
        };
        if let Some(source_node) = source_node {
            let outgoing = nodes.outgoing_recoveries(&source_node);
            if outgoing >= settings.node_concurrent_outgoing_recoveries as usize {
                return Decision::throttle(
                    NAME,
                    format!(
                        "reached the limit of outgoing shard recoveries [{}] on the node [{}] which holds the \
                         source copy, cluster setting [node_concurrent_outgoing_recoveries={}]",
                        outgoing, source_node, settings.node_concurrent_outgoing_recoveries
                    ),
                );
            }
        }
        Decision::yes(NAME, "below shard recovery limit of outgoing and incoming recoveries")
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
    fn test_initial_primaries_throttled() {
        let mut settings = ClusterSettings::default();
        settings.allocation.node_initial_primaries_recoveries = 1;
        let state = state_with_settings(vec![node("n1")], vec![index("logs", 2, 0)], settings);
        let deciders = AllocationDeciders::with_defaults();
        let mut allocation =
            RoutingAllocation::new(&deciders, &state, ClusterInfo::default(), SnapshotsInfo::default(), Utc::now());
        let first = allocation.routing_nodes.take_unassigned(|s| s.shard_id.id == 0).unwrap();
        let mut changes = std::mem::take(&mut allocation.changes);
        allocation.routing_nodes.initialize_shard(&first, "n1", None, None, &mut changes);

        let second = allocation.routing_nodes.unassigned()[0].clone();
        let node = allocation.routing_nodes.node("n1").unwrap();
        let decision = ThrottlingAllocationDecider.can_allocate(&second, node, &allocation);
        assert!(decision.is_throttle());
        // throttling survives the force path
        assert!(ThrottlingAllocationDecider
            .can_force_allocate_primary(&second, node, &allocation)
            .is_throttle());
    }
}

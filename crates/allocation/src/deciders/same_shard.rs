//! Never two copies of one shard on the same node (or host, with `same_shard_host`)

use cluster_core::ShardRouting;

use super::AllocationDecider;
use crate::allocation::RoutingAllocation;
use crate::decision::Decision;
use crate::routing_nodes::RoutingNode;

const NAME: &str = "same_shard";

pub struct SameShardAllocationDecider;

impl AllocationDecider for SameShardAllocationDecider {
    fn name(&self) -> &'static str {
        NAME
    }

    fn can_allocate(&self, shard: &ShardRouting, node: &RoutingNode, allocation: &RoutingAllocation<'_>) -> Decision {
        if let Some(existing) = node.get(&shard.shard_id) {
            return Decision::no(
                NAME,
                format!(
                    "a copy of this shard is already allocated to this node [{}]",
                    existing
                ),
            );
        }
        if allocation.settings().same_shard_host {
            let Some(target) = allocation.nodes().get(node.node_id()) else {
                return Decision::yes(NAME, "this node does not hold a copy of this shard");
            };
            for other in allocation.nodes().data_nodes() {
                if other.id == target.id || other.host() != target.host() {
                    continue;
                }
                let holds_copy = allocation
                    .routing_nodes
                    .node(&other.id)
                    .and_then(|n| n.get(&shard.shard_id))
                    .is_some();
                if holds_copy {
                    return Decision::no(
                        NAME,
                        format!(
                            "a copy of this shard is already allocated to host [{}], on node [{}], and \
                             [same_shard_host] is [true] which forbids more than one node on this host from \
                             holding a copy of this shard",
                            target.host(),
                            other.id
                        ),
                    );
                }
            }
        }
        Decision::yes(NAME, "this node does not hold a copy of this shard")
    }

    fn can_force_allocate_primary(
        &self,
        shard: &ShardRouting,
        node: &RoutingNode,
        allocation: &RoutingAllocation<'_>,
    ) -> Decision {
        self.can_allocate(shard, node, allocation)
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
    fn test_same_host_rejected_when_enabled() {
        let mut settings = ClusterSettings::default();
        settings.allocation.same_shard_host = true;
        let state = state_with_settings(
            vec![
                node("n1").with_attribute("host", "box-1"),
                node("n2").with_attribute("host", "box-1"),
                node("n3").with_attribute("host", "box-2"),
            ],
            vec![index("logs", 1, 1)],
            settings,
        );
        let deciders = AllocationDeciders::with_defaults();
        let mut allocation =
            RoutingAllocation::new(&deciders, &state, ClusterInfo::default(), SnapshotsInfo::default(), Utc::now());
        let primary = allocation.routing_nodes.take_unassigned(|s| s.primary).unwrap();
        let mut changes = std::mem::take(&mut allocation.changes);
        allocation
            .routing_nodes
            .initialize_shard(&primary, "n1", None, None, &mut changes);
        let replica = allocation.routing_nodes.unassigned()[0].clone();

        let decider = SameShardAllocationDecider;
        let on = |id: &str| decider.can_allocate(&replica, allocation.routing_nodes.node(id).unwrap(), &allocation);
        assert!(on("n1").is_no());
        assert!(on("n2").is_no());
        assert!(on("n3").is_yes());
    }
}

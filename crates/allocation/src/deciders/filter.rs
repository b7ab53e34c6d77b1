//! Index and cluster `require` / `include` / `exclude` node filters

use cluster_core::{DiscoveryNode, IndexMetadata, ShardRouting};

use super::AllocationDecider;
use crate::allocation::RoutingAllocation;
use crate::decision::Decision;
use crate::routing_nodes::RoutingNode;

const NAME: &str = "filter";

pub struct FilterAllocationDecider;

impl FilterAllocationDecider {
    fn check(&self, index: Option<&IndexMetadata>, node: &DiscoveryNode, allocation: &RoutingAllocation<'_>) -> Decision {
        if let Some(index) = index {
            if let Some(violation) = index.settings.filters.violation(node) {
                return Decision::no(NAME, format!("{} (index setting [routing.allocation])", violation));
            }
        }
        if let Some(violation) = allocation.settings().filters.violation(node) {
            return Decision::no(NAME, format!("{} (cluster setting [routing.allocation])", violation));
        }
        Decision::yes(NAME, "node passes include/exclude/require filters")
    }

    fn check_routing_node(
        &self,
        shard: &ShardRouting,
        node: &RoutingNode,
        allocation: &RoutingAllocation<'_>,
    ) -> Decision {
        let Some(discovery_node) = allocation.nodes().get(node.node_id()) else {
            return Decision::no(NAME, format!("node [{}] is not part of the cluster", node.node_id()));
        };
        self.check(allocation.index_metadata(&shard.shard_id), discovery_node, allocation)
    }
}

impl AllocationDecider for FilterAllocationDecider {
    fn name(&self) -> &'static str {
        NAME
    }

    fn can_allocate(&self, shard: &ShardRouting, node: &RoutingNode, allocation: &RoutingAllocation<'_>) -> Decision {
        self.check_routing_node(shard, node, allocation)
    }

    fn can_remain(&self, shard: &ShardRouting, node: &RoutingNode, allocation: &RoutingAllocation<'_>) -> Decision {
        self.check_routing_node(shard, node, allocation)
    }

    fn can_force_allocate_primary(
        &self,
        shard: &ShardRouting,
        node: &RoutingNode,
        allocation: &RoutingAllocation<'_>,
    ) -> Decision {
        self.check_routing_node(shard, node, allocation)
    }

    fn should_auto_expand_to_node(
        &self,
        index: &IndexMetadata,
        node: &DiscoveryNode,
        allocation: &RoutingAllocation<'_>,
    ) -> Decision {
        self.check(Some(index), node, allocation)
    }
}

//! Shards of locally stored indices need data nodes; remote-backed ones need search nodes

use cluster_core::{DiscoveryNode, IndexMetadata, ShardRouting, StorePool};

use super::AllocationDecider;
use crate::allocation::RoutingAllocation;
use crate::decision::Decision;
use crate::routing_nodes::RoutingNode;

const NAME: &str = "target_pool";

pub struct TargetPoolAllocationDecider;

impl TargetPoolAllocationDecider {
    fn check(&self, pool: StorePool, node: &DiscoveryNode) -> Decision {
        let fits = match pool {
            StorePool::Local => node.is_data_node(),
            StorePool::Remote => node.is_search_node(),
        };
        if fits {
            Decision::yes(
                NAME,
                format!("routing pool [{}] of the shard matches node [{}]", pool, node.id),
            )
        } else {
            Decision::no(
                NAME,
                format!(
                    "routing pool [{}] of the shard does not match the roles of node [{}]",
                    pool, node.id
                ),
            )
        }
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
        let pool = allocation
            .index_metadata(&shard.shard_id)
            .map(|m| m.settings.store_pool)
            .unwrap_or_default();
        self.check(pool, discovery_node)
    }
}

impl AllocationDecider for TargetPoolAllocationDecider {
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
        _allocation: &RoutingAllocation<'_>,
    ) -> Decision {
        self.check(index.settings.store_pool, node)
    }
}

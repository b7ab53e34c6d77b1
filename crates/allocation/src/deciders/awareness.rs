//! Spreads the copies of a shard across the values of awareness attributes (zones, racks)
//!
//! With `force` values configured, values without nodes still count, so a lost zone does
//! not get its copies piled onto the remaining ones.

use cluster_core::ShardRouting;
use std::collections::{BTreeMap, BTreeSet};

use super::AllocationDecider;
use crate::allocation::RoutingAllocation;
use crate::decision::Decision;
use crate::routing_nodes::RoutingNode;

const NAME: &str = "awareness";

pub struct AwarenessAllocationDecider;

impl AwarenessAllocationDecider {
    fn under_capacity(
        &self,
        shard: &ShardRouting,
        node: &RoutingNode,
        allocation: &RoutingAllocation<'_>,
        move_to_node: bool,
    ) -> Decision {
        let awareness = &allocation.settings().awareness;
        if awareness.attributes.is_empty() {
            return Decision::yes(NAME, "allocation awareness is not enabled, set cluster setting [awareness.attributes] to enable it");
        }
        let Some(index) = allocation.index_metadata(&shard.shard_id) else {
            return Decision::yes(NAME, "index is unknown");
        };
        let Some(target) = allocation.nodes().get(node.node_id()) else {
            return Decision::no(NAME, format!("node [{}] is not part of the cluster", node.node_id()));
        };
        let shard_count = index.copies_per_shard() as usize;

        for attribute in &awareness.attributes {
            let Some(target_value) = target.attributes.get(attribute) else {
                return Decision::no(
                    NAME,
                    format!(
                        "node does not contain the awareness attribute [{}]; required attributes cluster setting \
                         [awareness.attributes={}]",
                        attribute,
                        awareness.attributes.join(",")
                    ),
                );
            };

            // copies per attribute value; relocation sources are represented by their target
            let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
            for copy in allocation.routing_nodes.assigned_shards(&shard.shard_id) {
                if copy.relocating() {
                    continue;
                }
                if move_to_node && copy.is_same_allocation(shard) {
                    continue;
                }
                let value = copy
                    .node_id()
                    .and_then(|id| allocation.nodes().get(id))
                    .and_then(|n| n.attributes.get(attribute));
                if let Some(value) = value {
                    *counts.entry(value.as_str()).or_default() += 1;
                }
            }
            if move_to_node {
                *counts.entry(target_value.as_str()).or_default() += 1;
            }

            let mut values: BTreeSet<&str> = allocation
                .nodes()
                .data_nodes()
                .filter_map(|n| n.attributes.get(attribute).map(String::as_str))
                .collect();
            if let Some(forced) = awareness.force.get(attribute) {
                values.extend(forced.iter().map(String::as_str));
            }
            let value_count = values.len().max(1);

            let average = shard_count / value_count;
            let leftover = shard_count % value_count;
            let required = if average == 0 {
                1
            } else if leftover == 0 {
                average
            } else {
                average + 1
            };
            let current = counts.get(target_value.as_str()).copied().unwrap_or(0);
            if current > required {
                return Decision::no(
                    NAME,
                    format!(
                        "there are too many copies of the shard allocated to nodes with attribute [{}], there are \
                         [{}] total configured shard copies for this shard id and [{}] total attribute values, \
                         expected the allocated shard count per attribute [{}] to be less than or equal to the \
                         upper bound of the required number of shards per attribute [{}]",
                        attribute, shard_count, value_count, current, required
                    ),
                );
            }
        }
        Decision::yes(NAME, "node meets all awareness attribute requirements")
    }
}

impl AllocationDecider for AwarenessAllocationDecider {
    fn name(&self) -> &'static str {
        NAME
    }

    fn can_allocate(&self, shard: &ShardRouting, node: &RoutingNode, allocation: &RoutingAllocation<'_>) -> Decision {
        self.under_capacity(shard, node, allocation, true)
    }

    fn can_remain(&self, shard: &ShardRouting, node: &RoutingNode, allocation: &RoutingAllocation<'_>) -> Decision {
        self.under_capacity(shard, node, allocation, false)
    }
}

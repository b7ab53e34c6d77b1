//! A primary being snapshotted stays on the node the snapshot reads from

use cluster_core::ShardRouting;

use super::AllocationDecider;
use crate::allocation::RoutingAllocation;
use crate::decision::Decision;
use crate::routing_nodes::RoutingNode;

const NAME: &str = "snapshot_in_progress";

pub struct SnapshotInProgressAllocationDecider;

impl AllocationDecider for SnapshotInProgressAllocationDecider {
    fn name(&self) -> &'static str {
        NAME
    }

    fn can_allocate(&self, shard: &ShardRouting, _node: &RoutingNode, allocation: &RoutingAllocation<'_>) -> Decision {
        if !shard.primary {
            return Decision::yes(NAME, "the shard is not being snapshotted");
        }
        let Some(current_node) = shard.node_id() else {
            return Decision::yes(NAME, "the shard is not being snapshotted");
        };
        if allocation.snapshots_info().is_snapshotting(&shard.shard_id, current_node) {
            return Decision::throttle(
                NAME,
                format!(
                    "waiting for snapshotting of shard [{}] to complete on this node [{}]",
                    shard.shard_id, current_node
                ),
            );
        }
        Decision::yes(NAME, "the shard is not being snapshotted")
    }
}

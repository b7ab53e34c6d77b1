//! Primaries recovering from a snapshot need a restore that is still running

use cluster_core::{RecoverySource, ShardRouting};

use super::AllocationDecider;
use crate::allocation::RoutingAllocation;
use crate::decision::Decision;
use crate::info::RestoreShardState;
use crate::routing_nodes::RoutingNode;

const NAME: &str = "restore_in_progress";

pub struct RestoreInProgressAllocationDecider;

impl AllocationDecider for RestoreInProgressAllocationDecider {
    fn name(&self) -> &'static str {
        NAME
    }

    fn can_allocate(&self, shard: &ShardRouting, _node: &RoutingNode, allocation: &RoutingAllocation<'_>) -> Decision {
        let Some(RecoverySource::Snapshot { repository, snapshot }) = &shard.recovery_source else {
            return Decision::yes(NAME, "ignored as shard is not being recovered from a snapshot");
        };
        if !shard.primary || shard.active() {
            return Decision::yes(NAME, "ignored as shard is not being recovered from a snapshot");
        }
        match allocation.snapshots_info().restore_state(&shard.shard_id) {
            Some(RestoreShardState::Init) | Some(RestoreShardState::Started) => {
                Decision::yes(NAME, "shard is currently being restored")
            }
            Some(state) => Decision::no(
                NAME,
                format!(
                    "shard restore from snapshot [{}:{}] ended as [{:?}] - manually close or delete the index \
                     {} in order to retry to restore the snapshot again or use the reroute API to force the \
                     allocation of an empty primary shard",
                    repository,
                    snapshot,
                    state,
                    shard.shard_id.index
                ),
            ),
            None => Decision::no(
                NAME,
                format!(
                    "shard has no restore in progress for snapshot [{}:{}] - manually close or delete the index {}",
                    repository, snapshot, shard.shard_id.index
                ),
            ),
        }
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

//! Disk watermarks
//!
//! Past the low watermark no new shards go to a node (except never-allocated primaries
//! while below high); past the high watermark shards are moved away. Incoming
//! relocations count against the free space of their target, outgoing ones are only
//! credited when deciding whether a shard may remain.

use cluster_core::{DiskThresholdSettings, RecoverySource, ShardRouting};

use super::AllocationDecider;
use crate::allocation::RoutingAllocation;
use crate::decision::Decision;
use crate::info::DiskUsage;
use crate::routing_nodes::RoutingNode;

const NAME: &str = "disk_threshold";

pub struct DiskThresholdDecider;

impl DiskThresholdDecider {
    /// Disk usage of `node` adjusted for relocations in flight
    fn usage(
        &self,
        node: &RoutingNode,
        allocation: &RoutingAllocation<'_>,
        subtract_leaving_shards: bool,
    ) -> Option<DiskUsage> {
        let usage = *allocation.cluster_info().disk_usage(node.node_id())?;
        let settings = &allocation.settings().disk;
        if !settings.include_relocations {
            return Some(usage);
        }
        let mut free = usage.free_bytes as i128;
        for shard in node.iter() {
            if shard.is_relocation_target() {
                free -= allocation.cluster_info().shard_size_or(shard, 0) as i128;
            } else if subtract_leaving_shards && shard.relocating() {
                free += allocation.cluster_info().shard_size_or(shard, 0) as i128;
            }
        }
        let free = free.clamp(0, usage.total_bytes as i128) as u64;
        Some(DiskUsage::new(usage.total_bytes, free))
    }

    fn disabled(settings: &DiskThresholdSettings) -> Option<Decision> {
        if settings.enabled {
            None
        } else {
            Some(Decision::yes(NAME, "the disk threshold decider is disabled"))
        }
    }
}

impl AllocationDecider for DiskThresholdDecider {
    fn name(&self) -> &'static str {
        NAME
    }

    fn can_allocate(&self, shard: &ShardRouting, node: &RoutingNode, allocation: &RoutingAllocation<'_>) -> Decision {
        let settings = &allocation.settings().disk;
        if let Some(decision) = Self::disabled(settings) {
            return decision;
        }
        let Some(usage) = self.usage(node, allocation, false) else {
            return Decision::yes(NAME, "no disk usage information is available for this node");
        };
        let total = usage.total_bytes;
        let free = usage.free_bytes;

        if settings.low.exceeded(free, total) {
            let never_allocated = shard.primary
                && shard.unassigned()
                && shard.recovery_source == Some(RecoverySource::EmptyStore);
            if !never_allocated {
                return Decision::no(
                    NAME,
                    format!(
                        "the node is above the low watermark cluster setting [disk.low={}], having less than \
                         the minimum required [{}b] free space, actual free: [{}b]",
                        settings.low,
                        settings.low.min_free_bytes(total),
                        free
                    ),
                );
            }
            if settings.high.exceeded(free, total) {
                return Decision::no(
                    NAME,
                    format!(
                        "the node is above the high watermark cluster setting [disk.high={}], having less than \
                         the minimum required [{}b] free space, actual free: [{}b]",
                        settings.high,
                        settings.high.min_free_bytes(total),
                        free
                    ),
                );
            }
            return Decision::yes(
                NAME,
                "the node is above the low watermark, but less than the high watermark, and this primary shard \
                 has never been allocated before",
            );
        }

        let shard_size = allocation.cluster_info().shard_size_or(shard, 0);
        let free_after = free.saturating_sub(shard_size);
        if settings.high.exceeded(free_after, total) {
            return Decision::no(
                NAME,
                format!(
                    "allocating the shard to this node will bring the node above the high watermark cluster \
                     setting [disk.high={}] and cause it to have less than the minimum required [{}b] of free \
                     space (free: [{}b], estimated shard size: [{}b])",
                    settings.high,
                    settings.high.min_free_bytes(total),
                    free,
                    shard_size
                ),
            );
        }
        Decision::yes(
            NAME,
            format!(
                "enough disk for shard on node, free: [{}b], shard size: [{}b], free after allocating shard: [{}b]",
                free, shard_size, free_after
            ),
        )
    }

    fn can_remain(&self, _shard: &ShardRouting, node: &RoutingNode, allocation: &RoutingAllocation<'_>) -> Decision {
        let settings = &allocation.settings().disk;
        if let Some(decision) = Self::disabled(settings) {
            return decision;
        }
        let Some(usage) = self.usage(node, allocation, true) else {
            return Decision::yes(NAME, "no disk usage information is available for this node");
        };
        if settings.high.exceeded(usage.free_bytes, usage.total_bytes) {
            return Decision::no(
                NAME,
                format!(
                    "the shard cannot remain on this node because it is above the high watermark cluster setting \
                     [disk.high={}] and there is less than the required [{}b] free space on node, actual free: [{}b]",
                    settings.high,
                    settings.high.min_free_bytes(usage.total_bytes),
                    usage.free_bytes
                ),
            );
        }
        Decision::yes(NAME, "there is enough disk on this node for the shard to remain")
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::deciders::AllocationDeciders;
    use crate::info::{ClusterInfo, SnapshotsInfo};
    use chrono::Utc;
    use std::collections::BTreeMap;

    const GB: u64 = 1 << 30;

    fn info(usages: &[(&str, u64)]) -> ClusterInfo {
        ClusterInfo {
            disk_usages: usages
                .iter()
                .map(|(id, free)| (id.to_string(), DiskUsage::new(100 * GB, *free)))
                .collect(),
            shard_sizes: BTreeMap::new(),
        }
    }

    #[test]
    fn test_low_and_high_watermarks() {
        let state = state(vec![node("n1"), node("n2"), node("n3")], vec![index("logs", 1, 1)]);
        let deciders = AllocationDeciders::with_defaults();
        // n1: 50% used, n2: 88% used (past low), n3: 93% used (past high)
        let allocation = RoutingAllocation::new(
            &deciders,
            &state,
            info(&[("n1", 50 * GB), ("n2", 12 * GB), ("n3", 7 * GB)]),
            SnapshotsInfo::default(),
            Utc::now(),
        );
        let primary = allocation.routing_nodes.unassigned().iter().find(|s| s.primary).unwrap().clone();
        let replica = allocation.routing_nodes.unassigned().iter().find(|s| !s.primary).unwrap().clone();
        let decider = DiskThresholdDecider;
        let on = |shard: &ShardRouting, id: &str| {
            decider.can_allocate(shard, allocation.routing_nodes.node(id).unwrap(), &allocation)
        };

        assert!(on(&replica, "n1").is_yes());
        assert!(on(&replica, "n2").is_no());
        // a brand new primary may still go past low
        assert!(on(&primary, "n2").is_yes());
        assert!(on(&primary, "n3").is_no());
    }

    #[test]
    fn test_missing_usage_is_yes() {
        let state = state(vec![node("n1")], vec![index("logs", 1, 0)]);
        let deciders = AllocationDeciders::with_defaults();
        let allocation =
            RoutingAllocation::new(&deciders, &state, ClusterInfo::default(), SnapshotsInfo::default(), Utc::now());
        let shard = allocation.routing_nodes.unassigned()[0].clone();
        let node = allocation.routing_nodes.node("n1").unwrap();
        assert!(DiskThresholdDecider.can_allocate(&shard, node, &allocation).is_yes());
    }
}

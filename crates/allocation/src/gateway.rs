//! Gateway allocator
//!
//! Runs before the balanced allocator. Primaries that existed before (recovery from an
//! existing store) are placed on the node holding the freshest in-sync copy. Replicas
//! prefer nodes that already hold an in-sync copy, and replicas whose node left recently
//! wait for it to come back.

use cluster_core::{AllocationStatus, DiscoveryNodes, NodeId, RecoverySource, ShardId, ShardRouting};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::sync::Arc;
use tracing::{debug, info, trace};

use crate::allocation::RoutingAllocation;
use crate::allocator::{AllocateUnassignedDecision, AllocationDecision, NodeAllocationResult};
use crate::decision::Decision;

/// Persisted state of one shard copy on one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeShardState {
    pub node_id: NodeId,
    /// None when the node holds no copy
    pub allocation_id: Option<String>,
    #[serde(default)]
    pub primary: bool,
    /// Primary term the copy last operated under
    #[serde(default)]
    pub primary_term: u64,
    /// Highest sequence number of the copy
    #[serde(default)]
    pub max_seq_no: i64,
    /// The copy exists but could not be opened
    #[serde(default)]
    pub store_error: Option<String>,
}

impl NodeShardState {
    fn usable(&self) -> bool {
        self.allocation_id.is_some() && self.store_error.is_none()
    }
}

/// Result of asking the nodes for their copies of a shard
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchResult {
    /// Answers are still being collected; ask again on a later pass
    Fetching,
    Data(Vec<NodeShardState>),
}

/// Source of persisted shard states; must not block
pub trait ShardStateFetcher: Send + Sync {
    fn fetch(&self, shard_id: &ShardId, nodes: &DiscoveryNodes) -> FetchResult;
}

/// Knows of no copies anywhere
#[derive(Debug, Clone, Copy, Default)]
pub struct NoShardStates;

impl ShardStateFetcher for NoShardStates {
    fn fetch(&self, _shard_id: &ShardId, _nodes: &DiscoveryNodes) -> FetchResult {
        FetchResult::Data(Vec::new())
    }
}

/// Chosen primary copy
struct PrimaryChoice {
    decision: AllocateUnassignedDecision,
    /// The copy was primary under the current term and is in sync
    keeps_term: bool,
}

pub struct GatewayAllocator {
    fetcher: Arc<dyn ShardStateFetcher>,
}

impl GatewayAllocator {
    pub fn new(fetcher: Arc<dyn ShardStateFetcher>) -> Self {
        Self { fetcher }
    }

    /// Place existing primaries and matching replicas; everything else goes back to the queue
    pub fn allocate_unassigned(&self, allocation: &mut RoutingAllocation<'_>) {
        let shards = allocation.routing_nodes.drain_unassigned();
        let (primaries, replicas): (Vec<_>, Vec<_>) = shards.into_iter().partition(|s| s.primary);
        let mut remaining = Vec::new();

        for shard in primaries {
            if !recovers_from_existing_store(&shard) {
                remaining.push(shard);
                continue;
            }
            let choice = self.decide_primary(&shard, allocation);
            if choice.decision.is_yes() && choice.keeps_term {
                allocation.changes.retain_primary_term(&shard.shard_id);
            }
            self.apply(shard, choice.decision, allocation);
        }

        for shard in replicas {
            match self.decide_replica(&shard, allocation) {
                Some(decision) => self.apply(shard, decision, allocation),
                None => remaining.push(shard),
            }
        }

        for shard in remaining {
            allocation.routing_nodes.push_unassigned(shard);
        }
    }

    /// Explain view; None when the copy is left to the shards allocator
    pub fn decide_unassigned(
        &self,
        shard: &ShardRouting,
        allocation: &RoutingAllocation<'_>,
    ) -> Option<AllocateUnassignedDecision> {
        if shard.primary {
            if recovers_from_existing_store(shard) {
                return Some(self.decide_primary(shard, allocation).decision);
            }
            return None;
        }
        self.decide_replica(shard, allocation)
    }

    fn apply(&self, shard: ShardRouting, decision: AllocateUnassignedDecision, allocation: &mut RoutingAllocation<'_>) {
        let status = match (decision.decision, decision.target_node.as_deref()) {
            (AllocationDecision::Yes, Some(node_id)) => {
                let size = allocation.cluster_info().shard_size(&shard);
                allocation.routing_nodes.initialize_shard(
                    &shard,
                    node_id,
                    decision.allocation_id.as_deref(),
                    size,
                    &mut allocation.changes,
                );
                return;
            }
            (AllocationDecision::Throttled, _) => AllocationStatus::DecidersThrottled,
            (AllocationDecision::NoValidShardCopy, _) => AllocationStatus::NoValidShardCopy,
            (AllocationDecision::AwaitingInfo, _) => AllocationStatus::FetchingShardData,
            (AllocationDecision::AllocationDelayed, _) => AllocationStatus::DelayedAllocation,
            _ => AllocationStatus::DecidersNo,
        };
        trace!("Gateway leaves {} unassigned: {}", shard, decision.explanation);
        allocation
            .routing_nodes
            .ignore_shard(shard, status, &mut allocation.changes);
    }

    fn decide_primary(&self, shard: &ShardRouting, allocation: &RoutingAllocation<'_>) -> PrimaryChoice {
        let not_keeping = |decision| PrimaryChoice {
            decision,
            keeps_term: false,
        };
        let Some(index) = allocation.index_metadata(&shard.shard_id) else {
            return not_keeping(AllocateUnassignedDecision::no_attempt("index metadata is missing"));
        };
        let states = match self.fetcher.fetch(&shard.shard_id, allocation.nodes()) {
            FetchResult::Fetching => {
                return not_keeping(AllocateUnassignedDecision::new(
                    AllocationDecision::AwaitingInfo,
                    None,
                    "cannot allocate because information about existing shard data is still being retrieved \
                     from some of the nodes",
                ))
            }
            FetchResult::Data(states) => states,
        };

        let in_sync = index.in_sync_allocation_ids(shard.shard_id.id);
        let force_stale = matches!(
            shard.recovery_source,
            Some(RecoverySource::ExistingStore { force_stale: true })
        );
        let mut candidates: Vec<&NodeShardState> = states
            .iter()
            .filter(|s| s.usable())
            .filter(|s| allocation.routing_nodes.node(&s.node_id).is_some())
            .filter(|s| {
                force_stale
                    || s.allocation_id
                        .as_ref()
                        .map(|id| in_sync.contains(id))
                        .unwrap_or(false)
            })
            .collect();
        candidates.sort_by_key(|s| (Reverse(s.primary_term), Reverse(s.max_seq_no), !s.primary, s.node_id.clone()));

        if candidates.is_empty() {
            let explanation = if in_sync.is_empty() && !force_stale {
                "cannot allocate because no in-sync copy of the primary shard is recorded"
            } else {
                "cannot allocate because a previous copy of the primary shard existed but can no longer be \
                 found on the nodes in the cluster"
            };
            debug!("No valid shard copy for {} (in-sync {:?})", shard.shard_id, in_sync);
            return not_keeping(AllocateUnassignedDecision::new(
                AllocationDecision::NoValidShardCopy,
                None,
                explanation,
            ));
        }

        let mut results = Vec::with_capacity(candidates.len());
        let mut yes = None;
        let mut throttled = false;
        for candidate in &candidates {
            let Some(node) = allocation.routing_nodes.node(&candidate.node_id) else {
                continue;
            };
            let decision = allocation.deciders().can_allocate(shard, node, allocation);
            if decision.is_yes() && yes.is_none() {
                yes = Some(*candidate);
            } else if decision.is_throttle() {
                throttled = true;
            }
            results.push(store_result(candidate, decision, in_sync.contains(candidate_id(candidate))));
        }

        let mut forced = false;
        if yes.is_none() && !throttled {
            for candidate in &candidates {
                let Some(node) = allocation.routing_nodes.node(&candidate.node_id) else {
                    continue;
                };
                let decision = allocation.deciders().can_force_allocate_primary(shard, node, allocation);
                if decision.is_yes() {
                    yes = Some(*candidate);
                    forced = true;
                    break;
                } else if decision.is_throttle() {
                    throttled = true;
                }
            }
        }

        let Some(chosen) = yes else {
            let decision = if throttled {
                AllocateUnassignedDecision::new(
                    AllocationDecision::Throttled,
                    None,
                    "allocation temporarily throttled on the nodes holding a copy of the shard",
                )
            } else {
                AllocateUnassignedDecision::new(
                    AllocationDecision::No,
                    None,
                    "cannot allocate because allocation is not permitted to any of the nodes that hold an \
                     in-sync shard copy",
                )
            };
            return not_keeping(decision.with_node_decisions(results));
        };

        if forced {
            info!(
                "Forcing allocation of primary {} to node {} despite deciders",
                shard.shard_id, chosen.node_id
            );
        }
        let current_term = index.primary_term(shard.shard_id.id);
        let chosen_id = candidate_id(chosen);
        PrimaryChoice {
            keeps_term: chosen.primary && chosen.primary_term == current_term && in_sync.contains(chosen_id),
            decision: AllocateUnassignedDecision::new(
                AllocationDecision::Yes,
                Some(chosen.node_id.clone()),
                if forced {
                    "allocating the primary to the node holding the freshest copy, forced past the deciders"
                } else {
                    "can allocate the primary shard to the node holding the freshest in-sync copy"
                },
            )
            .with_allocation_id(Some(chosen_id.to_string()))
            .with_node_decisions(results),
        }
    }

    fn decide_replica(&self, shard: &ShardRouting, allocation: &RoutingAllocation<'_>) -> Option<AllocateUnassignedDecision> {
        allocation.routing_nodes.active_primary(&shard.shard_id)?;
        let index = allocation.index_metadata(&shard.shard_id)?;
        let delayed = shard.unassigned_info.as_ref().map(|i| i.delayed).unwrap_or(false);
        let remaining_delay = || {
            shard.unassigned_info.as_ref().map(|i| {
                i.remaining_delay(allocation.current_time(), index.settings.node_left_delayed_timeout_ms)
                    .num_milliseconds()
            })
        };

        let states = match self.fetcher.fetch(&shard.shard_id, allocation.nodes()) {
            FetchResult::Fetching => {
                return Some(AllocateUnassignedDecision::new(
                    AllocationDecision::AwaitingInfo,
                    None,
                    "cannot allocate because information about existing shard data is still being retrieved",
                ))
            }
            FetchResult::Data(states) => states,
        };
        let in_sync = index.in_sync_allocation_ids(shard.shard_id.id);
        let mut matching: Vec<&NodeShardState> = states
            .iter()
            .filter(|s| s.usable())
            .filter(|s| s.allocation_id.as_ref().map(|id| in_sync.contains(id)).unwrap_or(false))
            .filter(|s| {
                allocation
                    .routing_nodes
                    .node(&s.node_id)
                    .map(|n| n.get(&shard.shard_id).is_none())
                    .unwrap_or(false)
            })
            .collect();
        matching.sort_by_key(|s| (Reverse(s.max_seq_no), s.node_id.clone()));

        let mut results = Vec::new();
        for candidate in &matching {
            let Some(node) = allocation.routing_nodes.node(&candidate.node_id) else {
                continue;
            };
            let decision = allocation.deciders().can_allocate(shard, node, allocation);
            let kind = decision.kind();
            results.push(store_result(candidate, decision, true));
            if kind == crate::decision::DecisionKind::Yes {
                return Some(
                    AllocateUnassignedDecision::new(
                        AllocationDecision::Yes,
                        Some(candidate.node_id.clone()),
                        "can allocate the replica to a node that already holds a copy of its data",
                    )
                    .with_node_decisions(results),
                );
            }
            if kind == crate::decision::DecisionKind::Throttle {
                return Some(
                    AllocateUnassignedDecision::new(
                        AllocationDecision::Throttled,
                        None,
                        "allocation to the node holding a copy of the data is temporarily throttled",
                    )
                    .with_node_decisions(results),
                );
            }
        }

        if delayed {
            let remaining = remaining_delay();
            return Some(
                AllocateUnassignedDecision::new(
                    AllocationDecision::AllocationDelayed,
                    None,
                    format!(
                        "cannot allocate because the cluster is still waiting {}ms for the departed node holding a \
                         replica to rejoin",
                        remaining.unwrap_or(0)
                    ),
                )
                .with_remaining_delay_ms(remaining)
                .with_node_decisions(results),
            );
        }
        None
    }
}

fn recovers_from_existing_store(shard: &ShardRouting) -> bool {
    matches!(shard.recovery_source, Some(RecoverySource::ExistingStore { .. }))
}

fn candidate_id(state: &NodeShardState) -> &str {
    state.allocation_id.as_deref().unwrap_or_default()
}

fn store_result(state: &NodeShardState, decision: Decision, in_sync: bool) -> NodeAllocationResult {
    let mut result = NodeAllocationResult::new(state.node_id.clone(), decision);
    result.store_in_sync = Some(in_sync);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deciders::test_support::*;
    use crate::deciders::AllocationDeciders;
    use crate::info::{ClusterInfo, SnapshotsInfo};
    use chrono::Utc;
    use cluster_core::{ClusterState, RoutingTableBuilder, UnassignedInfo, UnassignedReason};
    use parking_lot::Mutex;
    use std::collections::{BTreeMap, BTreeSet};

    #[derive(Default)]
    struct StaticStates(Mutex<BTreeMap<ShardId, FetchResult>>);

    impl ShardStateFetcher for StaticStates {
        fn fetch(&self, shard_id: &ShardId, _nodes: &DiscoveryNodes) -> FetchResult {
            self.0
                .lock()
                .get(shard_id)
                .cloned()
                .unwrap_or(FetchResult::Data(Vec::new()))
        }
    }

    fn copy(node: &str, aid: &str, primary: bool, term: u64, seq: i64) -> NodeShardState {
        NodeShardState {
            node_id: node.to_string(),
            allocation_id: Some(aid.to_string()),
            primary,
            primary_term: term,
            max_seq_no: seq,
            store_error: None,
        }
    }

    /// Recovered state of a 1-shard index whose copies `a1`, `a2` are in sync at term 3
    fn recovered_state() -> ClusterState {
        let base = state(vec![node("n1"), node("n2"), node("n3")], vec![]);
        let meta = index("logs", 1, 1)
            .primary_term(0, 3)
            .in_sync_allocation_ids(0, BTreeSet::from(["a1".to_string(), "a2".to_string()]))
            .build()
            .unwrap();
        let mut routing = RoutingTableBuilder::new();
        routing.add_as_recovery(&meta, Utc::now()).unwrap();
        let metadata = base.metadata().to_builder().put(meta).build().unwrap();
        base.builder().metadata(metadata).routing_table(routing.build()).build()
    }

    #[test]
    fn test_primary_goes_to_freshest_in_sync_copy() {
        let state = recovered_state();
        let shard_id = state.metadata().index("logs").unwrap().shard_id(0);
        let fetcher = StaticStates::default();
        fetcher.0.lock().insert(
            shard_id.clone(),
            FetchResult::Data(vec![
                copy("n1", "a1", true, 3, 10),
                copy("n2", "a2", false, 3, 12),
                // stale copy with a higher seq no is never picked
                copy("n3", "stale", true, 2, 99),
            ]),
        );
        let gateway = GatewayAllocator::new(Arc::new(fetcher));
        let deciders = AllocationDeciders::with_defaults();
        let mut allocation =
            RoutingAllocation::new(&deciders, &state, ClusterInfo::default(), SnapshotsInfo::default(), Utc::now());
        gateway.allocate_unassigned(&mut allocation);

        let primary = allocation.routing_nodes.node("n2").unwrap().get(&shard_id).unwrap();
        assert!(primary.primary && primary.initializing());
        assert_eq!(primary.allocation_id_str(), Some("a2"));
    }

    #[test]
    fn test_no_valid_copy_and_fetching() {
        let state = recovered_state();
        let shard_id = state.metadata().index("logs").unwrap().shard_id(0);
        let fetcher = Arc::new(StaticStates::default());
        fetcher
            .0
            .lock()
            .insert(shard_id.clone(), FetchResult::Data(vec![copy("n3", "stale", true, 2, 99)]));
        let gateway = GatewayAllocator::new(fetcher.clone());
        let deciders = AllocationDeciders::with_defaults();

        let mut allocation =
            RoutingAllocation::new(&deciders, &state, ClusterInfo::default(), SnapshotsInfo::default(), Utc::now());
        gateway.allocate_unassigned(&mut allocation);
        let ignored = allocation.routing_nodes.ignored().iter().find(|s| s.primary).unwrap();
        assert_eq!(
            ignored.unassigned_info.as_ref().unwrap().last_allocation_status,
            AllocationStatus::NoValidShardCopy
        );

        fetcher.0.lock().insert(shard_id, FetchResult::Fetching);
        let mut allocation =
            RoutingAllocation::new(&deciders, &state, ClusterInfo::default(), SnapshotsInfo::default(), Utc::now());
        gateway.allocate_unassigned(&mut allocation);
        let ignored = allocation.routing_nodes.ignored().iter().find(|s| s.primary).unwrap();
        assert_eq!(
            ignored.unassigned_info.as_ref().unwrap().last_allocation_status,
            AllocationStatus::FetchingShardData
        );
    }

    #[test]
    fn test_delayed_replica_waits_without_matching_copy() {
        let state = recovered_state();
        let shard_id = state.metadata().index("logs").unwrap().shard_id(0);
        let deciders = AllocationDeciders::with_defaults();
        let mut allocation =
            RoutingAllocation::new(&deciders, &state, ClusterInfo::default(), SnapshotsInfo::default(), Utc::now());

        // start the primary by hand, then mark the replica as delayed
        let primary = allocation.routing_nodes.take_unassigned(|s| s.primary).unwrap();
        let mut changes = std::mem::take(&mut allocation.changes);
        let initializing = allocation
            .routing_nodes
            .initialize_shard(&primary, "n1", Some("a1"), None, &mut changes);
        allocation.routing_nodes.start_shard(&initializing, &mut changes);
        let replica = allocation.routing_nodes.take_unassigned(|s| !s.primary).unwrap();
        let info = UnassignedInfo::new(UnassignedReason::NodeLeft, None, Utc::now()).with_delayed(true);
        allocation
            .routing_nodes
            .push_unassigned(replica.update_unassigned(info, RecoverySource::Peer));

        let gateway = GatewayAllocator::new(Arc::new(NoShardStates));
        gateway.allocate_unassigned(&mut allocation);
        let ignored = &allocation.routing_nodes.ignored()[0];
        assert_eq!(ignored.shard_id, shard_id);
        assert_eq!(
            ignored.unassigned_info.as_ref().unwrap().last_allocation_status,
            AllocationStatus::DelayedAllocation
        );
    }
}

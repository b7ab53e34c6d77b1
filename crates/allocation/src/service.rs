//! Allocation service
//!
//! Entry point of the allocation engine. Every operation takes an immutable
//! `ClusterState`, runs one allocation pass over a private `RoutingNodes`, and returns
//! either a new validated state or an error; the input state is never touched.

use chrono::{DateTime, Duration, Utc};
use cluster_core::{
    ClusterState, Metadata, ShardId, UnassignedInfo, UnassignedReason,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, trace};

use crate::allocation::{DebugMode, RoutingAllocation};
use crate::allocator::{BalancedShardsAllocator, ShardsAllocator};
use crate::commands::{AllocationCommands, RerouteExplanation, RerouteOptions};
use crate::deciders::AllocationDeciders;
use crate::error::{AllocationError, Result};
use crate::explain::{self, ClusterAllocationExplainRequest, ClusterAllocationExplanation};
use crate::gateway::{GatewayAllocator, NoShardStates};
use crate::info::{
    ClusterInfoService, EmptyClusterInfoService, EmptySnapshotsInfoService, SnapshotsInfoService,
};

/// Time source of the allocation passes
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(start) }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now = *now + by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// A recovering copy reports that it started
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartedShardEntry {
    pub shard_id: ShardId,
    pub allocation_id: String,
    #[serde(default)]
    pub message: String,
}

/// A copy failed on its node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedShardEntry {
    pub shard_id: ShardId,
    pub allocation_id: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub failure: Option<String>,
    /// Also drop the copy from the in-sync set
    #[serde(default)]
    pub mark_as_stale: bool,
}

/// An allocation id the primary no longer considers in sync
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaleShard {
    pub shard_id: ShardId,
    pub allocation_id: String,
}

/// Result of a reroute with commands
#[derive(Debug, Clone)]
pub struct CommandsResult {
    pub state: ClusterState,
    pub explanations: Vec<RerouteExplanation>,
}

pub struct AllocationService {
    deciders: AllocationDeciders,
    gateway: GatewayAllocator,
    shards_allocator: Arc<dyn ShardsAllocator>,
    cluster_info: Arc<dyn ClusterInfoService>,
    snapshots_info: Arc<dyn SnapshotsInfoService>,
    clock: Arc<dyn Clock>,
}

impl Default for AllocationService {
    fn default() -> Self {
        Self::new(
            AllocationDeciders::with_defaults(),
            GatewayAllocator::new(Arc::new(NoShardStates)),
            Arc::new(BalancedShardsAllocator::new()),
            Arc::new(EmptyClusterInfoService),
            Arc::new(EmptySnapshotsInfoService),
        )
    }
}

impl AllocationService {
    pub fn new(
        deciders: AllocationDeciders,
        gateway: GatewayAllocator,
        shards_allocator: Arc<dyn ShardsAllocator>,
        cluster_info: Arc<dyn ClusterInfoService>,
        snapshots_info: Arc<dyn SnapshotsInfoService>,
    ) -> Self {
        Self {
            deciders,
            gateway,
            shards_allocator,
            cluster_info,
            snapshots_info,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn deciders(&self) -> &AllocationDeciders {
        &self.deciders
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn allocation<'a>(&'a self, state: &'a ClusterState) -> RoutingAllocation<'a> {
        RoutingAllocation::new(
            &self.deciders,
            state,
            self.cluster_info.cluster_info(),
            self.snapshots_info.snapshots_info(),
            self.clock.now(),
        )
    }

    /// Allocate what can be allocated, move what must move, rebalance
    ///
    /// Returns `state` itself when nothing changed.
    pub fn reroute(&self, state: &ClusterState, reason: &str) -> Result<ClusterState> {
        let expanded = self.adapt_auto_expand_replicas(state)?;
        let state = expanded.as_ref().unwrap_or(state);
        let mut allocation = self.allocation(state);
        self.remove_dead_nodes(&mut allocation);
        self.reroute_allocation(&mut allocation);
        self.build_result(state, allocation, reason)
    }

    /// Move initializing copies to STARTED, matched by allocation id, then reroute
    pub fn apply_started_shards(&self, state: &ClusterState, started: &[StartedShardEntry]) -> Result<ClusterState> {
        let mut allocation = self.allocation(state);
        self.remove_dead_nodes(&mut allocation);
        for entry in started {
            let Some(shard) = allocation
                .routing_nodes
                .by_allocation_id(&entry.shard_id, &entry.allocation_id)
                .cloned()
            else {
                debug!(
                    "Ignoring start of {} [{}], no such copy",
                    entry.shard_id, entry.allocation_id
                );
                continue;
            };
            if !shard.initializing() {
                debug!("Ignoring start of {}, copy is {}", shard, shard.state);
                continue;
            }
            allocation
                .routing_nodes
                .start_shard(&shard, &mut allocation.changes);
            info!(
                "Shard {} started on node {}",
                shard.shard_id,
                shard.node_id().unwrap_or("-")
            );
        }
        self.reroute_allocation(&mut allocation);
        let reason = format!("shards started [{}]", describe_started(started));
        self.build_result(state, allocation, &reason)
    }

    /// Fail copies and drop stale allocation ids, then reroute
    ///
    /// Each failed copy becomes unassigned with its retry counter incremented.
    pub fn apply_failed_shards(
        &self,
        state: &ClusterState,
        failed: &[FailedShardEntry],
        stale: &[StaleShard],
    ) -> Result<ClusterState> {
        let mut allocation = self.allocation(state);
        self.remove_dead_nodes(&mut allocation);
        let now = allocation.current_time();
        let metadata = allocation.metadata();

        for entry in stale {
            debug!("Marking {} [{}] as stale", entry.shard_id, entry.allocation_id);
            allocation
                .changes
                .mark_stale(&entry.shard_id, &entry.allocation_id);
        }

        for entry in failed {
            let Some(shard) = allocation
                .routing_nodes
                .by_allocation_id(&entry.shard_id, &entry.allocation_id)
                .cloned()
            else {
                debug!(
                    "Ignoring failure of {} [{}], no such copy",
                    entry.shard_id, entry.allocation_id
                );
                continue;
            };
            let failed_nodes: BTreeSet<String> = shard.current_node_id.iter().cloned().collect();
            let info = UnassignedInfo::new(UnassignedReason::AllocationFailed, Some(entry.message.clone()), now)
                .with_failure(entry.failure.clone())
                .with_failed_allocations(shard.failed_allocations() + 1)
                .with_failed_nodes(failed_nodes)
                .with_last_allocated_node(shard.current_node_id.clone());
            info!(
                "Shard {} failed on node {}: {}",
                shard.shard_id,
                shard.node_id().unwrap_or("-"),
                entry.message
            );
            if entry.mark_as_stale {
                allocation
                    .changes
                    .mark_stale(&entry.shard_id, &entry.allocation_id);
            }
            let stale_ids = allocation.changes.stale_ids(&entry.shard_id);
            let in_sync: BTreeSet<String> = in_sync_ids(metadata, &entry.shard_id)
                .difference(&stale_ids)
                .cloned()
                .collect();
            allocation
                .routing_nodes
                .fail_shard(&shard, info, &in_sync, &mut allocation.changes);
        }
        self.reroute_allocation(&mut allocation);
        self.build_result(state, allocation, "shards failed")
    }

    /// Unassign every copy held by a node that is no longer part of the cluster
    pub fn disassociate_dead_nodes(&self, state: &ClusterState, reroute: bool, reason: &str) -> Result<ClusterState> {
        let mut allocation = self.allocation(state);
        self.remove_dead_nodes(&mut allocation);
        if reroute {
            self.reroute_allocation(&mut allocation);
        }
        self.build_result(state, allocation, reason)
    }

    /// Run operator commands, then a regular reroute in the same pass
    ///
    /// `dry_run` is left to the caller: the returned state is simply not published.
    pub fn reroute_with_commands(
        &self,
        state: &ClusterState,
        commands: &AllocationCommands,
        options: RerouteOptions,
    ) -> Result<CommandsResult> {
        let mut allocation = self.allocation(state);
        self.remove_dead_nodes(&mut allocation);
        if options.retry_failed {
            reset_failed_counters(&mut allocation);
        }

        allocation.set_ignore_disable(true);
        if options.explain {
            allocation.set_debug_mode(DebugMode::On);
        }
        commands.execute(&mut allocation, options)?;
        allocation.set_debug_mode(DebugMode::Off);
        allocation.set_ignore_disable(false);

        self.reroute_allocation(&mut allocation);
        let explanations = allocation.take_explanations();
        let state = self.build_result(state, allocation, "reroute commands")?;
        Ok(CommandsResult { state, explanations })
    }

    /// Explain a copy; without a request the first unassigned copy is explained
    pub fn explain_shard_allocation(
        &self,
        state: &ClusterState,
        request: Option<&ClusterAllocationExplainRequest>,
    ) -> Result<ClusterAllocationExplanation> {
        let mut allocation = self.allocation(state);
        let (shard, include_yes_decisions) = match request {
            Some(request) => (explain::find_shard(&allocation, request)?, request.include_yes_decisions),
            None => (explain::first_unassigned(&allocation)?, false),
        };
        Ok(explain::explain_shard(
            &shard,
            &mut allocation,
            &self.gateway,
            self.shards_allocator.as_ref(),
            include_yes_decisions,
        ))
    }

    /// Bring the replica count of auto-expanding indices in line with the eligible nodes
    ///
    /// Returns None when every index already has the right count.
    pub fn adapt_auto_expand_replicas(&self, state: &ClusterState) -> Result<Option<ClusterState>> {
        let allocation = self.allocation(state);
        let mut wanted: Vec<(String, u32)> = Vec::new();
        for meta in state.metadata().iter().filter(|m| m.is_open()) {
            let Some(range) = meta.settings.auto_expand_replicas else {
                continue;
            };
            let eligible = state
                .nodes()
                .data_nodes()
                .filter(|node| {
                    !self
                        .deciders
                        .should_auto_expand_to_node(meta, node, &allocation)
                        .is_no()
                })
                .count();
            if let Some(replicas) = range.desired_replicas(eligible) {
                if replicas != meta.number_of_replicas() {
                    info!(
                        "Auto-expanding replicas of [{}] from {} to {} ({} eligible nodes)",
                        meta.name(),
                        meta.number_of_replicas(),
                        replicas,
                        eligible
                    );
                    wanted.push((meta.name().to_string(), replicas));
                }
            }
        }
        if wanted.is_empty() {
            return Ok(None);
        }

        let mut updated = state.clone();
        for (name, replicas) in wanted {
            updated = self.update_number_of_replicas(&updated, &[name], replicas)?;
        }
        Ok(Some(updated))
    }

    /// Change the replica count of `indices`; the routing table gains or loses unassigned copies
    ///
    /// Does not reroute.
    pub fn update_number_of_replicas(&self, state: &ClusterState, indices: &[String], replicas: u32) -> Result<ClusterState> {
        let now = self.clock.now();
        let mut metadata = state.metadata().to_builder().bump_version();
        let mut routing = state.routing_table().builder();
        for name in indices {
            let meta = state
                .metadata()
                .index(name)
                .ok_or_else(|| AllocationError::IndexNotFound(name.clone()))?;
            let updated = meta
                .to_builder()
                .number_of_replicas(replicas)
                .bump_version()
                .build()?;
            if updated.is_open() {
                routing.update_number_of_replicas(&updated, now)?;
            }
            metadata = metadata.put(updated);
        }
        let metadata = metadata.build()?;
        let routing_table = routing.build();
        routing_table.validate(&metadata)?;
        Ok(state.builder().metadata(metadata).routing_table(routing_table).build())
    }

    fn reroute_allocation(&self, allocation: &mut RoutingAllocation<'_>) {
        self.remove_delay_markers(allocation);
        self.gateway.allocate_unassigned(allocation);
        self.shards_allocator.allocate(allocation);
    }

    fn remove_dead_nodes(&self, allocation: &mut RoutingAllocation<'_>) {
        let nodes = allocation.nodes();
        let dead: Vec<String> = allocation
            .routing_nodes
            .nodes()
            .map(|n| n.node_id().to_string())
            .filter(|id| !nodes.get(id).map(|n| n.can_hold_shards()).unwrap_or(false))
            .collect();
        let metadata = allocation.metadata();
        let now = allocation.current_time();
        for node_id in dead {
            info!("Node {} left the cluster, unassigning its shards", node_id);
            allocation.routing_nodes.remove_node(
                &node_id,
                now,
                |shard| {
                    metadata
                        .index_for_shard(&shard.shard_id)
                        .map(|m| m.settings.node_left_delayed_timeout_ms > 0)
                        .unwrap_or(false)
                },
                |shard_id| in_sync_ids(metadata, shard_id),
                &mut allocation.changes,
            );
        }
    }

    /// Clear delay markers of primaries and of copies whose node-left timeout expired
    fn remove_delay_markers(&self, allocation: &mut RoutingAllocation<'_>) {
        let metadata = allocation.metadata();
        let now = allocation.current_time();
        allocation
            .routing_nodes
            .update_unassigned_infos(&mut allocation.changes, |shard, info| {
                if !info.delayed {
                    return None;
                }
                let timeout = metadata
                    .index_for_shard(&shard.shard_id)
                    .map(|m| m.settings.node_left_delayed_timeout_ms)
                    .unwrap_or(0);
                if shard.primary || info.remaining_delay(now, timeout) <= Duration::zero() {
                    trace!("Delay of {} expired", shard.shard_id);
                    return Some(info.clone().with_delayed(false));
                }
                None
            });
    }

    fn build_result(&self, state: &ClusterState, allocation: RoutingAllocation<'_>, reason: &str) -> Result<ClusterState> {
        let (routing_nodes, changes) = allocation.into_parts();
        if !changes.has_changes() {
            trace!("Reroute [{}] made no changes", reason);
            return Ok(state.clone());
        }
        let routing_table = routing_nodes.into_routing_table(state.routing_table());
        let metadata = changes.apply_to_metadata(state.metadata(), &routing_table)?;
        routing_table.validate(&metadata)?;
        let new_state = state
            .builder()
            .metadata(metadata)
            .routing_table(routing_table)
            .build();
        debug!(
            "Reroute [{}] produced cluster state version {} (routing table version {})",
            reason, new_state.version, new_state.routing_table.version
        );
        Ok(new_state)
    }
}

fn in_sync_ids(metadata: &Metadata, shard_id: &ShardId) -> BTreeSet<String> {
    metadata
        .index_for_shard(shard_id)
        .map(|m| m.in_sync_allocation_ids(shard_id.id).clone())
        .unwrap_or_default()
}

fn reset_failed_counters(allocation: &mut RoutingAllocation<'_>) {
    allocation
        .routing_nodes
        .update_unassigned_infos(&mut allocation.changes, |_, info| {
            if info.failed_allocations == 0 {
                return None;
            }
            Some(
                info.clone()
                    .with_failed_allocations(0)
                    .with_failed_nodes(BTreeSet::new()),
            )
        });
}

fn describe_started(started: &[StartedShardEntry]) -> String {
    started
        .iter()
        .map(|e| e.shard_id.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deciders::test_support::*;

    #[test]
    fn test_manual_clock_advances() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        clock.advance(Duration::seconds(30));
        assert_eq!(clock.now(), start + Duration::seconds(30));
    }

    #[test]
    fn test_reroute_is_idempotent() {
        let state = state(vec![node("n1"), node("n2")], vec![index("logs", 2, 1)]);
        let service = AllocationService::default();
        let first = service.reroute(&state, "test").unwrap();
        assert!(first.version > state.version);
        let second = service.reroute(&first, "test").unwrap();
        assert_eq!(second.version, first.version);
        assert!(second.same_content(&first));
    }
}

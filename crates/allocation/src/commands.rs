//! Operator allocation commands
//!
//! Commands run against the `RoutingAllocation` of a reroute pass before the allocators.
//! Every command is validated by the deciders unless the reroute is forced; a forced
//! command still never puts two copies of a shard on one node.

use cluster_core::{
    NodeId, RecoverySource, ShardId, ShardRouting, UnassignedInfo, UnassignedReason,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::allocation::RoutingAllocation;
use crate::decision::Decision;
use crate::error::{AllocationError, Result};

/// A single operator command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AllocationCommand {
    /// Relocate a started copy
    Move {
        index: String,
        shard: u32,
        from_node: NodeId,
        to_node: NodeId,
    },
    /// Cancel a recovery or relocation, or fail an assigned copy
    Cancel {
        index: String,
        shard: u32,
        node: NodeId,
        #[serde(default)]
        allow_primary: bool,
    },
    AllocateReplica {
        index: String,
        shard: u32,
        node: NodeId,
    },
    /// Allocate a primary from a copy outside the in-sync set
    AllocateStalePrimary {
        index: String,
        shard: u32,
        node: NodeId,
        #[serde(default)]
        accept_data_loss: bool,
    },
    /// Allocate a brand new, empty primary; all data of the shard is lost
    AllocateEmptyPrimary {
        index: String,
        shard: u32,
        node: NodeId,
        #[serde(default)]
        accept_data_loss: bool,
    },
}

/// Outcome of one command, kept when the reroute asks for explanations
#[derive(Debug, Clone, Serialize)]
pub struct RerouteExplanation {
    pub command: AllocationCommand,
    pub decisions: Decision,
}

/// Flags of a reroute request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RerouteOptions {
    /// Compute the result without publishing it
    pub dry_run: bool,
    /// Keep the decider verdicts of every command; rejected commands are reported, not raised
    pub explain: bool,
    /// Reset the retry counters of shards that exhausted their retries
    pub retry_failed: bool,
    /// Skip decider validation of the commands
    pub force: bool,
}

/// Ordered list of commands
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AllocationCommands(pub Vec<AllocationCommand>);

impl AllocationCommands {
    pub fn new(commands: Vec<AllocationCommand>) -> Self {
        Self(commands)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Run every command in order; the first error aborts the whole list
    pub fn execute(&self, allocation: &mut RoutingAllocation<'_>, options: RerouteOptions) -> Result<()> {
        for command in &self.0 {
            let explanation = command.execute(allocation, options.explain, options.force)?;
            if options.explain {
                allocation.add_explanation(explanation);
            }
        }
        Ok(())
    }
}

impl AllocationCommand {
    pub fn name(&self) -> &'static str {
        match self {
            AllocationCommand::Move { .. } => "move",
            AllocationCommand::Cancel { .. } => "cancel",
            AllocationCommand::AllocateReplica { .. } => "allocate_replica",
            AllocationCommand::AllocateStalePrimary { .. } => "allocate_stale_primary",
            AllocationCommand::AllocateEmptyPrimary { .. } => "allocate_empty_primary",
        }
    }

    fn illegal(&self, reason: impl Into<String>) -> AllocationError {
        AllocationError::IllegalCommand {
            command: self.name(),
            reason: reason.into(),
        }
    }

    /// A rejected command is an error, or a plain explanation in explain mode
    fn rejected(&self, decision: Decision, explain: bool) -> Result<RerouteExplanation> {
        if explain {
            return Ok(self.explained(decision));
        }
        Err(AllocationError::CommandRejected {
            command: self.name(),
            decision,
        })
    }

    fn explained(&self, decision: Decision) -> RerouteExplanation {
        RerouteExplanation {
            command: self.clone(),
            decisions: decision,
        }
    }

    fn forced(&self, decision: Decision) -> Decision {
        if decision.is_yes() {
            return decision;
        }
        warn!("Forcing [{}] past the deciders: {}", self.name(), decision);
        let mut forced = Decision::multi();
        forced.add(decision);
        forced.add(Decision::yes("force", "decider verdicts bypassed by a forced reroute"));
        forced
    }

    fn shard_id(&self, allocation: &RoutingAllocation<'_>, index: &str, shard: u32) -> Result<ShardId> {
        let meta = allocation
            .metadata()
            .index(index)
            .ok_or_else(|| AllocationError::IndexNotFound(index.to_string()))?;
        if !meta.is_open() {
            return Err(self.illegal(format!("index [{}] is closed", index)));
        }
        if shard >= meta.number_of_shards() {
            return Err(AllocationError::ShardNotFound(format!("[{}][{}]", index, shard)));
        }
        Ok(meta.shard_id(shard))
    }

    fn check_node(&self, allocation: &RoutingAllocation<'_>, node: &str) -> Result<()> {
        if allocation.routing_nodes.node(node).is_none() || !allocation.nodes().contains(node) {
            return Err(AllocationError::NodeNotFound(node.to_string()));
        }
        Ok(())
    }

    pub fn execute(&self, allocation: &mut RoutingAllocation<'_>, explain: bool, force: bool) -> Result<RerouteExplanation> {
        info!("Executing allocation command [{}]: {:?}", self.name(), self);
        match self {
            AllocationCommand::Move {
                index,
                shard,
                from_node,
                to_node,
            } => self.execute_move(allocation, index, *shard, from_node, to_node, explain, force),
            AllocationCommand::Cancel {
                index,
                shard,
                node,
                allow_primary,
            } => self.execute_cancel(allocation, index, *shard, node, *allow_primary),
            AllocationCommand::AllocateReplica { index, shard, node } => {
                self.execute_allocate_replica(allocation, index, *shard, node, explain, force)
            }
            AllocationCommand::AllocateStalePrimary {
                index,
                shard,
                node,
                accept_data_loss,
            } => self.execute_allocate_primary(allocation, index, *shard, node, *accept_data_loss, false, explain, force),
            AllocationCommand::AllocateEmptyPrimary {
                index,
                shard,
                node,
                accept_data_loss,
            } => self.execute_allocate_primary(allocation, index, *shard, node, *accept_data_loss, true, explain, force),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn execute_move(
        &self,
        allocation: &mut RoutingAllocation<'_>,
        index: &str,
        shard: u32,
        from_node: &str,
        to_node: &str,
        explain: bool,
        force: bool,
    ) -> Result<RerouteExplanation> {
        let shard_id = self.shard_id(allocation, index, shard)?;
        self.check_node(allocation, from_node)?;
        self.check_node(allocation, to_node)?;
        if from_node == to_node {
            return Err(self.illegal(format!("can't move {} to the node it is already on", shard_id)));
        }
        let source = allocation
            .routing_nodes
            .node(from_node)
            .and_then(|n| n.get(&shard_id))
            .cloned()
            .ok_or_else(|| self.illegal(format!("failed to find {} on node [{}]", shard_id, from_node)))?;
        if !source.started() {
            return Err(self.illegal(format!(
                "can't move {}, shard is not started (state = {})",
                shard_id, source.state
            )));
        }
        let Some(target) = allocation.routing_nodes.node(to_node) else {
            return Err(AllocationError::NodeNotFound(to_node.to_string()));
        };
        if target.get(&shard_id).is_some() {
            return Err(self.illegal(format!("node [{}] already holds a copy of {}", to_node, shard_id)));
        }

        let mut decision = allocation.deciders().can_allocate(&source, target, allocation);
        if decision.is_no() {
            if !force {
                return self.rejected(decision, explain);
            }
            decision = self.forced(decision);
        }
        let size = allocation.cluster_info().shard_size(&source);
        allocation
            .routing_nodes
            .relocate_shard(&source, to_node, size, &mut allocation.changes);
        Ok(self.explained(decision))
    }

    fn execute_cancel(
        &self,
        allocation: &mut RoutingAllocation<'_>,
        index: &str,
        shard: u32,
        node: &str,
        allow_primary: bool,
    ) -> Result<RerouteExplanation> {
        let shard_id = self.shard_id(allocation, index, shard)?;
        self.check_node(allocation, node)?;
        let copy = allocation
            .routing_nodes
            .node(node)
            .and_then(|n| n.get(&shard_id))
            .cloned()
            .ok_or_else(|| self.illegal(format!("can't cancel {}, failed to find it on node [{}]", shard_id, node)))?;

        let explanation = self.explained(Decision::yes(
            "cancel_allocation_command",
            format!("shard {} on node {} can be cancelled", shard_id, node),
        ));

        if copy.relocating() {
            allocation
                .routing_nodes
                .cancel_relocation(&copy, &mut allocation.changes);
            return Ok(explanation);
        }
        if copy.primary && !copy.is_relocation_target() && !allow_primary {
            return Err(self.illegal(format!(
                "can't cancel {} on node [{}], shard is primary and {}, set allow_primary to cancel it",
                shard_id, node, copy.state
            )));
        }
        let info = UnassignedInfo::new(
            UnassignedReason::RerouteCancelled,
            Some(format!("cancelled by an allocation command on node [{}]", node)),
            allocation.current_time(),
        )
        .with_last_allocated_node(Some(node.to_string()));
        let in_sync = allocation
            .index_metadata(&shard_id)
            .map(|m| m.in_sync_allocation_ids(shard_id.id).clone())
            .unwrap_or_default();
        allocation
            .routing_nodes
            .fail_shard(&copy, info, &in_sync, &mut allocation.changes);
        Ok(explanation)
    }

    fn execute_allocate_replica(
        &self,
        allocation: &mut RoutingAllocation<'_>,
        index: &str,
        shard: u32,
        node: &str,
        explain: bool,
        force: bool,
    ) -> Result<RerouteExplanation> {
        let shard_id = self.shard_id(allocation, index, shard)?;
        self.check_node(allocation, node)?;
        if allocation.routing_nodes.active_primary(&shard_id).is_none() {
            return Err(self.illegal(format!(
                "trying to allocate a replica of {}, while the corresponding primary shard is still unassigned",
                shard_id
            )));
        }
        let Some(replica) = find_unassigned(allocation, &shard_id, false) else {
            return Err(self.illegal(format!(
                "all copies of {} are already assigned, use the move allocation command instead",
                shard_id
            )));
        };
        self.initialize_checked(allocation, replica, node, explain, force, false)
    }

    #[allow(clippy::too_many_arguments)]
    fn execute_allocate_primary(
        &self,
        allocation: &mut RoutingAllocation<'_>,
        index: &str,
        shard: u32,
        node: &str,
        accept_data_loss: bool,
        empty: bool,
        explain: bool,
        force: bool,
    ) -> Result<RerouteExplanation> {
        let shard_id = self.shard_id(allocation, index, shard)?;
        self.check_node(allocation, node)?;
        if !accept_data_loss {
            return Err(self.illegal(format!(
                "allocating {} primary for {} can result in data loss, please confirm by setting the \
                 accept_data_loss parameter to true",
                if empty { "an empty" } else { "a stale" },
                shard_id
            )));
        }
        let Some(primary) = find_unassigned(allocation, &shard_id, true) else {
            return Err(self.illegal(format!("primary {} is already assigned", shard_id)));
        };
        let Some(info) = primary.unassigned_info.clone() else {
            return Err(self.illegal(format!("primary {} has no unassigned info", shard_id)));
        };

        let prepared = if empty {
            let info = UnassignedInfo::new(
                UnassignedReason::ForcedEmptyPrimary,
                Some(format!("force empty allocation from previous reason {}", info.reason)),
                allocation.current_time(),
            );
            primary.update_unassigned(info, RecoverySource::EmptyStore)
        } else {
            if !matches!(primary.recovery_source, Some(RecoverySource::ExistingStore { .. })) {
                return Err(self.illegal(format!(
                    "trying to allocate an existing primary {}, while no such shard has ever been active",
                    shard_id
                )));
            }
            primary.update_unassigned(info, RecoverySource::ExistingStore { force_stale: true })
        };
        self.initialize_checked(allocation, prepared, node, explain, force, true)
    }

    /// Validate and initialize an unassigned copy taken from the queue
    ///
    /// The copy goes back into the queue when the command is not carried out.
    fn initialize_checked(
        &self,
        allocation: &mut RoutingAllocation<'_>,
        shard: ShardRouting,
        node: &str,
        explain: bool,
        force: bool,
        primary: bool,
    ) -> Result<RerouteExplanation> {
        let Some(target) = allocation.routing_nodes.node(node) else {
            allocation.routing_nodes.push_unassigned(shard);
            return Err(AllocationError::NodeNotFound(node.to_string()));
        };
        if let Some(existing) = target.get(&shard.shard_id) {
            let reason = format!("node [{}] already holds a copy of {}: {}", node, shard.shard_id, existing);
            allocation.routing_nodes.push_unassigned(shard);
            return Err(self.illegal(reason));
        }
        let mut decision = if primary {
            allocation.deciders().can_force_allocate_primary(&shard, target, allocation)
        } else {
            allocation.deciders().can_allocate(&shard, target, allocation)
        };
        if decision.is_no() {
            if !force {
                allocation.routing_nodes.push_unassigned(shard);
                return self.rejected(decision, explain);
            }
            decision = self.forced(decision);
        }
        let size = allocation.cluster_info().shard_size(&shard);
        allocation
            .routing_nodes
            .initialize_shard(&shard, node, None, size, &mut allocation.changes);
        Ok(self.explained(decision))
    }
}

fn find_unassigned(allocation: &mut RoutingAllocation<'_>, shard_id: &ShardId, primary: bool) -> Option<ShardRouting> {
    allocation
        .routing_nodes
        .take_unassigned(|s| &s.shard_id == shard_id && s.primary == primary)
}

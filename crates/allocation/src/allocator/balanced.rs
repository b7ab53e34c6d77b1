//! Weight-based shards allocator
//!
//! The weight of a node for an index combines how far the node is from the average shard
//! count (shard balance) and from the average shard count of that index (index balance):
//!
//! ```text
//! weight(node, index) = θs * (shards(node) - avg_shards) + θi * (shards(node, index) - avg_shards(index))
//! ```
//!
//! with `θs = shard / (index + shard)` and `θi = index / (index + shard)`. Copies relocating
//! away are not counted on their source node.

use cluster_core::{AllocationStatus, BalanceSettings, ShardRouting};
use std::cmp::{Ordering, Reverse};
use tracing::{debug, trace};

use super::{
    AllocateUnassignedDecision, AllocationDecision, MoveDecision, NodeAllocationResult,
    RebalanceDecision, ShardAllocationDecision, ShardsAllocator,
};
use crate::allocation::RoutingAllocation;
use crate::decision::Decision;

/// Balance weights, normalized so that `theta_shard + theta_index == 1`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightFunction {
    theta_shard: f32,
    theta_index: f32,
    threshold: f32,
}

impl WeightFunction {
    pub fn new(settings: &BalanceSettings) -> Self {
        let sum = settings.index + settings.shard;
        let (theta_shard, theta_index) = if sum > 0.0 {
            (settings.shard / sum, settings.index / sum)
        } else {
            (0.5, 0.5)
        };
        Self {
            theta_shard,
            theta_index,
            threshold: settings.threshold,
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Weight of `node_id` for `index`, with `extra` copies added to the node
    fn weight(&self, model: &Model, allocation: &RoutingAllocation<'_>, node_id: &str, index: &str, extra: f32) -> f32 {
        let (shards, index_shards) = match allocation.routing_nodes.node(node_id) {
            Some(node) => (node.num_shards() as f32, node.num_shards_for_index(index) as f32),
            None => (0.0, 0.0),
        };
        let shard_delta = shards + extra - model.avg_shards;
        let index_delta = index_shards + extra - model.avg_shards_for_index(allocation, index);
        self.theta_shard * shard_delta + self.theta_index * index_delta
    }

    /// Whether moving one copy across a weight gap of `delta` strictly improves the balance
    ///
    /// A move lowers the source by 1 and raises the target by 1 (the thetas sum to 1).
    fn move_improves(&self, delta: f32) -> bool {
        delta > self.threshold && (delta - 2.0).abs() < delta
    }
}

/// Nodes and averages the weights are measured against
struct Model {
    node_ids: Vec<String>,
    avg_shards: f32,
    node_count: usize,
}

impl Model {
    fn new(allocation: &RoutingAllocation<'_>) -> Self {
        let node_ids = allocation.data_node_ids();
        let node_count = node_ids.len().max(1);
        Self {
            avg_shards: allocation.metadata().total_copies() as f32 / node_count as f32,
            node_count,
            node_ids,
        }
    }

    fn avg_shards_for_index(&self, allocation: &RoutingAllocation<'_>, index: &str) -> f32 {
        let copies = allocation
            .metadata()
            .index(index)
            .map(|m| (m.number_of_shards() * m.copies_per_shard()) as f32)
            .unwrap_or(0.0);
        copies / self.node_count as f32
    }
}

/// Default allocator: weighted placement, forced moves and rebalancing
#[derive(Debug, Clone, Copy, Default)]
pub struct BalancedShardsAllocator;

impl BalancedShardsAllocator {
    pub fn new() -> Self {
        Self
    }

    fn weights(allocation: &RoutingAllocation<'_>) -> WeightFunction {
        WeightFunction::new(&allocation.settings().balance)
    }

    /// Evaluate every node for an unassigned copy and pick the lightest accepting one
    ///
    /// THROTTLE nodes take part in the choice: if the best node is throttled the copy
    /// waits rather than going to a worse node. Ties prefer YES, then the lowest node id.
    fn decide_allocate_unassigned(
        &self,
        shard: &ShardRouting,
        allocation: &RoutingAllocation<'_>,
    ) -> AllocateUnassignedDecision {
        let model = Model::new(allocation);
        let weights = Self::weights(allocation);
        let index = shard.shard_id.index_name();

        let mut results = Vec::with_capacity(model.node_ids.len());
        let mut best: Option<(f32, bool, &str)> = None;
        for node_id in &model.node_ids {
            let Some(node) = allocation.routing_nodes.node(node_id) else {
                continue;
            };
            let decision = allocation.deciders().can_allocate(shard, node, allocation);
            let weight = weights.weight(&model, allocation, node_id, index, 1.0);
            if !decision.is_no() {
                let candidate = (weight, !decision.is_yes(), node_id.as_str());
                let better = match best {
                    None => true,
                    Some(current) => compare_candidates(&candidate, &current) == Ordering::Less,
                };
                if better {
                    best = Some(candidate);
                }
            }
            results.push((weight, NodeAllocationResult::new(node_id.clone(), decision)));
        }

        let node_decisions = rank_by_weight(results);
        match best {
            None => AllocateUnassignedDecision::new(
                AllocationDecision::No,
                None,
                "cannot allocate because allocation is not permitted to any of the nodes",
            )
            .with_node_decisions(node_decisions),
            Some((_, true, node_id)) => AllocateUnassignedDecision::new(
                AllocationDecision::Throttled,
                Some(node_id.to_string()),
                "allocation temporarily throttled",
            )
            .with_node_decisions(node_decisions),
            Some((_, false, node_id)) => AllocateUnassignedDecision::new(
                AllocationDecision::Yes,
                Some(node_id.to_string()),
                "can allocate the shard",
            )
            .with_node_decisions(node_decisions),
        }
    }

    fn allocate_unassigned(&self, allocation: &mut RoutingAllocation<'_>) {
        let mut shards = allocation.routing_nodes.drain_unassigned();
        if shards.is_empty() {
            return;
        }
        let metadata = allocation.metadata();
        shards.sort_by_key(|s| {
            let meta = metadata.index_for_shard(&s.shard_id);
            (
                !s.primary,
                Reverse(meta.map(|m| m.settings.priority).unwrap_or(0)),
                Reverse(meta.map(|m| m.number_of_shards() * m.copies_per_shard()).unwrap_or(0)),
                s.shard_id.index_name().to_string(),
                s.shard_id.id,
            )
        });

        for shard in shards {
            let decision = self.decide_allocate_unassigned(&shard, allocation);
            match (decision.decision, decision.target_node) {
                (AllocationDecision::Yes, Some(node_id)) => {
                    let size = allocation.cluster_info().shard_size(&shard);
                    allocation
                        .routing_nodes
                        .initialize_shard(&shard, &node_id, None, size, &mut allocation.changes);
                }
                (AllocationDecision::Throttled, _) => {
                    trace!("Allocation of {} throttled", shard);
                    allocation.routing_nodes.ignore_shard(
                        shard,
                        AllocationStatus::DecidersThrottled,
                        &mut allocation.changes,
                    );
                }
                _ => {
                    trace!("No node accepts {}", shard);
                    allocation.routing_nodes.ignore_shard(
                        shard,
                        AllocationStatus::DecidersNo,
                        &mut allocation.changes,
                    );
                }
            }
        }
    }

    /// Nodes other than `exclude` ordered by weight for `index`, lightest first
    fn nodes_by_weight(
        &self,
        model: &Model,
        allocation: &RoutingAllocation<'_>,
        index: &str,
        exclude: Option<&str>,
    ) -> Vec<(f32, String)> {
        let weights = Self::weights(allocation);
        let mut nodes: Vec<(f32, String)> = model
            .node_ids
            .iter()
            .filter(|id| Some(id.as_str()) != exclude)
            .map(|id| (weights.weight(model, allocation, id, index, 0.0), id.clone()))
            .collect();
        nodes.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        nodes
    }

    fn decide_move(&self, shard: &ShardRouting, allocation: &RoutingAllocation<'_>) -> MoveDecision {
        let Some(current) = shard.node_id().and_then(|id| allocation.routing_nodes.node(id)) else {
            return MoveDecision {
                can_remain: Decision::ALWAYS,
                decision: AllocationDecision::NoAttempt,
                target_node: None,
                explanation: "shard is not assigned".to_string(),
                node_decisions: Vec::new(),
            };
        };
        let can_remain = allocation.deciders().can_remain(shard, current, allocation);
        if !can_remain.is_no() {
            return MoveDecision {
                can_remain,
                decision: AllocationDecision::NoAttempt,
                target_node: None,
                explanation: "shard can remain on its current node".to_string(),
                node_decisions: Vec::new(),
            };
        }

        let model = Model::new(allocation);
        let mut target = None;
        let mut throttled = false;
        let mut results = Vec::new();
        for (weight, node_id) in self.nodes_by_weight(&model, allocation, shard.shard_id.index_name(), shard.node_id()) {
            let Some(node) = allocation.routing_nodes.node(&node_id) else {
                continue;
            };
            let decision = allocation.deciders().can_allocate(shard, node, allocation);
            if decision.is_yes() && target.is_none() {
                target = Some(node_id.clone());
            } else if decision.is_throttle() {
                throttled = true;
            }
            results.push((weight, NodeAllocationResult::new(node_id, decision)));
            if target.is_some() && !allocation.debug_decision() {
                break;
            }
        }
        let (decision, explanation) = match (&target, throttled) {
            (Some(_), _) => (AllocationDecision::Yes, "shard cannot remain on this node and is moved to another node"),
            (None, true) => (AllocationDecision::Throttled, "shard cannot remain on this node but is throttled on the other nodes"),
            (None, false) => (AllocationDecision::No, "cannot move shard to another node, even though it is not allowed to remain on its current node"),
        };
        MoveDecision {
            can_remain,
            decision,
            target_node: target,
            explanation: explanation.to_string(),
            node_decisions: rank_by_weight(results),
        }
    }

    fn move_shards(&self, allocation: &mut RoutingAllocation<'_>) {
        let started: Vec<ShardRouting> = allocation
            .routing_nodes
            .assigned()
            .filter(|s| s.started())
            .cloned()
            .collect();
        for shard in started {
            // an earlier move in this pass may have changed the copy
            let still_started = shard
                .node_id()
                .and_then(|id| allocation.routing_nodes.node(id))
                .and_then(|n| n.get(&shard.shard_id))
                .map(|s| s.is_same_allocation(&shard) && s.started())
                .unwrap_or(false);
            if !still_started {
                continue;
            }
            let decision = self.decide_move(&shard, allocation);
            if let (AllocationDecision::Yes, Some(target)) = (decision.decision, decision.target_node) {
                debug!("Moving {} to {}: {}", shard, target, decision.can_remain);
                let size = allocation.cluster_info().shard_size(&shard);
                allocation
                    .routing_nodes
                    .relocate_shard(&shard, &target, size, &mut allocation.changes);
            }
        }
    }

    /// Find a started copy of `index` on `from` that may be moved to `to`
    fn rebalance_candidate(
        &self,
        allocation: &RoutingAllocation<'_>,
        index: &str,
        from: &str,
        to: &str,
    ) -> Option<ShardRouting> {
        let from_node = allocation.routing_nodes.node(from)?;
        let to_node = allocation.routing_nodes.node(to)?;
        from_node
            .iter()
            .filter(|s| s.started() && s.shard_id.index_name() == index)
            .find(|s| {
                allocation.deciders().can_rebalance_shard(s, allocation).is_yes()
                    && allocation.deciders().can_allocate(s, to_node, allocation).is_yes()
            })
            .cloned()
    }

    fn balance_index(&self, allocation: &mut RoutingAllocation<'_>, index: &str) {
        let weights = Self::weights(allocation);
        let max_moves = allocation.metadata().total_copies().max(1);
        for _ in 0..max_moves {
            let model = Model::new(allocation);
            let nodes = self.nodes_by_weight(&model, allocation, index, None);
            if nodes.len() < 2 {
                return;
            }
            let mut moved = None;
            'pairs: for (high_weight, high) in nodes.iter().rev() {
                for (low_weight, low) in nodes.iter() {
                    if low == high {
                        break;
                    }
                    let delta = high_weight - low_weight;
                    if !weights.move_improves(delta) {
                        // the remaining candidates are heavier, the gap only shrinks
                        break;
                    }
                    if let Some(shard) = self.rebalance_candidate(allocation, index, high, low) {
                        moved = Some((shard, low.clone(), delta));
                        break 'pairs;
                    }
                }
            }
            let Some((shard, target, delta)) = moved else {
                return;
            };
            debug!("Rebalancing {} to {} (weight delta {:.3})", shard, target, delta);
            let size = allocation.cluster_info().shard_size(&shard);
            allocation
                .routing_nodes
                .relocate_shard(&shard, &target, size, &mut allocation.changes);
        }
    }

    fn balance(&self, allocation: &mut RoutingAllocation<'_>) {
        if allocation.data_node_ids().len() < 2 {
            return;
        }
        let decision = allocation.deciders().can_rebalance(allocation);
        if !decision.is_yes() {
            trace!("Skipping rebalance: {}", decision);
            return;
        }
        let indices: Vec<String> = allocation
            .metadata()
            .iter()
            .filter(|m| m.is_open())
            .map(|m| m.name().to_string())
            .collect();
        for index in indices {
            self.balance_index(allocation, &index);
        }
    }

    fn decide_rebalance(&self, shard: &ShardRouting, allocation: &RoutingAllocation<'_>) -> RebalanceDecision {
        let can_rebalance = allocation.deciders().can_rebalance_shard(shard, allocation);
        let model = Model::new(allocation);
        let weights = Self::weights(allocation);
        let index = shard.shard_id.index_name();
        let nodes = self.nodes_by_weight(&model, allocation, index, None);
        let current = shard.node_id().unwrap_or_default();
        let current_weight = nodes
            .iter()
            .find(|(_, id)| id == current)
            .map(|(w, _)| *w)
            .unwrap_or(0.0);
        let current_node_ranking = nodes.iter().position(|(_, id)| id == current).map(|p| p + 1).unwrap_or(0);

        if !can_rebalance.is_yes() {
            let decision = AllocationDecision::from_kind(can_rebalance.kind());
            return RebalanceDecision {
                can_rebalance,
                decision,
                target_node: None,
                current_node_ranking,
                explanation: "rebalancing is not allowed".to_string(),
                node_decisions: Vec::new(),
            };
        }

        let mut target = None;
        let mut throttled = false;
        let mut results = Vec::new();
        for (weight, node_id) in &nodes {
            if node_id == current {
                continue;
            }
            let Some(node) = allocation.routing_nodes.node(node_id) else {
                continue;
            };
            let decision = allocation.deciders().can_allocate(shard, node, allocation);
            let improves = weights.move_improves(current_weight - weight);
            let mut result = NodeAllocationResult::new(node_id.clone(), decision.clone());
            if !improves && !decision.is_no() {
                result.node_decision = AllocationDecision::WorseBalance;
            }
            if improves && target.is_none() {
                if decision.is_yes() {
                    target = Some(node_id.clone());
                } else if decision.is_throttle() {
                    throttled = true;
                }
            }
            results.push((*weight, result));
        }
        let (decision, explanation) = match (&target, throttled) {
            (Some(_), _) => (AllocationDecision::Yes, "can rebalance shard to a node with a better weight"),
            (None, true) => (AllocationDecision::Throttled, "rebalancing is throttled on the better nodes"),
            (None, false) => (AllocationDecision::WorseBalance, "cannot rebalance as no target node exists that improves the balance"),
        };
        RebalanceDecision {
            can_rebalance,
            decision,
            target_node: target,
            current_node_ranking,
            explanation: explanation.to_string(),
            node_decisions: rank_by_weight(results),
        }
    }
}

/// (weight, throttled, node id): lower weight first, YES before THROTTLE, then node id
fn compare_candidates(a: &(f32, bool, &str), b: &(f32, bool, &str)) -> Ordering {
    a.0.total_cmp(&b.0)
        .then_with(|| a.1.cmp(&b.1))
        .then_with(|| a.2.cmp(b.2))
}

/// Order node results by weight (then node id) and set their ranking
fn rank_by_weight(mut results: Vec<(f32, NodeAllocationResult)>) -> Vec<NodeAllocationResult> {
    results.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.node_id.cmp(&b.1.node_id)));
    results
        .into_iter()
        .enumerate()
        .map(|(i, (_, mut result))| {
            result.weight_ranking = Some(i + 1);
            result
        })
        .collect()
}

impl ShardsAllocator for BalancedShardsAllocator {
    fn allocate(&self, allocation: &mut RoutingAllocation<'_>) {
        if allocation.data_node_ids().is_empty() {
            // nothing can be placed; still record why every copy waits
            for shard in allocation.routing_nodes.drain_unassigned() {
                allocation
                    .routing_nodes
                    .ignore_shard(shard, AllocationStatus::DecidersNo, &mut allocation.changes);
            }
            return;
        }
        self.allocate_unassigned(allocation);
        self.move_shards(allocation);
        self.balance(allocation);
    }

    fn decide_shard_allocation(&self, shard: &ShardRouting, allocation: &RoutingAllocation<'_>) -> ShardAllocationDecision {
        if shard.unassigned() {
            return ShardAllocationDecision {
                allocate: Some(self.decide_allocate_unassigned(shard, allocation)),
                ..Default::default()
            };
        }
        if !shard.started() {
            return ShardAllocationDecision::default();
        }
        let move_decision = self.decide_move(shard, allocation);
        let rebalance = if move_decision.can_remain.is_no() {
            None
        } else {
            Some(self.decide_rebalance(shard, allocation))
        };
        ShardAllocationDecision {
            allocate: None,
            move_decision: Some(move_decision),
            rebalance,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deciders::test_support::*;
    use crate::deciders::AllocationDeciders;
    use crate::info::{ClusterInfo, SnapshotsInfo};
    use chrono::Utc;

    #[test]
    fn test_weight_function_normalizes_thetas() {
        let weights = WeightFunction::new(&BalanceSettings {
            index: 0.55,
            shard: 0.45,
            threshold: 1.0,
        });
        assert!((weights.theta_index + weights.theta_shard - 1.0).abs() < 1e-6);
        assert!(!weights.move_improves(1.0));
        assert!(weights.move_improves(1.5));
        assert!(weights.move_improves(2.0));
    }

    #[test]
    fn test_unassigned_spread_over_nodes() {
        let state = state(vec![node("n1"), node("n2"), node("n3")], vec![index("logs", 3, 0)]);
        let deciders = AllocationDeciders::with_defaults();
        let mut allocation =
            RoutingAllocation::new(&deciders, &state, ClusterInfo::default(), SnapshotsInfo::default(), Utc::now());
        BalancedShardsAllocator.allocate(&mut allocation);

        for id in ["n1", "n2", "n3"] {
            assert_eq!(allocation.routing_nodes.node(id).unwrap().len(), 1, "node {}", id);
        }
        assert!(allocation.routing_nodes.unassigned().is_empty());
    }

    #[test]
    fn test_zero_nodes_ignores_everything() {
        let state = state(vec![], vec![index("logs", 2, 1)]);
        let deciders = AllocationDeciders::with_defaults();
        let mut allocation =
            RoutingAllocation::new(&deciders, &state, ClusterInfo::default(), SnapshotsInfo::default(), Utc::now());
        BalancedShardsAllocator.allocate(&mut allocation);
        assert_eq!(allocation.routing_nodes.ignored().len(), 4);
        assert!(allocation
            .routing_nodes
            .ignored()
            .iter()
            .all(|s| s.unassigned_info.as_ref().unwrap().last_allocation_status == AllocationStatus::DecidersNo));
    }
}

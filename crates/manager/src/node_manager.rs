//! Node management module
//!
//! Responsible for node registration, heartbeat detection, and failure detection.
//! Joins and departures become cluster state update tasks.

use allocation::{AllocationService, NodeShardState};
use cluster_core::{AllocationStatus, ClusterState, DiscoveryNode, NodeId, ShardId};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::{interval, Instant};
use tracing::{debug, error, info, warn};

use crate::cluster_service::{ClusterService, ClusterServiceError};
use crate::config::HeartbeatConfig;
use crate::registry::{ClusterInfoRegistry, ShardStateRegistry};

/// Registration result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterResult {
    NewNode,
    Reconnected,
}

/// Node manager
pub struct NodeManager {
    config: HeartbeatConfig,
    /// Last heartbeat of every tracked node
    heartbeats: Mutex<BTreeMap<NodeId, Instant>>,
    cluster: ClusterService,
    allocation: Arc<AllocationService>,
    shard_states: Arc<ShardStateRegistry>,
    cluster_info: Arc<ClusterInfoRegistry>,
}

impl NodeManager {
    pub fn new(
        config: HeartbeatConfig,
        cluster: ClusterService,
        allocation: Arc<AllocationService>,
        shard_states: Arc<ShardStateRegistry>,
        cluster_info: Arc<ClusterInfoRegistry>,
    ) -> Self {
        Self {
            config,
            heartbeats: Mutex::new(BTreeMap::new()),
            cluster,
            allocation,
            shard_states,
            cluster_info,
        }
    }

    /// Start watching a node that is already part of the cluster state
    pub fn track(&self, node_id: &str) {
        self.heartbeats.lock().insert(node_id.to_string(), Instant::now());
    }

    /// Register node together with the shard copies it found on disk
    pub async fn register(
        &self,
        node: DiscoveryNode,
        copies: Vec<(ShardId, NodeShardState)>,
    ) -> Result<RegisterResult, ClusterServiceError> {
        let node_id = node.id.clone();
        self.shard_states.report(&node_id, copies);
        self.track(&node_id);

        let allocation = self.allocation.clone();
        let reconnected = self.cluster.state().nodes.contains(&node_id);
        self.cluster
            .submit(format!("node-join [{}]", node_id), move |state: &ClusterState| {
                let joined = if state.nodes.contains(&node.id) {
                    state.clone()
                } else {
                    let nodes = (*state.nodes).clone().with_node(node);
                    state.builder().nodes(nodes).build()
                };
                Ok(allocation.reroute(&joined, "node joined")?)
            })
            .await?;

        if reconnected {
            info!("Node re-registered: {}", node_id);
            Ok(RegisterResult::Reconnected)
        } else {
            info!("New node registered: {}", node_id);
            Ok(RegisterResult::NewNode)
        }
    }

    /// Handle heartbeat
    pub fn heartbeat(&self, node_id: &str) -> bool {
        let mut heartbeats = self.heartbeats.lock();
        match heartbeats.get_mut(node_id) {
            Some(last) => {
                *last = Instant::now();
                debug!("Heartbeat from node: {}", node_id);
                true
            }
            None => {
                warn!("Heartbeat from unknown node: {}", node_id);
                false
            }
        }
    }

    /// Remove node; its copies become unassigned
    pub async fn remove_node(&self, node_id: &str, reason: &str) -> Result<Arc<ClusterState>, ClusterServiceError> {
        self.heartbeats.lock().remove(node_id);
        self.shard_states.forget_node(node_id);
        self.cluster_info.remove_node(node_id);

        let allocation = self.allocation.clone();
        let id = node_id.to_string();
        let reason = reason.to_string();
        let state = self
            .cluster
            .submit(format!("node-left [{}]", node_id), move |state: &ClusterState| {
                if !state.nodes.contains(&id) {
                    return Ok(state.clone());
                }
                let nodes = (*state.nodes).clone().without_node(&id);
                let departed = state.builder().nodes(nodes).build();
                Ok(allocation.disassociate_dead_nodes(&departed, true, &reason)?)
            })
            .await?;
        info!("Node {} removed from cluster", node_id);
        Ok(state)
    }

    /// Tracked node ids
    pub fn tracked_nodes(&self) -> Vec<NodeId> {
        self.heartbeats.lock().keys().cloned().collect()
    }

    /// Start heartbeat checker task
    pub fn start_liveness_checker(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let check_interval = self.config.check_interval();

        tokio::spawn(async move {
            let mut interval = interval(check_interval);
            loop {
                interval.tick().await;
                self.check_heartbeats().await;
                self.check_pending_allocations().await;
            }
        })
    }

    /// Remove every node whose heartbeat timed out
    pub async fn check_heartbeats(&self) {
        let timeout = self.config.timeout();
        let now = Instant::now();
        let expired: Vec<NodeId> = self
            .heartbeats
            .lock()
            .iter()
            .filter(|(_, last)| now.duration_since(**last) > timeout)
            .map(|(id, _)| id.clone())
            .collect();

        for node_id in expired {
            warn!("Node {} heartbeat timeout, removing it from the cluster", node_id);
            if let Err(e) = self.remove_node(&node_id, "heartbeat timeout").await {
                error!("Failed to remove node {}: {}", node_id, e);
            }
        }
    }

    /// Reroute when a waiting copy became allocatable: a node-left delay or a retry
    /// back-off may have run out since the last pass
    pub async fn check_pending_allocations(&self) {
        let state = self.cluster.state();
        let settings = &state.metadata().settings.allocation;
        let now = self.allocation.now();
        let pending = state
            .routing_table()
            .all_shards()
            .filter_map(|s| s.unassigned_info.as_ref())
            .any(|info| {
                info.delayed
                    || (info.last_allocation_status == AllocationStatus::DecidersThrottled
                        && info.failed_allocations > 0
                        && info.failed_allocations < settings.max_retries
                        && info.retry_at(settings.retry_delay_base_ms, settings.retry_delay_max_ms) <= now)
            });
        if !pending {
            return;
        }

        let allocation = self.allocation.clone();
        if let Err(e) = self
            .cluster
            .submit("pending allocation check", move |state: &ClusterState| {
                Ok(allocation.reroute(state, "pending allocation check")?)
            })
            .await
        {
            error!("Pending allocation reroute failed: {}", e);
        }
    }
}

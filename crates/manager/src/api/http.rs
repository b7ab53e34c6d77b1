//! HTTP admin API
//!
//! RESTful API over the cluster manager operations

use allocation::{ClusterAllocationExplainRequest, StartedShardEntry};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post, put},
    Json, Router,
};
use cluster_core::ClusterState;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::node_manager::RegisterResult;
use crate::requests::{
    CreateIndexRequest, DiskUsageRequest, FailedShardsRequest, RegisterNodeRequest, RerouteRequest,
    ShardStateReport, SnapshotsUpdate, UpdateReplicasRequest,
};
use crate::{ClusterManager, ManagerError};

/// Longest a routing watch may wait
const MAX_WATCH_TIMEOUT_MS: u64 = 60_000;

/// HTTP API service
pub struct HttpApi {
    manager: Arc<ClusterManager>,
}

impl HttpApi {
    pub fn new(manager: Arc<ClusterManager>) -> Self {
        Self { manager }
    }

    /// Create router
    pub fn router(self) -> Router {
        let manager = self.manager;

        Router::new()
            // Cluster
            .route("/api/v1/cluster/state", get(get_state))
            .route("/api/v1/cluster/health", get(get_health))
            .route("/api/v1/cluster/settings", put(update_settings))
            // Nodes
            .route("/api/v1/nodes", get(list_nodes).post(register_node))
            .route("/api/v1/nodes/:node_id", delete(remove_node))
            .route("/api/v1/nodes/:node_id/heartbeat", post(node_heartbeat))
            .route("/api/v1/nodes/:node_id/disk", post(node_disk_usage))
            .route("/api/v1/nodes/:node_id/shard-states", post(node_shard_states))
            // Indices
            .route("/api/v1/indices", post(create_index))
            .route("/api/v1/indices/:index", delete(delete_index))
            .route("/api/v1/indices/:index/replicas", put(update_replicas))
            // Routing
            .route("/api/v1/routing", get(get_routing))
            // Shards
            .route("/api/v1/shards/started", post(shards_started))
            .route("/api/v1/shards/failed", post(shards_failed))
            // Allocation
            .route("/api/v1/reroute", post(reroute))
            .route("/api/v1/allocation/explain", post(explain))
            .route("/api/v1/snapshots", put(update_snapshots))
            .with_state(manager)
    }
}

// ==================== Response types ====================

#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }

    fn err(msg: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        })
    }
}

/// Published state after a change
#[derive(Serialize)]
struct StateAck {
    version: u64,
    state_uuid: String,
}

impl From<Arc<ClusterState>> for StateAck {
    fn from(state: Arc<ClusterState>) -> Self {
        Self {
            version: state.version,
            state_uuid: state.state_uuid.clone(),
        }
    }
}

#[derive(Serialize)]
struct RegisterResponse {
    is_new: bool,
}

#[derive(Deserialize)]
struct RoutingQuery {
    /// Wait for a routing table newer than this version
    version: Option<u64>,
    timeout_ms: Option<u64>,
}

fn error_status(e: &ManagerError) -> StatusCode {
    if e.is_not_found() {
        StatusCode::NOT_FOUND
    } else if e.is_bad_request() {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

fn reply<T: Serialize>(status: StatusCode, result: crate::Result<T>) -> (StatusCode, Json<ApiResponse<T>>) {
    match result {
        Ok(data) => (status, ApiResponse::ok(data)),
        Err(e) => (error_status(&e), ApiResponse::err(e.to_string())),
    }
}

// ==================== Handlers ====================

// Cluster
async fn get_state(State(manager): State<Arc<ClusterManager>>) -> impl IntoResponse {
    ApiResponse::ok(manager.state())
}

async fn get_health(State(manager): State<Arc<ClusterManager>>) -> impl IntoResponse {
    ApiResponse::ok(manager.health())
}

async fn update_settings(
    State(manager): State<Arc<ClusterManager>>,
    Json(patch): Json<serde_json::Value>,
) -> impl IntoResponse {
    let result = manager
        .update_settings(patch)
        .await
        .map(|state| state.metadata().settings.clone());
    reply(StatusCode::OK, result)
}

// Nodes
async fn list_nodes(State(manager): State<Arc<ClusterManager>>) -> impl IntoResponse {
    ApiResponse::ok(manager.nodes())
}

async fn register_node(
    State(manager): State<Arc<ClusterManager>>,
    Json(req): Json<RegisterNodeRequest>,
) -> impl IntoResponse {
    let node_id = req.node_id.clone();
    match manager.register_node(req).await {
        Ok(result) => {
            info!("Node {} registered via HTTP API", node_id);
            let is_new = result == RegisterResult::NewNode;
            let status = if is_new { StatusCode::CREATED } else { StatusCode::OK };
            (status, ApiResponse::ok(RegisterResponse { is_new }))
        }
        Err(e) => (error_status(&e), ApiResponse::<RegisterResponse>::err(e.to_string())),
    }
}

async fn node_heartbeat(
    State(manager): State<Arc<ClusterManager>>,
    Path(node_id): Path<String>,
) -> impl IntoResponse {
    reply(StatusCode::OK, manager.heartbeat(&node_id))
}

async fn remove_node(
    State(manager): State<Arc<ClusterManager>>,
    Path(node_id): Path<String>,
) -> impl IntoResponse {
    reply(StatusCode::OK, manager.remove_node(&node_id).await.map(StateAck::from))
}

async fn node_disk_usage(
    State(manager): State<Arc<ClusterManager>>,
    Path(node_id): Path<String>,
    Json(req): Json<DiskUsageRequest>,
) -> impl IntoResponse {
    reply(
        StatusCode::OK,
        manager.set_disk_usage(&node_id, req).await.map(StateAck::from),
    )
}

async fn node_shard_states(
    State(manager): State<Arc<ClusterManager>>,
    Path(node_id): Path<String>,
    Json(reports): Json<Vec<ShardStateReport>>,
) -> impl IntoResponse {
    reply(
        StatusCode::OK,
        manager
            .report_shard_states(&node_id, reports)
            .await
            .map(StateAck::from),
    )
}

// Indices
async fn create_index(
    State(manager): State<Arc<ClusterManager>>,
    Json(req): Json<CreateIndexRequest>,
) -> impl IntoResponse {
    reply(StatusCode::CREATED, manager.create_index(req).await)
}

async fn delete_index(
    State(manager): State<Arc<ClusterManager>>,
    Path(index): Path<String>,
) -> impl IntoResponse {
    reply(StatusCode::OK, manager.delete_index(&index).await.map(StateAck::from))
}

async fn update_replicas(
    State(manager): State<Arc<ClusterManager>>,
    Path(index): Path<String>,
    Json(req): Json<UpdateReplicasRequest>,
) -> impl IntoResponse {
    reply(
        StatusCode::OK,
        manager
            .update_replicas(&index, req.number_of_replicas)
            .await
            .map(StateAck::from),
    )
}

// Routing
async fn get_routing(
    State(manager): State<Arc<ClusterManager>>,
    Query(query): Query<RoutingQuery>,
) -> impl IntoResponse {
    let timeout = Duration::from_millis(query.timeout_ms.unwrap_or(30_000).min(MAX_WATCH_TIMEOUT_MS));
    ApiResponse::ok(manager.routing(query.version, timeout).await)
}

// Shards
async fn shards_started(
    State(manager): State<Arc<ClusterManager>>,
    Json(entries): Json<Vec<StartedShardEntry>>,
) -> impl IntoResponse {
    reply(StatusCode::OK, manager.shards_started(entries).await.map(StateAck::from))
}

async fn shards_failed(
    State(manager): State<Arc<ClusterManager>>,
    Json(req): Json<FailedShardsRequest>,
) -> impl IntoResponse {
    reply(StatusCode::OK, manager.shards_failed(req).await.map(StateAck::from))
}

// Allocation
async fn reroute(
    State(manager): State<Arc<ClusterManager>>,
    Json(req): Json<RerouteRequest>,
) -> impl IntoResponse {
    reply(StatusCode::OK, manager.reroute_commands(req).await)
}

async fn explain(
    State(manager): State<Arc<ClusterManager>>,
    req: Option<Json<ClusterAllocationExplainRequest>>,
) -> impl IntoResponse {
    reply(StatusCode::OK, manager.explain(req.map(|Json(req)| req)))
}

async fn update_snapshots(
    State(manager): State<Arc<ClusterManager>>,
    Json(update): Json<SnapshotsUpdate>,
) -> impl IntoResponse {
    reply(StatusCode::OK, manager.update_snapshots(update).await.map(StateAck::from))
}

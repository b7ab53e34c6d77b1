//! Cluster manager
//!
//! Hosts the allocation engine behind a single-writer cluster service.
//!
//! # Features
//! - Gateway recovery of the persisted metadata at startup
//! - Node registration, heartbeats and failure detection
//! - Index lifecycle and replica count changes
//! - Shard started / failed events from the data nodes
//! - Reroute commands, allocation explain and cluster health
//!
//! # Usage Example
//! ```ignore
//! use manager::{ClusterManager, config::Config};
//!
//! let manager = ClusterManager::start(Config::default()).await?;
//! let health = manager.health();
//! ```

pub mod api;
pub mod cluster_service;
pub mod config;
pub mod gateway;
pub mod node_manager;
pub mod registry;
pub mod requests;
pub mod storage;
pub mod watch;

use allocation::{
    AllocationDeciders, AllocationError, AllocationService, BalancedShardsAllocator,
    ClusterAllocationExplainRequest, ClusterAllocationExplanation, DiskUsage, GatewayAllocator,
    StartedShardEntry,
};
use cluster_core::{ClusterHealth, ClusterState, CoreError, DiscoveryNode, DiscoveryNodes, IndexMetadata};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use cluster_service::{ClusterService, ClusterServiceError};
use config::{Config, ConfigError};
use gateway::{FileMetaStateFetcher, Gateway, GatewayError, MetaStateFetcher};
use node_manager::{NodeManager, RegisterResult};
use registry::{ClusterInfoRegistry, ShardStateRegistry, SnapshotsRegistry};
use requests::{
    CreateIndexRequest, DiskUsageRequest, FailedShardsRequest, RegisterNodeRequest, RerouteRequest,
    RerouteResponse, RoutingResponse, ShardStateReport, SnapshotsUpdate,
};
use storage::{FileStorage, StorageError};

/// Manager error
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    ClusterService(#[from] ClusterServiceError),
    #[error(transparent)]
    Allocation(#[from] AllocationError),
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error("Node {0} not found")]
    NodeNotFound(String),
}

impl ManagerError {
    /// Whether the caller asked for something that does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ManagerError::NodeNotFound(_)
                | ManagerError::Allocation(
                    AllocationError::IndexNotFound(_)
                        | AllocationError::ShardNotFound(_)
                        | AllocationError::NodeNotFound(_)
                )
                | ManagerError::ClusterService(ClusterServiceError::Allocation(
                    AllocationError::IndexNotFound(_)
                        | AllocationError::ShardNotFound(_)
                        | AllocationError::NodeNotFound(_)
                ))
        )
    }

    /// Whether the request itself was invalid
    pub fn is_bad_request(&self) -> bool {
        matches!(
            self,
            ManagerError::Core(_)
                | ManagerError::Allocation(_)
                | ManagerError::ClusterService(
                    ClusterServiceError::Allocation(_)
                        | ClusterServiceError::Core(_)
                        | ClusterServiceError::Rejected(_)
                )
        )
    }
}

pub type Result<T> = std::result::Result<T, ManagerError>;

/// Cluster manager
pub struct ClusterManager {
    config: Config,
    allocation: Arc<AllocationService>,
    cluster: ClusterService,
    node_manager: Arc<NodeManager>,
    shard_states: Arc<ShardStateRegistry>,
    cluster_info: Arc<ClusterInfoRegistry>,
    snapshots: Arc<SnapshotsRegistry>,
}

impl ClusterManager {
    /// Recover the cluster state from the nodes' data directories and start serving
    pub async fn start(config: Config) -> Result<Arc<Self>> {
        let fetcher = Arc::new(FileMetaStateFetcher::new(config.storage.data_dir.clone()));
        Self::start_with_fetcher(config, fetcher).await
    }

    pub async fn start_with_fetcher(config: Config, fetcher: Arc<dyn MetaStateFetcher>) -> Result<Arc<Self>> {
        config.validate()?;

        let shard_states = Arc::new(ShardStateRegistry::new());
        let cluster_info = Arc::new(ClusterInfoRegistry::new());
        let snapshots = Arc::new(SnapshotsRegistry::new());
        let allocation = Arc::new(AllocationService::new(
            AllocationDeciders::with_defaults(),
            GatewayAllocator::new(shard_states.clone()),
            Arc::new(BalancedShardsAllocator::new()),
            cluster_info.clone(),
            snapshots.clone(),
        ));

        // the local node always answers the gateway, even on its first start
        let storage = Arc::new(FileStorage::new(config.storage.node_dir(&config.node.node_id)));
        storage.ensure_dir().await?;
        // recovery overwrites the local copy
        match storage.backup().await {
            Ok(_) | Err(StorageError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let local = config.node.to_discovery_node();
        let nodes = config
            .cluster
            .seed_nodes
            .iter()
            .map(|seed| seed.to_discovery_node())
            .fold(
                DiscoveryNodes::new().with_node(local.clone()),
                |nodes, node| nodes.with_node(node),
            )
            .with_local_node(Some(local.id.clone()))
            .with_cluster_manager(Some(local.id.clone()));

        let gateway = Gateway::new(fetcher, config.gateway.required_allocation);
        let state = gateway
            .perform_state_recovery(&config.cluster.name, nodes, config.initial_settings(), &allocation)
            .await?;
        storage.save(&state.metadata).await?;

        let (cluster, _applier) = ClusterService::start(state, storage);
        let node_manager = Arc::new(NodeManager::new(
            config.heartbeat.clone(),
            cluster.clone(),
            allocation.clone(),
            shard_states.clone(),
            cluster_info.clone(),
        ));
        for seed in &config.cluster.seed_nodes {
            node_manager.track(&seed.id);
        }

        info!(
            "Cluster manager started: cluster={}, node={}, state version {}",
            config.cluster.name,
            config.node.node_id,
            cluster.state().version
        );

        Ok(Arc::new(Self {
            config,
            allocation,
            cluster,
            node_manager,
            shard_states,
            cluster_info,
            snapshots,
        }))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cluster(&self) -> &ClusterService {
        &self.cluster
    }

    pub fn node_manager(&self) -> &Arc<NodeManager> {
        &self.node_manager
    }

    /// Start heartbeat checker
    pub fn start_liveness_checker(&self) -> tokio::task::JoinHandle<()> {
        self.node_manager.clone().start_liveness_checker()
    }

    pub fn state(&self) -> Arc<ClusterState> {
        self.cluster.state()
    }

    pub fn health(&self) -> ClusterHealth {
        ClusterHealth::from_state(&self.cluster.state())
    }

    /// Routing table, optionally waiting for a version newer than `known_version`
    pub async fn routing(&self, known_version: Option<u64>, timeout: Duration) -> RoutingResponse {
        let state = match known_version {
            Some(version) => self.cluster.wait_for_change(version, timeout).await,
            None => self.cluster.state(),
        };
        RoutingResponse {
            version: state.version,
            state_uuid: state.state_uuid.clone(),
            routing_table: state.routing_table.clone(),
        }
    }

    async fn reroute(&self, reason: &'static str) -> Result<Arc<ClusterState>> {
        let allocation = self.allocation.clone();
        Ok(self
            .cluster
            .submit(reason, move |state: &ClusterState| Ok(allocation.reroute(state, reason)?))
            .await?)
    }

    // ==================== Nodes ====================

    pub async fn register_node(&self, request: RegisterNodeRequest) -> Result<RegisterResult> {
        let node = request.to_discovery_node();
        let copies = ShardStateReport::resolve_all(&node.id, request.shards, self.cluster.state().metadata());
        Ok(self.node_manager.register(node, copies).await?)
    }

    pub fn heartbeat(&self, node_id: &str) -> Result<()> {
        if self.node_manager.heartbeat(node_id) {
            Ok(())
        } else {
            Err(ManagerError::NodeNotFound(node_id.to_string()))
        }
    }

    pub async fn remove_node(&self, node_id: &str) -> Result<Arc<ClusterState>> {
        if !self.cluster.state().nodes.contains(node_id) {
            return Err(ManagerError::NodeNotFound(node_id.to_string()));
        }
        self.node_manager
            .remove_node(node_id, "node removed by operator")
            .await
            .map_err(Into::into)
    }

    pub fn nodes(&self) -> Vec<DiscoveryNode> {
        self.cluster.state().nodes.iter().cloned().collect()
    }

    pub async fn set_disk_usage(&self, node_id: &str, request: DiskUsageRequest) -> Result<Arc<ClusterState>> {
        if !self.cluster.state().nodes.contains(node_id) {
            return Err(ManagerError::NodeNotFound(node_id.to_string()));
        }
        self.cluster_info
            .set_disk_usage(node_id, DiskUsage::new(request.total_bytes, request.free_bytes));
        self.reroute("disk usage updated").await
    }

    /// Replace what a node holds on disk, then let the gateway allocator use it
    pub async fn report_shard_states(&self, node_id: &str, reports: Vec<ShardStateReport>) -> Result<Arc<ClusterState>> {
        let copies = ShardStateReport::resolve_all(node_id, reports, self.cluster.state().metadata());
        self.shard_states.report(node_id, copies);
        self.reroute("shard states reported").await
    }

    pub async fn update_snapshots(&self, update: SnapshotsUpdate) -> Result<Arc<ClusterState>> {
        let info = update.resolve(self.cluster.state().metadata());
        self.snapshots.replace(info);
        self.reroute("snapshots updated").await
    }

    // ==================== Indices ====================

    pub async fn create_index(&self, request: CreateIndexRequest) -> Result<IndexMetadata> {
        let allocation = self.allocation.clone();
        let name = request.name.clone();
        let state = self
            .cluster
            .submit(format!("create-index [{}]", request.name), move |state: &ClusterState| {
                if state.metadata().has_index(&request.name) {
                    return Err(ClusterServiceError::Rejected(format!(
                        "index [{}] already exists",
                        request.name
                    )));
                }
                let meta = IndexMetadata::builder(&request.name)
                    .settings(request.settings)
                    .build()?;
                let metadata = state.metadata().to_builder().put(meta.clone()).bump_version().build()?;
                let mut routing = state.routing_table().builder();
                routing.add_as_new(&meta, allocation.now())?;
                let created = state
                    .builder()
                    .metadata(metadata)
                    .routing_table(routing.build())
                    .build();
                Ok(allocation.reroute(&created, "index created")?)
            })
            .await?;
        info!("Index [{}] created", name);
        state
            .metadata()
            .index(&name)
            .cloned()
            .ok_or_else(|| ManagerError::Allocation(AllocationError::IndexNotFound(name)))
    }

    pub async fn delete_index(&self, name: &str) -> Result<Arc<ClusterState>> {
        let allocation = self.allocation.clone();
        let index = name.to_string();
        let state = self
            .cluster
            .submit(format!("delete-index [{}]", name), move |state: &ClusterState| {
                if !state.metadata().has_index(&index) {
                    return Err(AllocationError::IndexNotFound(index).into());
                }
                let metadata = state.metadata().to_builder().remove(&index).bump_version().build()?;
                let mut routing = state.routing_table().builder();
                routing.remove_index(&index);
                let deleted = state
                    .builder()
                    .metadata(metadata)
                    .routing_table(routing.build())
                    .build();
                Ok(allocation.reroute(&deleted, "index deleted")?)
            })
            .await?;
        self.cluster_info.remove_index(name);
        info!("Index [{}] deleted", name);
        Ok(state)
    }

    pub async fn update_replicas(&self, name: &str, replicas: u32) -> Result<Arc<ClusterState>> {
        let allocation = self.allocation.clone();
        let indices = vec![name.to_string()];
        Ok(self
            .cluster
            .submit(format!("update-replicas [{}]", name), move |state: &ClusterState| {
                let updated = allocation.update_number_of_replicas(state, &indices, replicas)?;
                Ok(allocation.reroute(&updated, "replica count changed")?)
            })
            .await?)
    }

    /// Apply a JSON merge patch to the cluster settings
    pub async fn update_settings(&self, patch: serde_json::Value) -> Result<Arc<ClusterState>> {
        let allocation = self.allocation.clone();
        Ok(self
            .cluster
            .submit("update-settings", move |state: &ClusterState| {
                let settings = state.metadata().settings.with_patch(&patch)?;
                let metadata = state
                    .metadata()
                    .to_builder()
                    .settings(settings)
                    .bump_version()
                    .build()?;
                let updated = state.builder().metadata(metadata).build();
                Ok(allocation.reroute(&updated, "cluster settings updated")?)
            })
            .await?)
    }

    // ==================== Shards ====================

    pub async fn shards_started(&self, started: Vec<StartedShardEntry>) -> Result<Arc<ClusterState>> {
        let allocation = self.allocation.clone();
        Ok(self
            .cluster
            .submit("shard-started", move |state: &ClusterState| {
                Ok(allocation.apply_started_shards(state, &started)?)
            })
            .await?)
    }

    pub async fn shards_failed(&self, request: FailedShardsRequest) -> Result<Arc<ClusterState>> {
        let allocation = self.allocation.clone();
        Ok(self
            .cluster
            .submit("shard-failed", move |state: &ClusterState| {
                Ok(allocation.apply_failed_shards(state, &request.failed, &request.stale)?)
            })
            .await?)
    }

    /// Run operator commands; a dry run computes the result without publishing it
    pub async fn reroute_commands(&self, request: RerouteRequest) -> Result<RerouteResponse> {
        if request.options.dry_run {
            let result = self.allocation.reroute_with_commands(
                &self.cluster.state(),
                &request.commands,
                request.options,
            )?;
            return Ok(RerouteResponse {
                acknowledged: false,
                state_version: result.state.version,
                explanations: result.explanations,
            });
        }

        let allocation = self.allocation.clone();
        let explanations = Arc::new(Mutex::new(Vec::new()));
        let collected = explanations.clone();
        let state = self
            .cluster
            .submit("reroute-commands", move |state: &ClusterState| {
                let result = allocation.reroute_with_commands(state, &request.commands, request.options)?;
                *collected.lock() = result.explanations;
                Ok(result.state)
            })
            .await?;
        let explanations = std::mem::take(&mut *explanations.lock());
        Ok(RerouteResponse {
            acknowledged: true,
            state_version: state.version,
            explanations,
        })
    }

    pub fn explain(&self, request: Option<ClusterAllocationExplainRequest>) -> Result<ClusterAllocationExplanation> {
        Ok(self
            .allocation
            .explain_shard_allocation(&self.cluster.state(), request.as_ref())?)
    }
}

// test_cluster.rs

use allocation::{
    AllocationCommand, AllocationCommands, AllocationDeciders, AllocationService, BalancedShardsAllocator,
    ClusterInfo, ClusterInfoService, Clock, CommandsResult, DiskUsage, EmptySnapshotsInfoService, FailedShardEntry,
    FetchResult, GatewayAllocator, ManualClock, RerouteOptions, ShardStateFetcher, StaleShard, StartedShardEntry,
};
use chrono::{Duration, Utc};
use cluster_core::{
    ClusterSettings, ClusterState, DiscoveryNode, DiscoveryNodes, IndexMetadata, IndexMetadataBuilder,
    Metadata, RoutingTableBuilder, ShardId, ShardRouting, ShardRoutingState,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Cluster info the test can change between passes
#[derive(Default)]
pub struct TestClusterInfo(pub Mutex<ClusterInfo>);

impl ClusterInfoService for TestClusterInfo {
    fn cluster_info(&self) -> ClusterInfo {
        self.0.lock().clone()
    }
}

/// Persisted shard states served to the gateway allocator
#[derive(Default)]
pub struct TestShardStates(pub Mutex<BTreeMap<ShardId, FetchResult>>);

impl TestShardStates {
    pub fn set(&self, shard_id: ShardId, result: FetchResult) {
        self.0.lock().insert(shard_id, result);
    }
}

impl ShardStateFetcher for TestShardStates {
    fn fetch(&self, shard_id: &ShardId, _nodes: &DiscoveryNodes) -> FetchResult {
        self.0
            .lock()
            .get(shard_id)
            .cloned()
            .unwrap_or(FetchResult::Data(Vec::new()))
    }
}

/// A cluster state plus the service driving it, with helpers to play recovery events
pub struct TestCluster {
    pub service: AllocationService,
    pub state: ClusterState,
    pub clock: Arc<ManualClock>,
    pub cluster_info: Arc<TestClusterInfo>,
    pub shard_states: Arc<TestShardStates>,
}

impl TestCluster {
    pub fn new(nodes: Vec<DiscoveryNode>) -> Self {
        Self::with_settings(nodes, ClusterSettings::default())
    }

    pub fn with_settings(nodes: Vec<DiscoveryNode>, settings: ClusterSettings) -> Self {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let cluster_info = Arc::new(TestClusterInfo::default());
        let shard_states = Arc::new(TestShardStates::default());
        let service = AllocationService::new(
            AllocationDeciders::with_defaults(),
            GatewayAllocator::new(shard_states.clone()),
            Arc::new(BalancedShardsAllocator::new()),
            cluster_info.clone(),
            Arc::new(EmptySnapshotsInfoService),
        )
        .with_clock(clock.clone());
        let metadata = Metadata::builder().settings(settings).build().unwrap();
        let nodes = nodes
            .into_iter()
            .fold(DiscoveryNodes::new(), |acc, n| acc.with_node(n));
        Self {
            service,
            state: ClusterState::new("test-cluster", metadata, nodes),
            clock,
            cluster_info,
            shard_states,
        }
    }

    pub fn create_index(&mut self, builder: IndexMetadataBuilder) -> IndexMetadata {
        let meta = builder.build().unwrap();
        let mut routing = self.state.routing_table().builder();
        routing.add_as_new(&meta, self.clock.now()).unwrap();
        let metadata = self.state.metadata().to_builder().put(meta.clone()).build().unwrap();
        self.state = self
            .state
            .builder()
            .metadata(metadata)
            .routing_table(routing.build())
            .build();
        meta
    }

    /// Replace the routing of every index with fresh recovery tables, as after a full restart
    pub fn restart_from_metadata(&mut self) {
        let mut routing = RoutingTableBuilder::new();
        for meta in self.state.metadata().iter() {
            routing.add_as_recovery(meta, self.clock.now()).unwrap();
        }
        self.state = self.state.builder().routing_table(routing.build()).build();
    }

    /// Reroute; true when a new state was produced
    pub fn reroute(&mut self) -> bool {
        let next = self.service.reroute(&self.state, "test").unwrap();
        let changed = next.version != self.state.version;
        self.state = next;
        changed
    }

    /// Report every initializing copy (relocation targets included) as started
    pub fn start_initializing(&mut self) -> usize {
        let entries = self.initializing_entries();
        if entries.is_empty() {
            return 0;
        }
        self.state = self.service.apply_started_shards(&self.state, &entries).unwrap();
        entries.len()
    }

    pub fn initializing_entries(&self) -> Vec<StartedShardEntry> {
        self.state
            .routing_table()
            .all_shards()
            .filter_map(|s| {
                let copy = if s.initializing() {
                    s.clone()
                } else if s.relocating() {
                    s.target_relocating_shard()?
                } else {
                    return None;
                };
                Some(StartedShardEntry {
                    shard_id: copy.shard_id.clone(),
                    allocation_id: copy.allocation_id_str()?.to_string(),
                    message: "recovery done".to_string(),
                })
            })
            .collect()
    }

    /// Reroute and start recoveries until nothing moves any more
    pub fn converge(&mut self) {
        for _ in 0..100 {
            let changed = self.reroute();
            let started = self.start_initializing();
            if !changed && started == 0 {
                return;
            }
        }
        panic!("cluster did not converge");
    }

    pub fn add_node(&mut self, node: DiscoveryNode) {
        let nodes = (*self.state.nodes).clone().with_node(node);
        self.state = self.state.builder().nodes(nodes).build();
    }

    /// Drop the node and unassign its copies, then reroute
    pub fn remove_node(&mut self, node_id: &str) {
        let nodes = (*self.state.nodes).clone().without_node(node_id);
        let state = self.state.builder().nodes(nodes).build();
        self.state = self
            .service
            .disassociate_dead_nodes(&state, true, "node left")
            .unwrap();
    }

    pub fn fail(&mut self, shard: &ShardRouting) {
        self.fail_and_mark_stale(&[shard], &[]);
    }

    /// One failed-shards request: `failed` copies fail, `stale` copies leave the in-sync set
    pub fn fail_and_mark_stale(&mut self, failed: &[&ShardRouting], stale: &[&ShardRouting]) {
        let failed: Vec<FailedShardEntry> = failed
            .iter()
            .map(|shard| FailedShardEntry {
                shard_id: shard.shard_id.clone(),
                allocation_id: shard.allocation_id_str().unwrap().to_string(),
                message: "shard failure".to_string(),
                failure: Some("simulated".to_string()),
                mark_as_stale: false,
            })
            .collect();
        let stale: Vec<StaleShard> = stale
            .iter()
            .map(|shard| StaleShard {
                shard_id: shard.shard_id.clone(),
                allocation_id: shard.allocation_id_str().unwrap().to_string(),
            })
            .collect();
        self.state = self.service.apply_failed_shards(&self.state, &failed, &stale).unwrap();
    }

    pub fn execute(&self, commands: Vec<AllocationCommand>, options: RerouteOptions) -> allocation::Result<CommandsResult> {
        self.service
            .reroute_with_commands(&self.state, &AllocationCommands::new(commands), options)
    }

    pub fn update_settings(&mut self, patch: serde_json::Value) {
        let settings = self.state.metadata().settings.with_patch(&patch).unwrap();
        let metadata = self
            .state
            .metadata()
            .to_builder()
            .settings(settings)
            .bump_version()
            .build()
            .unwrap();
        self.state = self.state.builder().metadata(metadata).build();
    }

    pub fn set_disk(&self, node_id: &str, usage: DiskUsage) {
        self.cluster_info.0.lock().disk_usages.insert(node_id.to_string(), usage);
    }

    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }

    pub fn shard_id(&self, index: &str, shard: u32) -> ShardId {
        self.state.metadata().index(index).unwrap().shard_id(shard)
    }

    pub fn copies(&self, index: &str, shard: u32) -> Vec<ShardRouting> {
        let shard_id = self.shard_id(index, shard);
        self.state
            .routing_table()
            .shard_table(&shard_id)
            .map(|t| t.shards().to_vec())
            .unwrap_or_default()
    }

    pub fn primary(&self, index: &str, shard: u32) -> ShardRouting {
        self.copies(index, shard).into_iter().find(|s| s.primary).unwrap()
    }

    pub fn replicas(&self, index: &str, shard: u32) -> Vec<ShardRouting> {
        self.copies(index, shard).into_iter().filter(|s| !s.primary).collect()
    }

    pub fn primary_term(&self, index: &str, shard: u32) -> u64 {
        self.state.metadata().index(index).unwrap().primary_term(shard)
    }

    pub fn in_sync(&self, index: &str, shard: u32) -> BTreeSet<String> {
        self.state
            .metadata()
            .index(index)
            .unwrap()
            .in_sync_allocation_ids(shard)
            .clone()
    }

    pub fn count(&self, state: ShardRoutingState) -> usize {
        self.state.routing_table().shards_with_state(state).len()
    }

    pub fn shards_on(&self, node_id: &str) -> Vec<ShardRouting> {
        self.state
            .routing_table()
            .all_shards()
            .filter(|s| s.node_id() == Some(node_id))
            .cloned()
            .collect()
    }

    /// Structural invariants every published state must satisfy
    pub fn assert_invariants(&self) {
        let metadata = self.state.metadata();
        let routing = self.state.routing_table();
        routing.validate(metadata).unwrap();

        for meta in metadata.iter().filter(|m| m.is_open()) {
            for shard in 0..meta.number_of_shards() {
                let shard_id = meta.shard_id(shard);
                let table = routing.shard_table(&shard_id).unwrap();
                assert_eq!(
                    table.size() as u32,
                    meta.copies_per_shard(),
                    "copy count of {}",
                    shard_id
                );
                assert_eq!(table.iter().filter(|s| s.primary).count(), 1, "primaries of {}", shard_id);
                assert!(
                    table.iter().filter(|s| s.primary && s.active()).count() <= 1,
                    "active primaries of {}",
                    shard_id
                );

                let mut nodes = BTreeSet::new();
                for copy in table.iter() {
                    if let Some(node) = copy.node_id() {
                        assert!(nodes.insert(node.to_string()), "two copies of {} on {}", shard_id, node);
                    }
                    if copy.relocating() {
                        let target = copy.target_relocating_shard().unwrap();
                        assert!(target.initializing());
                        assert_eq!(target.relocating_node_id.as_deref(), copy.node_id());
                        let target_node = target.node_id().unwrap().to_string();
                        assert!(nodes.insert(target_node), "relocation target of {} collides", shard_id);
                    }
                    if !copy.primary && copy.active() {
                        assert!(table.primary_active(), "active replica without active primary {}", shard_id);
                    }
                }
            }
        }
    }
}

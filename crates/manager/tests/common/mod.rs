#![allow(dead_code)]

use allocation::StartedShardEntry;
use cluster_core::{ClusterState, IndexSettings, NodeRole, ShardRouting};
use manager::config::{Config, SeedNode};
use manager::requests::{CreateIndexRequest, RegisterNodeRequest, ShardStateReport};
use manager::ClusterManager;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

pub fn config(data_dir: &Path) -> Config {
    let mut config = Config::default();
    config.cluster.name = "test-cluster".to_string();
    config.storage.data_dir = data_dir.to_path_buf();
    config
}

pub fn seed(id: &str) -> SeedNode {
    SeedNode {
        id: id.to_string(),
        address: format!("{}.local:9300", id),
        roles: BTreeSet::from([NodeRole::ClusterManager, NodeRole::Data]),
        attributes: BTreeMap::new(),
    }
}

pub fn register(id: &str) -> RegisterNodeRequest {
    register_with(id, Vec::new())
}

pub fn register_with(id: &str, shards: Vec<ShardStateReport>) -> RegisterNodeRequest {
    RegisterNodeRequest {
        node_id: id.to_string(),
        address: format!("{}.local:9300", id),
        name: None,
        roles: BTreeSet::from([NodeRole::Data]),
        attributes: BTreeMap::new(),
        shards,
    }
}

/// Index request; departed nodes are not waited for
pub fn index(name: &str, shards: u32, replicas: u32) -> CreateIndexRequest {
    CreateIndexRequest {
        name: name.to_string(),
        settings: IndexSettings {
            number_of_shards: shards,
            number_of_replicas: replicas,
            node_left_delayed_timeout_ms: 0,
            ..Default::default()
        },
    }
}

pub fn copies<'a>(state: &'a ClusterState, index: &str) -> Vec<&'a ShardRouting> {
    state
        .routing_table()
        .all_shards()
        .filter(|s| s.shard_id.index_name() == index)
        .collect()
}

pub fn initializing_entries(state: &ClusterState) -> Vec<StartedShardEntry> {
    state
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

/// Report recoveries as done until nothing is initializing any more
pub async fn converge(manager: &ClusterManager) {
    for _ in 0..50 {
        let entries = initializing_entries(&manager.state());
        if entries.is_empty() {
            return;
        }
        manager.shards_started(entries).await.unwrap();
    }
    panic!("cluster did not converge");
}

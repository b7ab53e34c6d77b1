mod common;

use cluster_core::{IndexMetadata, Metadata, RecoverySource, ShardRoutingState};
use common::{config, converge, copies, index, init_tracing, register, register_with, seed};
use manager::gateway::{GatewayError, StaticMetaStateFetcher};
use manager::requests::ShardStateReport;
use manager::{ClusterManager, ManagerError};
use std::sync::Arc;

fn metadata(version: u64, indices: &[(&str, u64)]) -> Metadata {
    indices
        .iter()
        .fold(Metadata::builder().cluster_uuid("cluster-1").version(version), |b, (name, v)| {
            b.put(
                IndexMetadata::builder(*name)
                    .uuid(format!("{}-uuid", name))
                    .version(*v)
                    .number_of_shards(1)
                    .number_of_replicas(0)
                    .build()
                    .unwrap(),
            )
        })
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_restart_recovers_primary_on_its_node() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();

    let (holder, allocation_id, term) = {
        let manager = ClusterManager::start(config(dir.path())).await.unwrap();
        manager.register_node(register("n1")).await.unwrap();
        manager.register_node(register("n2")).await.unwrap();
        manager.create_index(index("logs", 1, 0)).await.unwrap();
        converge(&manager).await;

        let state = manager.state();
        let primary = copies(&state, "logs")[0].clone();
        assert!(primary.started());
        let meta = state.metadata().index("logs").unwrap();
        assert!(meta
            .in_sync_allocation_ids(0)
            .contains(primary.allocation_id_str().unwrap()));
        (
            primary.current_node_id.clone().unwrap(),
            primary.allocation_id_str().unwrap().to_string(),
            meta.primary_term(0),
        )
    };

    // full restart: the index comes back from disk, waiting for its copy
    let manager = ClusterManager::start(config(dir.path())).await.unwrap();
    let state = manager.state();
    assert!(state.metadata().has_index("logs"));
    let primary = copies(&state, "logs")[0].clone();
    assert!(primary.unassigned());
    assert_eq!(
        primary.recovery_source,
        Some(RecoverySource::ExistingStore { force_stale: false })
    );

    let other = if holder == "n1" { "n2" } else { "n1" };
    manager.register_node(register(other)).await.unwrap();
    assert!(copies(&manager.state(), "logs")[0].unassigned());

    let report = ShardStateReport {
        index: "logs".to_string(),
        index_uuid: None,
        shard: 0,
        allocation_id: allocation_id.clone(),
        primary: true,
        primary_term: term,
        max_seq_no: 42,
        store_error: None,
    };
    manager
        .register_node(register_with(&holder, vec![report]))
        .await
        .unwrap();

    let primary = copies(&manager.state(), "logs")[0].clone();
    assert_eq!(primary.state, ShardRoutingState::Initializing);
    assert_eq!(primary.current_node_id.as_deref(), Some(holder.as_str()));
    assert_eq!(primary.allocation_id_str(), Some(allocation_id.as_str()));

    converge(&manager).await;
    assert_eq!(
        manager.state().metadata().index("logs").unwrap().primary_term(0),
        term
    );
}

#[tokio::test]
async fn test_gateway_elects_highest_metadata_version() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.cluster.seed_nodes = vec![seed("n1"), seed("n2"), seed("n3")];
    config.gateway.required_allocation = 2;

    let fetcher = StaticMetaStateFetcher::new()
        .with_state("n1", Some(metadata(5, &[("logs", 2)])))
        .with_state("n2", Some(metadata(5, &[("logs", 2)])))
        .with_state("n3", Some(metadata(7, &[("logs", 1), ("metrics", 1)])));
    let manager = ClusterManager::start_with_fetcher(config, Arc::new(fetcher))
        .await
        .unwrap();

    let state = manager.state();
    assert_eq!(state.metadata().version, 7);
    assert_eq!(state.metadata().index("logs").unwrap().version, 2);
    assert!(state.metadata().has_index("metrics"));
    assert_eq!(state.nodes.len(), 4);

    // nobody reported shard states yet
    for copy in state.routing_table().all_shards() {
        assert!(copy.unassigned());
    }
}

#[tokio::test]
async fn test_gateway_requires_enough_answers() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.cluster.seed_nodes = vec![seed("n1"), seed("n2"), seed("n3")];
    config.gateway.required_allocation = 2;

    let fetcher = StaticMetaStateFetcher::new().with_state("n1", Some(metadata(3, &[])));
    let result = ClusterManager::start_with_fetcher(config, Arc::new(fetcher)).await;

    match result {
        Err(ManagerError::Gateway(GatewayError::InsufficientResponses { found, required, total })) => {
            // the manager itself and the three seeds are asked
            assert_eq!((found, required, total), (1, 2, 4));
        }
        Err(e) => panic!("unexpected error {}", e),
        Ok(_) => panic!("recovery should fail"),
    }
}

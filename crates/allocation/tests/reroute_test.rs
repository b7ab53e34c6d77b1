mod common;

use allocation::{AllocationCommand, RerouteOptions};
use chrono::Duration;
use cluster_core::{
    AllocationStatus, ClusterHealth, ClusterSettings, HealthStatus, ShardRoutingState, UnassignedReason,
};
use common::test_cluster::TestCluster;
use common::{index, node};

#[test]
fn test_zero_data_nodes_leaves_everything_unassigned() {
    let mut cluster = TestCluster::new(vec![]);
    cluster.create_index(index("logs", 3, 1));

    assert!(cluster.reroute());
    assert_eq!(cluster.count(ShardRoutingState::Unassigned), 6);
    for shard in cluster.state.routing_table().all_shards() {
        assert_eq!(
            shard.unassigned_info.as_ref().unwrap().last_allocation_status,
            AllocationStatus::DecidersNo
        );
    }
    assert_eq!(ClusterHealth::from_state(&cluster.state).status, HealthStatus::Red);
    assert!(!cluster.reroute());
}

#[test]
fn test_single_node_keeps_replicas_unassigned() {
    let mut cluster = TestCluster::new(vec![node("n1")]);
    cluster.create_index(index("logs", 2, 1));
    cluster.converge();

    assert_eq!(cluster.count(ShardRoutingState::Started), 2);
    for shard in 0..2 {
        assert!(cluster.primary("logs", shard).active());
        let replica = cluster.replicas("logs", shard).remove(0);
        assert!(replica.unassigned());
        assert_eq!(
            replica.unassigned_info.as_ref().unwrap().last_allocation_status,
            AllocationStatus::DecidersNo
        );
    }
    assert_eq!(ClusterHealth::from_state(&cluster.state).status, HealthStatus::Yellow);
    cluster.assert_invariants();
}

#[test]
fn test_reroute_is_idempotent() {
    let mut cluster = TestCluster::new(vec![node("n1"), node("n2"), node("n3")]);
    cluster.create_index(index("logs", 4, 1));
    cluster.create_index(index("metrics", 2, 2));

    assert!(cluster.reroute());
    let first = cluster.state.clone();
    let second = cluster.service.reroute(&first, "again").unwrap();
    assert_eq!(second.version, first.version);
    assert!(second.same_content(&first));

    cluster.converge();
    let settled = cluster.state.clone();
    assert!(!cluster.reroute());
    assert!(cluster.state.same_content(&settled));
}

#[test]
fn test_throttled_shards_are_not_failures() {
    let mut settings = ClusterSettings::default();
    settings.allocation.node_initial_primaries_recoveries = 1;
    let mut cluster = TestCluster::with_settings(vec![node("n1")], settings);
    cluster.create_index(index("logs", 3, 0));

    cluster.reroute();
    assert_eq!(cluster.count(ShardRoutingState::Initializing), 1);
    let waiting: Vec<_> = cluster
        .state
        .routing_table()
        .all_shards()
        .filter(|s| s.unassigned())
        .cloned()
        .collect();
    assert_eq!(waiting.len(), 2);
    for shard in &waiting {
        let info = shard.unassigned_info.as_ref().unwrap();
        assert_eq!(info.last_allocation_status, AllocationStatus::DecidersThrottled);
        assert_eq!(info.failed_allocations, 0);
    }

    cluster.converge();
    assert_eq!(cluster.count(ShardRoutingState::Started), 3);
}

#[test]
fn test_failures_increment_retry_counter_until_max_retries() {
    let mut settings = ClusterSettings::default();
    settings.allocation.max_retries = 3;
    let mut cluster = TestCluster::with_settings(vec![node("n1"), node("n2")], settings);
    cluster.create_index(index("logs", 1, 0));
    cluster.reroute();

    let mut last = 0;
    for attempt in 1..=3 {
        let primary = cluster.primary("logs", 0);
        assert!(primary.initializing(), "attempt {}", attempt);
        cluster.fail(&primary);

        let primary = cluster.primary("logs", 0);
        let info = primary.unassigned_info.clone().unwrap();
        assert_eq!(info.reason, UnassignedReason::AllocationFailed);
        assert!(info.failed_allocations > last);
        last = info.failed_allocations;
        assert_eq!(last, attempt);

        cluster.advance(Duration::minutes(10));
        cluster.reroute();
    }

    // the counter reached the limit: no further automatic attempts
    let primary = cluster.primary("logs", 0);
    assert!(primary.unassigned());
    assert_eq!(
        primary.unassigned_info.as_ref().unwrap().last_allocation_status,
        AllocationStatus::DecidersNo
    );

    let result = cluster
        .execute(
            Vec::<AllocationCommand>::new(),
            RerouteOptions {
                retry_failed: true,
                ..Default::default()
            },
        )
        .unwrap();
    cluster.state = result.state;
    assert!(cluster.primary("logs", 0).initializing());
}

#[test]
fn test_failed_shard_backs_off_before_retry() {
    let mut cluster = TestCluster::new(vec![node("n1")]);
    cluster.create_index(index("logs", 1, 0));
    cluster.reroute();
    let primary = cluster.primary("logs", 0);
    cluster.fail(&primary);

    let primary = cluster.primary("logs", 0);
    assert!(primary.unassigned());
    assert_eq!(
        primary.unassigned_info.as_ref().unwrap().last_allocation_status,
        AllocationStatus::DecidersThrottled
    );

    cluster.advance(Duration::seconds(1));
    cluster.reroute();
    assert!(cluster.primary("logs", 0).unassigned());

    cluster.advance(Duration::seconds(10));
    cluster.reroute();
    assert!(cluster.primary("logs", 0).initializing());
}

#[test]
fn test_node_left_replica_waits_for_delay() {
    let mut cluster = TestCluster::new(vec![node("n1"), node("n2"), node("n3")]);
    cluster.create_index(index("logs", 1, 1).node_left_delayed_timeout_ms(60_000));
    cluster.converge();

    let replica_node = cluster.replicas("logs", 0)[0].node_id().unwrap().to_string();
    cluster.remove_node(&replica_node);

    let replica = cluster.replicas("logs", 0).remove(0);
    let info = replica.unassigned_info.clone().unwrap();
    assert_eq!(info.reason, UnassignedReason::NodeLeft);
    assert!(info.delayed);
    assert_eq!(info.failed_allocations, 0);
    assert_eq!(info.last_allocation_status, AllocationStatus::DelayedAllocation);
    assert_eq!(
        ClusterHealth::from_state(&cluster.state).counts.delayed_unassigned_shards,
        1
    );

    cluster.advance(Duration::seconds(30));
    cluster.reroute();
    assert!(cluster.replicas("logs", 0)[0].unassigned());

    cluster.advance(Duration::seconds(31));
    cluster.reroute();
    let replica = cluster.replicas("logs", 0).remove(0);
    assert!(replica.initializing());
    assert_ne!(replica.node_id(), Some(replica_node.as_str()));
}

#[test]
fn test_returning_node_gets_its_replica_back() {
    let mut cluster = TestCluster::new(vec![node("n1"), node("n2"), node("n3")]);
    let meta = cluster.create_index(index("logs", 1, 1).node_left_delayed_timeout_ms(60_000));
    cluster.converge();

    let replica = cluster.replicas("logs", 0).remove(0);
    let replica_node = replica.node_id().unwrap().to_string();
    cluster.remove_node(&replica_node);

    // the node comes back holding its in-sync copy
    cluster.shard_states.set(
        meta.shard_id(0),
        allocation::FetchResult::Data(vec![allocation::NodeShardState {
            node_id: replica_node.clone(),
            allocation_id: replica.allocation_id_str().map(str::to_string),
            primary: false,
            primary_term: cluster.primary_term("logs", 0),
            max_seq_no: 42,
            store_error: None,
        }]),
    );
    cluster.add_node(node(&replica_node));
    cluster.reroute();

    let replica = cluster.replicas("logs", 0).remove(0);
    assert!(replica.initializing());
    assert_eq!(replica.node_id(), Some(replica_node.as_str()));
}

#[test]
fn test_auto_expand_replicas_follow_nodes() {
    let mut cluster = TestCluster::new(vec![node("n1"), node("n2"), node("n3")]);
    cluster.create_index(index("system", 1, 0).auto_expand_replicas(Some("0-all".parse().unwrap())));

    cluster.converge();
    assert_eq!(cluster.state.metadata().index("system").unwrap().number_of_replicas(), 2);
    assert_eq!(cluster.count(ShardRoutingState::Started), 3);

    cluster.add_node(node("n4"));
    cluster.converge();
    assert_eq!(cluster.state.metadata().index("system").unwrap().number_of_replicas(), 3);
    assert_eq!(cluster.count(ShardRoutingState::Started), 4);

    cluster.remove_node("n4");
    cluster.remove_node("n3");
    cluster.converge();
    assert_eq!(cluster.state.metadata().index("system").unwrap().number_of_replicas(), 1);
    cluster.assert_invariants();
}

#[test]
fn test_new_node_triggers_rebalance() {
    let mut cluster = TestCluster::new(vec![node("n1"), node("n2")]);
    cluster.create_index(index("logs", 6, 0));
    cluster.converge();
    assert_eq!(cluster.shards_on("n1").len(), 3);

    cluster.add_node(node("n3"));
    cluster.converge();
    for id in ["n1", "n2", "n3"] {
        assert_eq!(cluster.shards_on(id).len(), 2, "node {}", id);
    }
    cluster.assert_invariants();
}

#[test]
fn test_excluded_node_is_drained() {
    let mut cluster = TestCluster::new(vec![node("n1"), node("n2"), node("n3")]);
    cluster.create_index(index("logs", 3, 1));
    cluster.converge();
    assert!(!cluster.shards_on("n3").is_empty());

    cluster.update_settings(serde_json::json!({
        "allocation": {"filters": {"exclude": {"_id": "n3"}}}
    }));
    cluster.converge();
    assert!(cluster.shards_on("n3").is_empty());
    assert_eq!(cluster.count(ShardRoutingState::Started), 6);
    cluster.assert_invariants();
}

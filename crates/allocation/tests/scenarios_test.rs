mod common;

use allocation::{AllocationCommand, AllocationError, DiskUsage, RerouteOptions};
use chrono::Duration;
use cluster_core::{AllocationStatus, NodeFilters, ShardRouting, ShardRoutingState};
use common::test_cluster::TestCluster;
use common::{index, init_tracing, node, node_in_zone};
use std::collections::{BTreeMap, BTreeSet};

#[test]
fn test_two_shards_one_replica_on_three_nodes() {
    init_tracing();
    let mut cluster = TestCluster::new(vec![node("n1"), node("n2"), node("n3")]);
    cluster.create_index(index("logs", 2, 1));

    cluster.reroute();
    assert_eq!(cluster.state.routing_table().all_shards().count(), 4);
    assert_eq!(cluster.count(ShardRoutingState::Initializing), 2);
    let primary_nodes: BTreeSet<String> = (0..2)
        .map(|s| cluster.primary("logs", s).node_id().unwrap().to_string())
        .collect();
    assert_eq!(primary_nodes.len(), 2, "primaries share a node");

    cluster.converge();
    assert_eq!(cluster.state.routing_table().all_shards().count(), 4);
    assert_eq!(cluster.count(ShardRoutingState::Started), 4);
    for shard in 0..2 {
        let primary = cluster.primary("logs", shard);
        let replicas = cluster.replicas("logs", shard);
        assert_eq!(replicas.len(), 1);
        assert_ne!(replicas[0].node_id(), primary.node_id());
        assert_eq!(cluster.in_sync("logs", shard).len(), 2);
    }
    cluster.assert_invariants();
}

#[test]
fn test_failed_primary_promotes_in_sync_replica() {
    init_tracing();
    let mut cluster = TestCluster::new(vec![node("n1"), node("n2"), node("n3")]);
    cluster.create_index(index("logs", 1, 1));
    cluster.converge();

    let term_before = cluster.primary_term("logs", 0);
    let old_primary = cluster.primary("logs", 0);
    let replica = cluster.replicas("logs", 0).remove(0);

    cluster.fail(&old_primary);
    let promoted = cluster.primary("logs", 0);
    assert!(promoted.active());
    assert_eq!(promoted.allocation_id_str(), replica.allocation_id_str());
    assert_eq!(cluster.primary_term("logs", 0), term_before + 1);
    assert!(!cluster
        .in_sync("logs", 0)
        .contains(old_primary.allocation_id_str().unwrap()));

    // further passes do not touch the term again; the failed copy waits out its backoff
    cluster.reroute();
    cluster.advance(Duration::seconds(10));
    cluster.converge();
    assert_eq!(cluster.primary_term("logs", 0), term_before + 1);
    assert_eq!(cluster.count(ShardRoutingState::Started), 2);
    cluster.assert_invariants();
}

fn assert_stale_replica_not_promoted(cluster: &TestCluster, old_primary: &ShardRouting, stale: &ShardRouting) {
    let primary = cluster.primary("logs", 0);
    assert!(primary.unassigned());
    assert_ne!(primary.allocation_id_str(), stale.allocation_id_str());
    for replica in cluster.replicas("logs", 0) {
        assert!(!replica.active(), "replica {} serves without a primary", replica);
    }
    let in_sync = cluster.in_sync("logs", 0);
    assert!(!in_sync.contains(stale.allocation_id_str().unwrap()));
    assert!(in_sync.contains(old_primary.allocation_id_str().unwrap()));
    cluster.assert_invariants();
}

#[test]
fn test_stale_replica_is_not_promoted() {
    init_tracing();
    let mut cluster = TestCluster::new(vec![node("n1"), node("n2")]);
    cluster.create_index(index("logs", 1, 1));
    cluster.converge();
    let old_primary = cluster.primary("logs", 0);
    let replica = cluster.replicas("logs", 0).remove(0);

    cluster.fail_and_mark_stale(&[], &[&replica]);
    assert!(cluster.replicas("logs", 0)[0].active());
    assert_eq!(
        cluster.in_sync("logs", 0),
        BTreeSet::from([old_primary.allocation_id_str().unwrap().to_string()])
    );

    cluster.fail(&old_primary);
    assert_stale_replica_not_promoted(&cluster, &old_primary, &replica);
}

#[test]
fn test_replica_marked_stale_with_primary_failure_is_not_promoted() {
    let mut cluster = TestCluster::new(vec![node("n1"), node("n2")]);
    cluster.create_index(index("logs", 1, 1));
    cluster.converge();
    let old_primary = cluster.primary("logs", 0);
    let replica = cluster.replicas("logs", 0).remove(0);

    cluster.fail_and_mark_stale(&[&old_primary], &[&replica]);
    assert_stale_replica_not_promoted(&cluster, &old_primary, &replica);
}

#[test]
fn test_primary_node_removed_then_failed() {
    let mut cluster = TestCluster::new(vec![node("n1"), node("n2"), node("n3")]);
    cluster.create_index(index("logs", 1, 1));
    cluster.converge();
    let term_before = cluster.primary_term("logs", 0);
    let primary_node = cluster.primary("logs", 0).node_id().unwrap().to_string();

    cluster.remove_node(&primary_node);

    let primary = cluster.primary("logs", 0);
    assert!(primary.active());
    assert_ne!(primary.node_id(), Some(primary_node.as_str()));
    assert_eq!(cluster.primary_term("logs", 0), term_before + 1);
    cluster.assert_invariants();
}

#[test]
fn test_move_rejected_by_disk_watermark_unless_forced() {
    let mut cluster = TestCluster::new(vec![node("n1"), node("n2"), node("n3")]);
    cluster.create_index(index("logs", 1, 0));
    cluster.converge();

    let source = cluster.primary("logs", 0).node_id().unwrap().to_string();
    let target = ["n1", "n2", "n3"]
        .into_iter()
        .find(|n| *n != source)
        .unwrap()
        .to_string();
    cluster.set_disk(&target, DiskUsage::new(100, 1));

    let command = AllocationCommand::Move {
        index: "logs".to_string(),
        shard: 0,
        from_node: source.clone(),
        to_node: target.clone(),
    };
    let before = cluster.state.clone();
    match cluster.execute(vec![command.clone()], RerouteOptions::default()) {
        Err(AllocationError::CommandRejected { decision, .. }) => assert!(decision.is_no()),
        other => panic!("expected rejection, got {:?}", other.map(|r| r.state.version)),
    }
    assert!(cluster.state.same_content(&before));
    assert_eq!(cluster.primary("logs", 0).state, ShardRoutingState::Started);

    let result = cluster
        .execute(
            vec![command],
            RerouteOptions {
                force: true,
                ..Default::default()
            },
        )
        .unwrap();
    cluster.state = result.state;
    let moving = cluster.primary("logs", 0);
    assert_eq!(moving.state, ShardRoutingState::Relocating);
    assert_eq!(moving.node_id(), Some(source.as_str()));
    assert_eq!(moving.relocating_node_id.as_deref(), Some(target.as_str()));
    cluster.assert_invariants();
}

#[test]
fn test_filtered_zone_assigned_once_filter_removed() {
    let mut cluster = TestCluster::new(vec![node_in_zone("n1", "a"), node_in_zone("n2", "b")]);
    cluster.update_settings(serde_json::json!({
        "allocation": {"filters": {"exclude": {"zone": "b"}}}
    }));
    cluster.create_index(index("zoned", 1, 0).filters(NodeFilters {
        require: BTreeMap::from([("zone".to_string(), "b".to_string())]),
        ..Default::default()
    }));

    cluster.reroute();
    let primary = cluster.primary("zoned", 0);
    assert!(primary.unassigned());
    assert_eq!(
        primary.unassigned_info.as_ref().unwrap().last_allocation_status,
        AllocationStatus::DecidersNo
    );

    cluster.update_settings(serde_json::json!({
        "allocation": {"filters": {"exclude": null}}
    }));
    cluster.reroute();
    let primary = cluster.primary("zoned", 0);
    assert_eq!(primary.state, ShardRoutingState::Initializing);
    assert_eq!(primary.node_id(), Some("n2"));
}

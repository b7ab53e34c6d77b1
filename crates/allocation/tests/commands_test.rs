mod common;

use allocation::{
    AllocationCommand, AllocationDecision, AllocationError, ClusterAllocationExplainRequest, DiskUsage,
    FetchResult, NodeShardState, RerouteOptions,
};
use cluster_core::{AllocationStatus, ClusterSettings, EnableAllocation, ShardRoutingState};
use common::test_cluster::TestCluster;
use common::{index, init_tracing, node};

fn other_node<'a>(nodes: &[&'a str], not: &str) -> &'a str {
    nodes.iter().copied().find(|n| *n != not).unwrap()
}

#[test]
fn test_move_then_cancel_relocation() {
    init_tracing();
    let mut cluster = TestCluster::new(vec![node("n1"), node("n2")]);
    cluster.create_index(index("logs", 1, 0));
    cluster.converge();

    let source = cluster.primary("logs", 0).node_id().unwrap().to_string();
    let target = other_node(&["n1", "n2"], &source).to_string();
    let result = cluster
        .execute(
            vec![AllocationCommand::Move {
                index: "logs".to_string(),
                shard: 0,
                from_node: source.clone(),
                to_node: target.clone(),
            }],
            RerouteOptions::default(),
        )
        .unwrap();
    cluster.state = result.state;
    assert!(cluster.primary("logs", 0).relocating());

    let result = cluster
        .execute(
            vec![AllocationCommand::Cancel {
                index: "logs".to_string(),
                shard: 0,
                node: source.clone(),
                allow_primary: false,
            }],
            RerouteOptions::default(),
        )
        .unwrap();
    cluster.state = result.state;
    let primary = cluster.primary("logs", 0);
    assert_eq!(primary.state, ShardRoutingState::Started);
    assert_eq!(primary.node_id(), Some(source.as_str()));
    assert!(cluster.shards_on(&target).is_empty());
    cluster.assert_invariants();
}

#[test]
fn test_failed_relocation_target_cancels_without_counting_failure() {
    let mut cluster = TestCluster::new(vec![node("n1"), node("n2")]);
    cluster.create_index(index("logs", 1, 0));
    cluster.converge();

    let source = cluster.primary("logs", 0).node_id().unwrap().to_string();
    let target = other_node(&["n1", "n2"], &source).to_string();
    let result = cluster
        .execute(
            vec![AllocationCommand::Move {
                index: "logs".to_string(),
                shard: 0,
                from_node: source.clone(),
                to_node: target.clone(),
            }],
            RerouteOptions::default(),
        )
        .unwrap();
    cluster.state = result.state;
    let relocation_target = cluster.primary("logs", 0).target_relocating_shard().unwrap();
    let term_before = cluster.primary_term("logs", 0);

    cluster.fail(&relocation_target);

    // the source keeps serving, nothing waits for a retry
    let primary = cluster.primary("logs", 0);
    assert_eq!(primary.state, ShardRoutingState::Started);
    assert_eq!(primary.node_id(), Some(source.as_str()));
    assert!(primary.relocating_node_id.is_none());
    assert_eq!(primary.failed_allocations(), 0);
    assert!(primary.unassigned_info.is_none());
    assert!(cluster.shards_on(&target).is_empty());
    assert_eq!(cluster.count(ShardRoutingState::Unassigned), 0);
    assert_eq!(cluster.primary_term("logs", 0), term_before);
    cluster.assert_invariants();
}

#[test]
fn test_cancel_primary_requires_allow_primary() {
    let mut cluster = TestCluster::new(vec![node("n1"), node("n2")]);
    cluster.create_index(index("logs", 1, 1));
    cluster.converge();
    let term_before = cluster.primary_term("logs", 0);
    let primary = cluster.primary("logs", 0);
    let replica = cluster.replicas("logs", 0).remove(0);
    let cancel = |allow_primary| AllocationCommand::Cancel {
        index: "logs".to_string(),
        shard: 0,
        node: primary.node_id().unwrap().to_string(),
        allow_primary,
    };

    match cluster.execute(vec![cancel(false)], RerouteOptions::default()) {
        Err(AllocationError::IllegalCommand { command, .. }) => assert_eq!(command, "cancel"),
        other => panic!("expected illegal command, got {:?}", other.map(|r| r.state.version)),
    }

    let result = cluster.execute(vec![cancel(true)], RerouteOptions::default()).unwrap();
    cluster.state = result.state;
    let promoted = cluster.primary("logs", 0);
    assert!(promoted.active());
    assert_eq!(promoted.allocation_id_str(), replica.allocation_id_str());
    assert_eq!(cluster.primary_term("logs", 0), term_before + 1);
    // the cancelled copy comes back as a replica right away
    assert!(cluster.replicas("logs", 0)[0].initializing());
    cluster.assert_invariants();
}

#[test]
fn test_allocate_replica_ignores_disabled_allocation() {
    let mut settings = ClusterSettings::default();
    settings.allocation.enable = EnableAllocation::Primaries;
    let mut cluster = TestCluster::with_settings(vec![node("n1"), node("n2")], settings);
    cluster.create_index(index("logs", 1, 1));
    cluster.converge();

    let replica = cluster.replicas("logs", 0).remove(0);
    assert!(replica.unassigned());
    assert_eq!(
        replica.unassigned_info.as_ref().unwrap().last_allocation_status,
        AllocationStatus::DecidersNo
    );

    let primary_node = cluster.primary("logs", 0).node_id().unwrap().to_string();
    let target = other_node(&["n1", "n2"], &primary_node).to_string();
    let result = cluster
        .execute(
            vec![AllocationCommand::AllocateReplica {
                index: "logs".to_string(),
                shard: 0,
                node: target.clone(),
            }],
            RerouteOptions::default(),
        )
        .unwrap();
    cluster.state = result.state;
    let replica = cluster.replicas("logs", 0).remove(0);
    assert!(replica.initializing());
    assert_eq!(replica.node_id(), Some(target.as_str()));

    // never onto the node already holding the primary
    cluster.converge();
    let err = cluster
        .execute(
            vec![AllocationCommand::AllocateReplica {
                index: "logs".to_string(),
                shard: 0,
                node: primary_node,
            }],
            RerouteOptions::default(),
        )
        .unwrap_err();
    assert!(matches!(err, AllocationError::IllegalCommand { .. }));
}

#[test]
fn test_allocate_replica_needs_active_primary() {
    let mut cluster = TestCluster::new(vec![]);
    cluster.create_index(index("logs", 1, 1));
    cluster.add_node(node("n1"));

    let err = cluster
        .execute(
            vec![AllocationCommand::AllocateReplica {
                index: "logs".to_string(),
                shard: 0,
                node: "n1".to_string(),
            }],
            RerouteOptions::default(),
        )
        .unwrap_err();
    assert!(matches!(err, AllocationError::IllegalCommand { .. }), "{}", err);
}

#[test]
fn test_unknown_targets_are_rejected() {
    let mut cluster = TestCluster::new(vec![node("n1")]);
    cluster.create_index(index("logs", 1, 0));
    cluster.converge();

    let err = cluster
        .execute(
            vec![AllocationCommand::Cancel {
                index: "missing".to_string(),
                shard: 0,
                node: "n1".to_string(),
                allow_primary: true,
            }],
            RerouteOptions::default(),
        )
        .unwrap_err();
    assert!(matches!(err, AllocationError::IndexNotFound(_)));

    let err = cluster
        .execute(
            vec![AllocationCommand::Cancel {
                index: "logs".to_string(),
                shard: 3,
                node: "n1".to_string(),
                allow_primary: true,
            }],
            RerouteOptions::default(),
        )
        .unwrap_err();
    assert!(matches!(err, AllocationError::ShardNotFound(_)));

    let err = cluster
        .execute(
            vec![AllocationCommand::Move {
                index: "logs".to_string(),
                shard: 0,
                from_node: "n1".to_string(),
                to_node: "n9".to_string(),
            }],
            RerouteOptions::default(),
        )
        .unwrap_err();
    assert!(matches!(err, AllocationError::NodeNotFound(_)));
}

#[test]
fn test_explain_mode_reports_rejection_without_error() {
    let mut cluster = TestCluster::new(vec![node("n1"), node("n2")]);
    cluster.create_index(index("logs", 1, 0));
    cluster.converge();
    let source = cluster.primary("logs", 0).node_id().unwrap().to_string();
    let target = other_node(&["n1", "n2"], &source).to_string();
    cluster.set_disk(&target, DiskUsage::new(100, 2));

    let before = cluster.state.clone();
    let result = cluster
        .execute(
            vec![AllocationCommand::Move {
                index: "logs".to_string(),
                shard: 0,
                from_node: source,
                to_node: target,
            }],
            RerouteOptions {
                explain: true,
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(result.explanations.len(), 1);
    let explanation = &result.explanations[0];
    assert!(explanation.decisions.is_no());
    assert!(explanation
        .decisions
        .singles()
        .iter()
        .any(|d| d.label() == Some("disk_threshold") && d.is_no()));
    assert!(result.state.same_content(&before));
}

#[test]
fn test_allocate_stale_primary_after_copy_lost() {
    init_tracing();
    let mut cluster = TestCluster::new(vec![node("n1"), node("n2")]);
    let meta = cluster.create_index(index("logs", 1, 0));
    cluster.converge();
    let lost = cluster.primary("logs", 0);
    let lost_node = lost.node_id().unwrap().to_string();
    let survivor = other_node(&["n1", "n2"], &lost_node).to_string();

    // an old copy sits on the surviving node, outside the in-sync set
    cluster.shard_states.set(
        meta.shard_id(0),
        FetchResult::Data(vec![NodeShardState {
            node_id: survivor.clone(),
            allocation_id: Some("stale-copy".to_string()),
            primary: false,
            primary_term: 1,
            max_seq_no: 10,
            store_error: None,
        }]),
    );
    cluster.remove_node(&lost_node);
    let primary = cluster.primary("logs", 0);
    assert!(primary.unassigned());
    assert_eq!(
        primary.unassigned_info.as_ref().unwrap().last_allocation_status,
        AllocationStatus::NoValidShardCopy
    );
    let term_before = cluster.primary_term("logs", 0);

    let stale = |accept_data_loss| AllocationCommand::AllocateStalePrimary {
        index: "logs".to_string(),
        shard: 0,
        node: survivor.clone(),
        accept_data_loss,
    };
    let err = cluster.execute(vec![stale(false)], RerouteOptions::default()).unwrap_err();
    assert!(err.to_string().contains("accept_data_loss"));

    let result = cluster.execute(vec![stale(true)], RerouteOptions::default()).unwrap();
    cluster.state = result.state;
    let primary = cluster.primary("logs", 0);
    assert!(primary.initializing());
    assert_eq!(primary.node_id(), Some(survivor.as_str()));
    assert!(cluster.primary_term("logs", 0) > term_before);

    cluster.converge();
    let primary = cluster.primary("logs", 0);
    assert!(primary.started());
    let in_sync = cluster.in_sync("logs", 0);
    assert_eq!(in_sync.len(), 1);
    assert!(in_sync.contains(primary.allocation_id_str().unwrap()));
    assert!(!in_sync.contains(lost.allocation_id_str().unwrap()));
}

#[test]
fn test_allocate_empty_primary_discards_data() {
    let mut cluster = TestCluster::new(vec![node("n1"), node("n2")]);
    cluster.create_index(index("logs", 1, 0));
    cluster.converge();
    let lost = cluster.primary("logs", 0);
    let lost_node = lost.node_id().unwrap().to_string();
    let survivor = other_node(&["n1", "n2"], &lost_node).to_string();
    cluster.remove_node(&lost_node);
    assert!(cluster.primary("logs", 0).unassigned());

    let result = cluster
        .execute(
            vec![AllocationCommand::AllocateEmptyPrimary {
                index: "logs".to_string(),
                shard: 0,
                node: survivor.clone(),
                accept_data_loss: true,
            }],
            RerouteOptions {
                explain: true,
                ..Default::default()
            },
        )
        .unwrap();
    assert!(result.explanations[0].decisions.is_yes());
    cluster.state = result.state;
    cluster.converge();

    let primary = cluster.primary("logs", 0);
    assert!(primary.started());
    assert_eq!(primary.node_id(), Some(survivor.as_str()));
    let in_sync = cluster.in_sync("logs", 0);
    assert_eq!(in_sync.len(), 1);
    assert!(in_sync.contains(primary.allocation_id_str().unwrap()));
}

#[test]
fn test_explain_unassigned_replica_on_single_node() {
    let mut cluster = TestCluster::new(vec![node("n1")]);
    cluster.create_index(index("logs", 1, 1));
    cluster.converge();

    let explanation = cluster
        .service
        .explain_shard_allocation(
            &cluster.state,
            Some(&ClusterAllocationExplainRequest {
                index: "logs".to_string(),
                shard: 0,
                primary: false,
                current_node: None,
                include_yes_decisions: false,
            }),
        )
        .unwrap();
    assert_eq!(explanation.current_state, ShardRoutingState::Unassigned);
    let allocate = explanation.decision.allocate.unwrap();
    assert_eq!(allocate.decision, AllocationDecision::No);
    let n1 = allocate.node_decisions.iter().find(|r| r.node_id == "n1").unwrap();
    assert!(n1
        .deciders
        .singles()
        .iter()
        .any(|d| d.label() == Some("same_shard") && d.is_no()));
    assert!(n1.deciders.singles().iter().all(|d| !d.is_yes()));

    // without a request the first unassigned copy is picked
    let first = cluster.service.explain_shard_allocation(&cluster.state, None).unwrap();
    assert!(!first.primary);

    // and the primary explains where it stays
    let primary = cluster
        .service
        .explain_shard_allocation(
            &cluster.state,
            Some(&ClusterAllocationExplainRequest {
                index: "logs".to_string(),
                shard: 0,
                primary: true,
                current_node: None,
                include_yes_decisions: true,
            }),
        )
        .unwrap();
    assert_eq!(primary.current_node.as_deref(), Some("n1"));
    assert!(primary.decision.move_decision.is_some());
    let json = serde_json::to_value(&primary).unwrap();
    assert_eq!(json["current_state"], "STARTED");
}

#[test]
fn test_explain_without_unassigned_copies_fails() {
    let mut cluster = TestCluster::new(vec![node("n1")]);
    cluster.create_index(index("logs", 1, 0));
    cluster.converge();

    let err = cluster.service.explain_shard_allocation(&cluster.state, None).unwrap_err();
    assert!(matches!(err, AllocationError::IllegalArgument(_)));
}

//! Stories of a cluster going to sleep and waking up again

use std::sync::Arc;

use dormant::autoscaler::AutoscalerManaged;
use dormant::cluster::{NodeGroupScaling, Readiness};
use dormant::eviction::EvictionOutcome;
use dormant::graph::ServiceStatus;
use dormant::nodegroup::NodeGroupStatus;
use dormant::orchestrator::{Action, OperationStatus, OrchestratorState};
use dormant::state::ResourceKind;

use super::fake::{fast_config, file_store, orchestrator, service, FakeCluster};

fn scaling(min: u32, max: u32, desired: u32) -> NodeGroupScaling {
    NodeGroupScaling { min, max, desired }
}

/// Cluster `c1`: node group `ng-a` (2, 10, 3), autoscaler at one replica,
/// two application pods and a DaemonSet pod on the group's nodes
fn sample_cluster() -> FakeCluster {
    FakeCluster::new()
        .with_autoscaler(1)
        .with_node_group("ng-a", 2, 10, 3)
        .with_pod("ng-a-0", "web-0")
        .with_pod("ng-a-1", "web-1")
        .with_daemonset_pod("ng-a-0", "kube-proxy-abc")
        .with_deployment("apps", "db", 1)
        .with_deployment("apps", "api", 2)
        .with_webhook("policy", true)
}

// =============================================================================
// Full cycle
// =============================================================================

/// Story: the nightly stop and morning start of a typical cluster
///
/// Stop disables the autoscaler, drains `ng-a` and zeroes it. Start with
/// `--min-nodes 2` brings `ng-a` back, waits for webhooks and for `db`
/// before `api`, then re-enables the autoscaler and forgets every capture.
#[tokio::test]
async fn story_stop_then_start_restores_the_cluster() {
    let dir = tempfile::tempdir().unwrap();
    let store = file_store(dir.path());
    let fake = Arc::new(sample_cluster());
    let mut config = fast_config();
    config.dependencies = vec![service("api", &["db"]), service("db", &[])];

    // Chapter 1: stop
    let op = orchestrator(fake.clone(), store.clone(), config.clone(), false)
        .run(Action::Stop, None)
        .await;
    assert_eq!(op.status, OperationStatus::Succeeded, "error: {:?}", op.error);
    assert_eq!(op.state, OrchestratorState::Done);

    let autoscaler = op.autoscaler.as_ref().unwrap();
    assert_eq!(autoscaler.managed, AutoscalerManaged::Disabled);
    assert_eq!(autoscaler.replicas, Some(1));
    assert_eq!(fake.replicas("kube-system", "cluster-autoscaler"), Some(0));
    assert_eq!(store.list("c1", ResourceKind::Autoscaler).unwrap().len(), 1);

    assert_eq!(fake.node_group("ng-a"), Some(scaling(0, 10, 0)));
    assert_eq!(op.node_groups[0].status, NodeGroupStatus::ScaledDown);
    assert_eq!(op.node_groups[0].before, Some(scaling(2, 10, 3)));

    let mut evicted: Vec<_> = op.evictions.iter().map(|r| r.name.as_str()).collect();
    evicted.sort();
    assert_eq!(evicted, vec!["web-0", "web-1"]);
    assert!(op
        .evictions
        .iter()
        .all(|r| r.outcome == EvictionOutcome::Evicted));
    assert!(!fake.state().evicted.contains(&"kube-proxy-abc".to_string()));

    let states: Vec<_> = op.transitions.iter().map(|t| t.state).collect();
    assert_eq!(
        states,
        vec![
            OrchestratorState::Init,
            OrchestratorState::AutoscalerDisabling,
            OrchestratorState::PodEvicting,
            OrchestratorState::ScalingDown,
            OrchestratorState::Done,
        ]
    );

    // Chapter 2: start with a minimum override, from a fresh process
    let store = file_store(dir.path());
    let op = orchestrator(fake.clone(), store.clone(), config, false)
        .run(Action::Start, Some(2))
        .await;
    assert_eq!(op.status, OperationStatus::Succeeded, "error: {:?}", op.error);

    assert_eq!(fake.node_group("ng-a"), Some(scaling(2, 10, 3)));
    assert_eq!(op.node_groups[0].status, NodeGroupStatus::Restored);
    assert!(op.bootstrap.as_ref().unwrap().satisfied);
    assert_eq!(op.bootstrap.as_ref().unwrap().requested_nodes, 3);
    assert!(op.webhooks.iter().all(|w| w.readiness == Readiness::Ready));

    let order: Vec<_> = op.dependencies.iter().map(|d| d.id.as_str()).collect();
    assert_eq!(order, vec!["db", "api"]);
    assert!(op
        .dependencies
        .iter()
        .all(|d| d.status == ServiceStatus::Ready));

    assert_eq!(
        op.autoscaler.as_ref().unwrap().managed,
        AutoscalerManaged::Restored
    );
    assert_eq!(fake.replicas("kube-system", "cluster-autoscaler"), Some(1));
    assert!(store.list("c1", ResourceKind::Autoscaler).unwrap().is_empty());
    assert!(store.list("c1", ResourceKind::NodeGroup).unwrap().is_empty());

    let states: Vec<_> = op.transitions.iter().map(|t| t.state).collect();
    assert_eq!(
        states,
        vec![
            OrchestratorState::Init,
            OrchestratorState::BootstrapValidating,
            OrchestratorState::ScalingUp,
            OrchestratorState::WebhookWaiting,
            OrchestratorState::DependencyWaiting,
            OrchestratorState::AutoscalerRestoring,
            OrchestratorState::Done,
        ]
    );
}

/// Story: a cluster without an autoscaler
///
/// Absence is not an error: both phases report `not_found` and no
/// autoscaler capture is ever written.
#[tokio::test]
async fn story_cluster_without_autoscaler() {
    let dir = tempfile::tempdir().unwrap();
    let store = file_store(dir.path());
    let fake = Arc::new(FakeCluster::new().with_node_group("ng-a", 1, 3, 2));

    let op = orchestrator(fake.clone(), store.clone(), fast_config(), false)
        .run(Action::Stop, None)
        .await;
    assert_eq!(op.status, OperationStatus::Succeeded);
    assert_eq!(
        op.autoscaler.as_ref().unwrap().managed,
        AutoscalerManaged::NotFound
    );
    assert!(store.list("c1", ResourceKind::Autoscaler).unwrap().is_empty());

    let op = orchestrator(fake.clone(), store.clone(), fast_config(), false)
        .run(Action::Start, None)
        .await;
    assert_eq!(op.status, OperationStatus::Succeeded);
    assert_eq!(
        op.autoscaler.as_ref().unwrap().managed,
        AutoscalerManaged::NotFound
    );
    assert_eq!(fake.node_group("ng-a"), Some(scaling(1, 3, 2)));
}

/// Story: start is run twice
///
/// The second start finds nothing captured: every node group is skipped,
/// the autoscaler is left alone, and the cluster sees no mutation.
#[tokio::test]
async fn story_second_start_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let store = file_store(dir.path());
    let fake = Arc::new(sample_cluster());

    orchestrator(fake.clone(), store.clone(), fast_config(), false)
        .run(Action::Stop, None)
        .await;
    let first = orchestrator(fake.clone(), store.clone(), fast_config(), false)
        .run(Action::Start, None)
        .await;
    assert_eq!(first.status, OperationStatus::Succeeded);

    let mutations = fake.mutations();
    let second = orchestrator(fake.clone(), store.clone(), fast_config(), false)
        .run(Action::Start, None)
        .await;
    assert_eq!(second.status, OperationStatus::Succeeded);
    assert_eq!(fake.mutations(), mutations);
    assert_eq!(
        second.autoscaler.as_ref().unwrap().managed,
        AutoscalerManaged::NotFound
    );
    assert_eq!(second.node_groups[0].status, NodeGroupStatus::Skipped);
    assert!(second.bootstrap.is_none());
    assert_eq!(fake.replicas("kube-system", "cluster-autoscaler"), Some(1));
}

/// Story: a node group that was already at zero with `max = 0`
///
/// Scale-down still writes `max = 1`, and start gives back the exact
/// original bounds.
#[tokio::test]
async fn story_zero_max_group_keeps_max_floor() {
    let dir = tempfile::tempdir().unwrap();
    let store = file_store(dir.path());
    let fake = Arc::new(FakeCluster::new().with_node_group("ng-idle", 0, 0, 0));

    let op = orchestrator(fake.clone(), store.clone(), fast_config(), false)
        .run(Action::Stop, None)
        .await;
    assert_eq!(op.status, OperationStatus::Succeeded);
    assert_eq!(fake.node_group("ng-idle"), Some(scaling(0, 1, 0)));

    orchestrator(fake.clone(), store.clone(), fast_config(), false)
        .run(Action::Start, None)
        .await;
    assert_eq!(fake.node_group("ng-idle"), Some(scaling(0, 0, 0)));
}

// =============================================================================
// Dry run
// =============================================================================

/// Story: an operator previews tonight's stop
///
/// Nothing reaches the cluster or the state directory, and the report has
/// the same shape with every node group marked simulated.
#[tokio::test]
async fn story_dry_run_stop_changes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let store = file_store(dir.path());
    let fake = Arc::new(sample_cluster().with_node_group("ng-b", 1, 4, 1));

    let op = orchestrator(fake.clone(), store.clone(), fast_config(), true)
        .run(Action::Stop, None)
        .await;
    assert_eq!(op.status, OperationStatus::Succeeded, "error: {:?}", op.error);
    assert!(op.dry_run);
    assert_eq!(fake.mutations(), 0);
    assert_eq!(op.node_groups.len(), 2);
    assert!(op
        .node_groups
        .iter()
        .all(|ng| ng.status == NodeGroupStatus::Simulated));
    assert_eq!(op.node_groups[0].after, Some(scaling(0, 10, 0)));
    assert_eq!(
        op.autoscaler.as_ref().unwrap().managed,
        AutoscalerManaged::Disabled
    );

    assert_eq!(fake.node_group("ng-a"), Some(scaling(2, 10, 3)));
    assert_eq!(fake.replicas("kube-system", "cluster-autoscaler"), Some(1));
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

    // same shape as a real run
    let json = serde_json::to_value(&op).unwrap();
    for field in ["id", "node_groups", "evictions", "autoscaler", "transitions", "status"] {
        assert!(json.get(field).is_some(), "missing {}", field);
    }
}

/// Story: previewing the morning start after a real stop
///
/// Captures stay on disk so the real start can still use them.
#[tokio::test]
async fn story_dry_run_start_keeps_captures() {
    let dir = tempfile::tempdir().unwrap();
    let store = file_store(dir.path());
    let fake = Arc::new(sample_cluster());

    orchestrator(fake.clone(), store.clone(), fast_config(), false)
        .run(Action::Stop, None)
        .await;
    let mutations = fake.mutations();

    let op = orchestrator(fake.clone(), store.clone(), fast_config(), true)
        .run(Action::Start, Some(2))
        .await;
    assert_eq!(fake.mutations(), mutations);
    assert_eq!(op.node_groups[0].status, NodeGroupStatus::Simulated);
    assert_eq!(op.node_groups[0].after, Some(scaling(2, 10, 3)));
    assert_eq!(fake.node_group("ng-a"), Some(scaling(0, 10, 0)));
    assert_eq!(store.list("c1", ResourceKind::NodeGroup).unwrap().len(), 1);
    assert_eq!(store.list("c1", ResourceKind::Autoscaler).unwrap().len(), 1);
}

//! Stories where part or all of an operation fails

use std::sync::Arc;
use std::time::{Duration, Instant};

use dormant::autoscaler::AutoscalerManaged;
use dormant::cluster::{NodeGroupScaling, Readiness};
use dormant::eviction::{BudgetCheck, EvictionOutcome};
use dormant::graph::ServiceStatus;
use dormant::nodegroup::NodeGroupStatus;
use dormant::orchestrator::{Action, OperationStatus, OrchestratorState};
use dormant::state::ResourceKind;

use super::fake::{fast_config, file_store, orchestrator, service, FakeCluster};

fn scaling(min: u32, max: u32, desired: u32) -> NodeGroupScaling {
    NodeGroupScaling { min, max, desired }
}

// =============================================================================
// Fatal failures
// =============================================================================

/// Story: the orchestrator's service account lost its RBAC
///
/// The first rejected mutation aborts the whole stop. No node is cordoned
/// and no node group is touched.
#[tokio::test]
async fn story_permission_denied_aborts_stop() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Arc::new(
        FakeCluster::new()
            .with_autoscaler(1)
            .with_node_group("ng-a", 2, 10, 3)
            .with_pod("ng-a-0", "web-0"),
    );
    fake.state().forbid_mutations = true;

    let op = orchestrator(fake.clone(), file_store(dir.path()), fast_config(), false)
        .run(Action::Stop, None)
        .await;

    assert_eq!(op.status, OperationStatus::Failed);
    assert_eq!(op.state, OrchestratorState::Failed);
    assert!(op.error.as_deref().unwrap().contains("permission denied"));
    assert_eq!(
        op.autoscaler.as_ref().unwrap().managed,
        AutoscalerManaged::Failed
    );
    assert!(op.evictions.is_empty());
    assert!(fake.state().cordoned.is_empty());
    assert_eq!(fake.node_group("ng-a"), Some(scaling(2, 10, 3)));
}

/// Story: someone declared `api -> cache -> api`
///
/// Start fails before a single node group is scaled up, naming the cycle.
/// The captures stay for a corrected retry.
#[tokio::test]
async fn story_dependency_cycle_fails_before_scale_up() {
    let dir = tempfile::tempdir().unwrap();
    let store = file_store(dir.path());
    let fake = Arc::new(FakeCluster::new().with_node_group("ng-a", 2, 10, 3));

    orchestrator(fake.clone(), store.clone(), fast_config(), false)
        .run(Action::Stop, None)
        .await;
    let mutations = fake.mutations();

    let mut config = fast_config();
    config.dependencies = vec![service("api", &["cache"]), service("cache", &["api"])];
    let op = orchestrator(fake.clone(), store.clone(), config, false)
        .run(Action::Start, None)
        .await;

    assert_eq!(op.status, OperationStatus::Failed);
    assert!(op.error.as_deref().unwrap().contains("api -> cache -> api"));
    assert_eq!(fake.mutations(), mutations);
    assert_eq!(fake.node_group("ng-a"), Some(scaling(0, 10, 0)));
    assert_eq!(store.list("c1", ResourceKind::NodeGroup).unwrap().len(), 1);
}

/// Story: woken nodes could not even host kube-proxy
///
/// The bootstrap check blocks scale-up, the autoscaler stays disabled and
/// every capture is kept for the next start.
#[tokio::test]
async fn story_unsatisfiable_bootstrap_blocks_scale_up() {
    let dir = tempfile::tempdir().unwrap();
    let store = file_store(dir.path());
    let fake = Arc::new(
        FakeCluster::new()
            .with_autoscaler(2)
            .with_node_group("ng-a", 1, 3, 1)
            .with_daemonset("kube-system", "kube-proxy", 4000),
    );

    orchestrator(fake.clone(), store.clone(), fast_config(), false)
        .run(Action::Stop, None)
        .await;

    let op = orchestrator(fake.clone(), store.clone(), fast_config(), false)
        .run(Action::Start, None)
        .await;

    assert_eq!(op.status, OperationStatus::Failed);
    assert!(!op.bootstrap.as_ref().unwrap().satisfied);
    assert!(op.error.as_deref().unwrap().contains("bootstrap"));
    assert_eq!(fake.node_group("ng-a"), Some(scaling(0, 3, 0)));
    assert_eq!(fake.replicas("kube-system", "cluster-autoscaler"), Some(0));
    assert_eq!(store.list("c1", ResourceKind::Autoscaler).unwrap().len(), 1);
    assert_eq!(store.list("c1", ResourceKind::NodeGroup).unwrap().len(), 1);
}

/// Story: the apiserver accepts the autoscaler write, then stops answering reads
///
/// Each verification read is cut off at the per-call timeout, so the stop
/// fails at the verify deadline instead of hanging. The capture survives and
/// no node group is touched.
#[tokio::test]
async fn story_hung_autoscaler_read_is_bounded() {
    let dir = tempfile::tempdir().unwrap();
    let store = file_store(dir.path());
    let fake = Arc::new(
        FakeCluster::new()
            .with_autoscaler(1)
            .with_node_group("ng-a", 1, 3, 1),
    );
    fake.state().stall_reads_after_write = true;
    let mut config = fast_config();
    config.calls.timeout_secs = 1;
    config.autoscaler.verify_timeout_secs = 1;

    let started = Instant::now();
    let op = orchestrator(fake.clone(), store.clone(), config, false)
        .run(Action::Stop, None)
        .await;

    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(op.status, OperationStatus::Failed);
    let autoscaler = op.autoscaler.as_ref().unwrap();
    assert_eq!(autoscaler.managed, AutoscalerManaged::Failed);
    assert!(autoscaler.message.as_deref().unwrap().contains("timeout"));
    assert_eq!(store.list("c1", ResourceKind::Autoscaler).unwrap().len(), 1);
    assert_eq!(fake.node_group("ng-a"), Some(scaling(1, 3, 1)));
}

// =============================================================================
// Scoped failures
// =============================================================================

/// Story: a database pod's disruption budget never allows eviction
///
/// Past the grace deadline the pod is force-deleted, and the report says
/// so instead of hiding it.
#[tokio::test]
async fn story_budget_blocked_pod_is_force_deleted() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Arc::new(
        FakeCluster::new()
            .with_node_group("ng-a", 1, 3, 1)
            .with_pod("ng-a-0", "db-0")
            .with_pod("ng-a-0", "web-0"),
    );
    fake.state().budget_blocked.insert("db-0".to_string());

    let op = orchestrator(fake.clone(), file_store(dir.path()), fast_config(), false)
        .run(Action::Stop, None)
        .await;

    assert_eq!(op.status, OperationStatus::Succeeded);
    let db = op.evictions.iter().find(|r| r.name == "db-0").unwrap();
    assert_eq!(db.outcome, EvictionOutcome::ForceDeleted);
    assert_eq!(db.budget_check, BudgetCheck::DeadlineExceeded);
    let web = op.evictions.iter().find(|r| r.name == "web-0").unwrap();
    assert_eq!(web.outcome, EvictionOutcome::Evicted);

    assert_eq!(fake.state().force_deleted, vec!["db-0".to_string()]);
    assert_eq!(fake.node_group("ng-a"), Some(scaling(0, 3, 0)));
}

/// Story: one node group's nodes never come up
///
/// The slow group is reported failed and keeps its capture; the healthy
/// group and the autoscaler are restored regardless.
#[tokio::test]
async fn story_slow_node_group_fails_alone() {
    let dir = tempfile::tempdir().unwrap();
    let store = file_store(dir.path());
    let fake = Arc::new(
        FakeCluster::new()
            .with_autoscaler(1)
            .with_node_group("ng-a", 1, 5, 2)
            .with_node_group("ng-b", 1, 5, 2),
    );

    orchestrator(fake.clone(), store.clone(), fast_config(), false)
        .run(Action::Stop, None)
        .await;
    fake.state().stuck_groups.insert("ng-b".to_string());

    let op = orchestrator(fake.clone(), store.clone(), fast_config(), false)
        .run(Action::Start, None)
        .await;

    assert_eq!(op.status, OperationStatus::PartiallyFailed);
    assert_eq!(op.state, OrchestratorState::Done);
    let status = |name: &str| {
        op.node_groups
            .iter()
            .find(|ng| ng.name == name)
            .map(|ng| ng.status)
    };
    assert_eq!(status("ng-a"), Some(NodeGroupStatus::Restored));
    assert_eq!(status("ng-b"), Some(NodeGroupStatus::Failed));

    let kept: Vec<_> = store
        .list("c1", ResourceKind::NodeGroup)
        .unwrap()
        .into_iter()
        .map(|r| r.resource_id)
        .collect();
    assert_eq!(kept, vec!["ng-b"]);
    assert_eq!(
        op.autoscaler.as_ref().unwrap().managed,
        AutoscalerManaged::Restored
    );
}

/// Story: an admission webhook's pods are still pending
///
/// The webhook is reported not ready, but dependency checks and the
/// autoscaler restore still run.
#[tokio::test]
async fn story_unready_webhook_does_not_abort_start() {
    let dir = tempfile::tempdir().unwrap();
    let store = file_store(dir.path());
    let fake = Arc::new(
        FakeCluster::new()
            .with_autoscaler(1)
            .with_node_group("ng-a", 1, 3, 1)
            .with_deployment("apps", "db", 1)
            .with_webhook("policy", false)
            .with_webhook("certs", true),
    );
    let mut config = fast_config();
    config.dependencies = vec![service("db", &[])];

    orchestrator(fake.clone(), store.clone(), config.clone(), false)
        .run(Action::Stop, None)
        .await;
    let op = orchestrator(fake.clone(), store.clone(), config, false)
        .run(Action::Start, None)
        .await;

    assert_eq!(op.status, OperationStatus::PartiallyFailed);
    let policy = op.webhooks.iter().find(|w| w.name == "policy").unwrap();
    assert_eq!(policy.readiness, Readiness::NotReady);
    let certs = op.webhooks.iter().find(|w| w.name == "certs").unwrap();
    assert_eq!(certs.readiness, Readiness::Ready);
    assert_eq!(op.dependencies[0].status, ServiceStatus::Ready);
    assert_eq!(
        op.autoscaler.as_ref().unwrap().managed,
        AutoscalerManaged::Restored
    );
}

/// Story: the database never becomes available
///
/// Services depending on it are blocked; an unrelated service is still
/// checked and found ready.
#[tokio::test]
async fn story_timed_out_service_blocks_only_its_dependents() {
    let dir = tempfile::tempdir().unwrap();
    let store = file_store(dir.path());
    let fake = Arc::new(
        FakeCluster::new()
            .with_node_group("ng-a", 1, 3, 1)
            .with_deployment("apps", "api", 1)
            .with_deployment("apps", "metrics", 1),
    );
    let mut config = fast_config();
    config.dependencies = vec![
        service("db", &[]),
        service("api", &["db"]),
        service("metrics", &[]),
    ];

    orchestrator(fake.clone(), store.clone(), config.clone(), false)
        .run(Action::Stop, None)
        .await;
    let op = orchestrator(fake.clone(), store.clone(), config, false)
        .run(Action::Start, None)
        .await;

    assert_eq!(op.status, OperationStatus::PartiallyFailed);
    let status = |id: &str| {
        op.dependencies
            .iter()
            .find(|d| d.id == id)
            .map(|d| d.status)
    };
    assert_eq!(status("db"), Some(ServiceStatus::TimedOut));
    assert_eq!(status("api"), Some(ServiceStatus::Blocked));
    assert_eq!(status("metrics"), Some(ServiceStatus::Ready));
    assert_eq!(fake.node_group("ng-a"), Some(scaling(1, 3, 1)));
}

/// Story: one node group's capture file was truncated on disk
///
/// That group is reported failed and its file is left for inspection; the
/// other group and the autoscaler are restored.
#[tokio::test]
async fn story_corrupt_capture_fails_only_its_group() {
    let dir = tempfile::tempdir().unwrap();
    let store = file_store(dir.path());
    let fake = Arc::new(
        FakeCluster::new()
            .with_autoscaler(1)
            .with_node_group("ng-a", 1, 3, 1)
            .with_node_group("ng-b", 1, 3, 1),
    );

    orchestrator(fake.clone(), store.clone(), fast_config(), false)
        .run(Action::Stop, None)
        .await;
    let corrupt = dir.path().join("c1").join("node_group--ng-b.json");
    std::fs::write(&corrupt, b"{ \"kind\": \"node_group\", trunc").unwrap();

    let op = orchestrator(fake.clone(), store.clone(), fast_config(), false)
        .run(Action::Start, None)
        .await;

    assert_eq!(op.status, OperationStatus::PartiallyFailed);
    assert_eq!(op.state, OrchestratorState::Done);
    let ng_a = op.node_groups.iter().find(|ng| ng.name == "ng-a").unwrap();
    assert_eq!(ng_a.status, NodeGroupStatus::Restored);
    let ng_b = op.node_groups.iter().find(|ng| ng.name == "ng-b").unwrap();
    assert_eq!(ng_b.status, NodeGroupStatus::Failed);
    assert!(ng_b.message.as_deref().unwrap().contains("corrupt"));

    assert_eq!(fake.node_group("ng-a"), Some(scaling(1, 3, 1)));
    assert_eq!(fake.node_group("ng-b"), Some(scaling(0, 3, 0)));
    assert!(corrupt.exists());
    assert_eq!(fake.replicas("kube-system", "cluster-autoscaler"), Some(1));
    assert_eq!(
        op.autoscaler.as_ref().unwrap().managed,
        AutoscalerManaged::Restored
    );
}

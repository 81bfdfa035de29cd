//! Machine-readable record of one orchestrator run

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::autoscaler::{AutoscalerManaged, AutoscalerReport};
use crate::bootstrap::BootstrapReport;
use crate::cluster::{Cluster, Readiness, WebhookEndpoint};
use crate::eviction::PodEvictionRecord;
use crate::graph::{ServiceResult, ServiceStatus};
use crate::nodegroup::NodeGroupResult;

/// Requested action
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Disable the autoscaler, drain and zero every node group
    Stop,
    /// Restore node groups, wait for the cluster, re-enable the autoscaler
    Start,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stop => write!(f, "stop"),
            Self::Start => write!(f, "start"),
        }
    }
}

/// Orchestrator state machine states
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorState {
    /// Entry: discovery and validation
    Init,
    /// Stop: scaling the autoscaler to zero
    AutoscalerDisabling,
    /// Stop: cordoning and evicting
    PodEvicting,
    /// Stop: zeroing node groups
    ScalingDown,
    /// Start: checking critical capacity
    BootstrapValidating,
    /// Start: restoring node groups
    ScalingUp,
    /// Start: waiting for admission webhooks
    WebhookWaiting,
    /// Start: waiting for declared services
    DependencyWaiting,
    /// Start: re-enabling the autoscaler
    AutoscalerRestoring,
    /// Terminal: sequence completed
    Done,
    /// Terminal: sequence aborted
    Failed,
}

/// Overall result
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Every step and unit succeeded
    Succeeded,
    /// The sequence completed but some units failed
    PartiallyFailed,
    /// The sequence was aborted
    Failed,
    /// Cancellation was requested between steps
    Cancelled,
}

/// Timestamped state change
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    /// State entered
    pub state: OrchestratorState,
    /// When it was entered
    pub at: DateTime<Utc>,
}

/// One orchestrator invocation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScaleOperation {
    /// Unique run identifier
    pub id: Uuid,
    /// Cluster identifier
    pub cluster: String,
    /// Informational region
    pub region: Option<String>,
    /// Informational account
    pub account: Option<String>,
    /// Requested action
    pub action: Action,
    /// Whether mutations were simulated
    pub dry_run: bool,
    /// Final orchestrator state
    pub state: OrchestratorState,
    /// Overall result
    pub status: OperationStatus,
    /// Autoscaler handling, once that step ran
    pub autoscaler: Option<AutoscalerReport>,
    /// Per-node-group outcomes
    pub node_groups: Vec<NodeGroupResult>,
    /// Per-pod eviction outcomes (stop)
    pub evictions: Vec<PodEvictionRecord>,
    /// Bootstrap capacity check (start)
    pub bootstrap: Option<BootstrapReport>,
    /// Admission webhook readiness (start)
    pub webhooks: Vec<WebhookEndpoint>,
    /// Service dependency readiness (start)
    pub dependencies: Vec<ServiceResult>,
    /// State history
    pub transitions: Vec<StateTransition>,
    /// Cause of an aborted run
    pub error: Option<String>,
    /// Run start
    pub started_at: DateTime<Utc>,
    /// Run end
    pub finished_at: Option<DateTime<Utc>>,
}

impl ScaleOperation {
    /// New operation in `Init`
    pub fn new(cluster: &Cluster, action: Action, dry_run: bool) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            cluster: cluster.name.clone(),
            region: cluster.region.clone(),
            account: cluster.account.clone(),
            action,
            dry_run,
            state: OrchestratorState::Init,
            status: OperationStatus::Succeeded,
            autoscaler: None,
            node_groups: Vec::new(),
            evictions: Vec::new(),
            bootstrap: None,
            webhooks: Vec::new(),
            dependencies: Vec::new(),
            transitions: vec![StateTransition {
                state: OrchestratorState::Init,
                at: now,
            }],
            error: None,
            started_at: now,
            finished_at: None,
        }
    }

    /// Failed report for a run that never reached the orchestrator, such
    /// as one whose configuration could not be loaded
    pub fn aborted(
        cluster: &Cluster,
        action: Action,
        dry_run: bool,
        error: impl fmt::Display,
    ) -> Self {
        let mut op = Self::new(cluster, action, dry_run);
        op.error = Some(error.to_string());
        op.transition(OrchestratorState::Failed);
        op.status = OperationStatus::Failed;
        op.finished_at = Some(Utc::now());
        op
    }

    /// Enter `state`
    pub fn transition(&mut self, state: OrchestratorState) {
        self.state = state;
        self.transitions.push(StateTransition {
            state,
            at: Utc::now(),
        });
    }

    /// Whether any unit (node group, pod, webhook, service, autoscaler)
    /// ended in failure
    pub fn has_unit_failures(&self) -> bool {
        self.node_groups.iter().any(NodeGroupResult::is_failure)
            || self
                .autoscaler
                .as_ref()
                .is_some_and(|a| a.managed == AutoscalerManaged::Failed)
            || self.webhooks.iter().any(|w| w.readiness != Readiness::Ready)
            || self
                .dependencies
                .iter()
                .any(|d| d.status != ServiceStatus::Ready)
    }

    /// Whether the run fully succeeded
    pub fn succeeded(&self) -> bool {
        self.status == OperationStatus::Succeeded
    }
}

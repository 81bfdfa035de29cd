//! Stop/start state machine for one cluster
//!
//! ```text
//! stop:  Init → AutoscalerDisabling → PodEvicting → ScalingDown → Done
//! start: Init → BootstrapValidating → ScalingUp → WebhookWaiting
//!             → DependencyWaiting → AutoscalerRestoring → Done
//! ```
//!
//! Any step may end in `Failed`. Failures are scoped to the smallest unit
//! (one node group, one webhook, one service) and recorded in the report;
//! fatal errors (permission denial, dependency cycle, invalid
//! configuration) abort the whole run. Cancellation is honoured between
//! steps only, so no node group or autoscaler change is ever left
//! half-recorded.

mod report;

use std::collections::BTreeSet;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::autoscaler::{AutoscalerController, AutoscalerReport};
use crate::bootstrap::BootstrapValidator;
use crate::context::Context;
use crate::eviction::{EvictionOutcome, PodEvictionManager};
use crate::graph::{DependencyGraph, DependencyGraphValidator};
use crate::nodegroup::{restore_target, NodeGroupResult, NodeGroupScaler, NodeGroupStatus};
use crate::state::ResourceKind;
use crate::webhook::WebhookReadinessChecker;
use crate::{Error, Result};

pub use self::report::{
    Action, OperationStatus, OrchestratorState, ScaleOperation, StateTransition,
};

/// Sequences the components for one stop or start on one cluster.
///
/// The caller guarantees a single orchestrator per cluster at a time.
pub struct Orchestrator {
    ctx: Context,
    cancel: CancellationToken,
}

impl Orchestrator {
    /// Create an orchestrator; `cancel` is checked between steps
    pub fn new(ctx: Context, cancel: CancellationToken) -> Self {
        Self { ctx, cancel }
    }

    /// Run `action` to completion and return its report.
    ///
    /// Never fails: every error ends up in the report's status and error.
    #[instrument(skip(self), fields(cluster = %self.ctx.cluster.name, dry_run = self.ctx.dry_run))]
    pub async fn run(&self, action: Action, min_override: Option<u32>) -> ScaleOperation {
        let mut op = ScaleOperation::new(&self.ctx.cluster, action, self.ctx.dry_run);
        info!(operation = %op.id, %action, "Starting operation");

        let outcome = match action {
            Action::Stop => self.stop(&mut op).await,
            Action::Start => self.start(&mut op, min_override).await,
        };
        self.finish(&mut op, outcome);
        op
    }

    fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    fn finish(&self, op: &mut ScaleOperation, outcome: Result<()>) {
        match outcome {
            Ok(()) => {
                op.transition(OrchestratorState::Done);
                op.status = if op.has_unit_failures() {
                    OperationStatus::PartiallyFailed
                } else {
                    OperationStatus::Succeeded
                };
            }
            Err(Error::Cancelled) => {
                warn!(state = ?op.state, "Operation cancelled between steps");
                op.error = Some(Error::Cancelled.to_string());
                op.transition(OrchestratorState::Failed);
                op.status = OperationStatus::Cancelled;
            }
            Err(e) => {
                error!(state = ?op.state, error = %e, fatal = e.is_fatal(), "Operation aborted");
                op.error = Some(e.to_string());
                op.transition(OrchestratorState::Failed);
                op.status = OperationStatus::Failed;
            }
        }
        op.finished_at = Some(chrono::Utc::now());
        info!(
            operation = %op.id,
            status = ?op.status,
            node_groups = op.node_groups.len(),
            "Operation finished"
        );
    }

    async fn stop(&self, op: &mut ScaleOperation) -> Result<()> {
        self.checkpoint()?;
        let groups = self
            .ctx
            .call("list_node_groups", || self.ctx.access.list_node_groups())
            .await?;
        info!(node_groups = ?groups, "Discovered node groups");

        // Nothing may touch node groups while the autoscaler can still
        // scale them back up.
        self.checkpoint()?;
        op.transition(OrchestratorState::AutoscalerDisabling);
        match AutoscalerController::new(self.ctx.clone()).disable().await {
            Ok(report) => op.autoscaler = Some(report),
            Err(e) => {
                op.autoscaler = Some(AutoscalerReport::failed(&e));
                return Err(e);
            }
        }

        self.checkpoint()?;
        op.transition(OrchestratorState::PodEvicting);
        let drains = PodEvictionManager::new(self.ctx.clone())
            .drain_all(&groups)
            .await?;

        let mut drained = Vec::new();
        for drain in drains {
            if drain.is_drained() {
                drained.push(drain.node_group.clone());
            } else {
                let blocked = drain
                    .records
                    .iter()
                    .filter(|r| r.outcome == EvictionOutcome::Blocked)
                    .count();
                let reason = drain
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("{} pods could not be removed", blocked));
                warn!(node_group = %drain.node_group, %reason, "Drain incomplete, not scaling down");
                op.node_groups.push(NodeGroupResult {
                    name: drain.node_group.clone(),
                    status: NodeGroupStatus::Failed,
                    before: None,
                    after: None,
                    message: Some(format!("drain incomplete: {}", reason)),
                });
            }
            op.evictions.extend(drain.records);
        }

        self.checkpoint()?;
        op.transition(OrchestratorState::ScalingDown);
        let results = NodeGroupScaler::new(self.ctx.clone())
            .scale_down_all(&drained)
            .await?;
        op.node_groups.extend(results);
        op.node_groups.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(())
    }

    async fn start(&self, op: &mut ScaleOperation, min_override: Option<u32>) -> Result<()> {
        self.checkpoint()?;
        // A cycle must fail before anything is scaled up.
        let graph = DependencyGraph::build(&self.ctx.config.dependencies)?;

        let scaler = NodeGroupScaler::new(self.ctx.clone());
        let groups = self
            .ctx
            .call("list_node_groups", || self.ctx.access.list_node_groups())
            .await?;
        // Live groups plus any captured group the listing no longer shows.
        let mut names: BTreeSet<String> = groups.into_iter().collect();
        for record in self
            .ctx
            .store
            .list(&self.ctx.cluster.name, ResourceKind::NodeGroup)?
        {
            names.insert(record.resource_id);
        }

        let mut restorable = Vec::new();
        let mut requested_nodes = 0u32;
        for name in &names {
            match scaler.captured(name) {
                Ok(Some(captured)) => {
                    requested_nodes = requested_nodes
                        .saturating_add(restore_target(captured, min_override).desired);
                    restorable.push(name.clone());
                }
                Ok(None) => op
                    .node_groups
                    .push(NodeGroupResult::skipped(name, "nothing to restore")),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(node_group = %name, error = %e, "Unreadable capture, leaving node group alone");
                    op.node_groups.push(NodeGroupResult::failed(name, &e));
                }
            }
        }
        info!(restorable = ?restorable, requested_nodes, "Loaded captured node groups");

        self.checkpoint()?;
        op.transition(OrchestratorState::BootstrapValidating);
        if restorable.is_empty() {
            info!("No captured node groups, skipping bootstrap check");
        } else {
            let report = BootstrapValidator::new(self.ctx.clone())
                .check(requested_nodes)
                .await?;
            let satisfied = report.satisfied;
            let message = report.message.clone().unwrap_or_default();
            op.bootstrap = Some(report);
            if !satisfied {
                return Err(Error::bootstrap(message));
            }
        }

        self.checkpoint()?;
        op.transition(OrchestratorState::ScalingUp);
        let results = scaler.scale_up_all(&restorable, min_override).await?;
        op.node_groups.extend(results);
        op.node_groups.sort_by(|a, b| a.name.cmp(&b.name));

        self.checkpoint()?;
        op.transition(OrchestratorState::WebhookWaiting);
        op.webhooks = WebhookReadinessChecker::new(self.ctx.clone())
            .wait_ready()
            .await?;

        self.checkpoint()?;
        op.transition(OrchestratorState::DependencyWaiting);
        op.dependencies = DependencyGraphValidator::new(self.ctx.clone(), graph)
            .wait_ordered()
            .await?;

        self.checkpoint()?;
        op.transition(OrchestratorState::AutoscalerRestoring);
        match AutoscalerController::new(self.ctx.clone()).restore().await {
            Ok(report) => op.autoscaler = Some(report),
            Err(e) if e.is_fatal() => {
                op.autoscaler = Some(AutoscalerReport::failed(&e));
                return Err(e);
            }
            Err(e) => {
                warn!(error = %e, "Autoscaler restore failed, capture kept for retry");
                op.autoscaler = Some(AutoscalerReport::failed(&e));
            }
        }
        Ok(())
    }
}

//! Node-group capacity changes
//!
//! Scale-down captures `{min, max, desired}` before zeroing a group; scale-up
//! reapplies the capture (optionally with a new minimum) and waits for ready
//! nodes to catch up. Groups are processed by a bounded worker pool and one
//! group's failure never blocks another's.

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::cluster::NodeGroupScaling;
use crate::context::Context;
use crate::retry::poll_until;
use crate::state::{ResourceKind, StateRecord};
use crate::{Error, Result};

/// Outcome for one node group
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeGroupStatus {
    /// Set to zero capacity with the original bounds captured
    ScaledDown,
    /// Captured bounds reapplied and nodes converged
    Restored,
    /// Dry run: the change was only logged
    Simulated,
    /// Nothing to do (group missing, not drained, or nothing captured)
    Skipped,
    /// The change or its verification failed
    Failed,
}

/// Per-node-group entry of the report
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeGroupResult {
    /// Node group name
    pub name: String,
    /// Outcome
    pub status: NodeGroupStatus,
    /// Bounds observed (stop) or captured (start) before the change
    pub before: Option<NodeGroupScaling>,
    /// Bounds written
    pub after: Option<NodeGroupScaling>,
    /// Detail for skipped and failed groups
    pub message: Option<String>,
}

impl NodeGroupResult {
    /// A group that was not touched
    pub fn skipped(name: &str, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status: NodeGroupStatus::Skipped,
            before: None,
            after: None,
            message: Some(message.into()),
        }
    }

    /// A group whose change failed
    pub fn failed(name: &str, error: &Error) -> Self {
        Self {
            name: name.to_string(),
            status: NodeGroupStatus::Failed,
            before: None,
            after: None,
            message: Some(error.to_string()),
        }
    }

    /// Whether the group counts against overall success
    pub fn is_failure(&self) -> bool {
        self.status == NodeGroupStatus::Failed
    }
}

/// Zero-capacity bounds for a group currently at `current`.
///
/// Only `min` and `desired` drop to zero. `max` is intentionally left at the
/// group's current value rather than forced down to 1, so `(2, 10, 3)`
/// becomes `(0, 10, 0)`; it is floored at 1 only because the provider
/// rejects all-zero bounds.
pub fn scale_down_target(current: NodeGroupScaling) -> NodeGroupScaling {
    NodeGroupScaling {
        min: 0,
        max: current.max.max(1),
        desired: 0,
    }
}

/// Bounds to apply when waking a group from its capture
pub fn restore_target(captured: NodeGroupScaling, min_override: Option<u32>) -> NodeGroupScaling {
    let min = min_override.unwrap_or(captured.min);
    NodeGroupScaling {
        min,
        max: captured.max.max(min),
        desired: captured.desired.max(min),
    }
}

/// Applies and verifies node-group capacity changes
pub struct NodeGroupScaler {
    ctx: Context,
}

impl NodeGroupScaler {
    /// Create a scaler
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// Captured bounds for a group, if any
    pub fn captured(&self, name: &str) -> Result<Option<NodeGroupScaling>> {
        self.ctx
            .store
            .get(&self.ctx.cluster.name, ResourceKind::NodeGroup, name)?
            .map(|r| r.decode())
            .transpose()
    }

    /// Capture the group's bounds, then set it to zero capacity.
    ///
    /// An existing capture is left in place: it holds the bounds from before
    /// an earlier, interrupted stop, which are the ones to restore.
    #[instrument(skip(self), fields(cluster = %self.ctx.cluster.name))]
    pub async fn scale_down(&self, name: &str) -> Result<NodeGroupResult> {
        let current = self
            .ctx
            .call("get_node_group", || self.ctx.access.get_node_group(name))
            .await?;
        let Some(current) = current else {
            warn!(node_group = %name, "Node group not found, skipping");
            return Ok(NodeGroupResult::skipped(name, "node group not found"));
        };

        let before = match self.captured(name)? {
            Some(previous) => {
                info!(node_group = %name, captured = %previous, "Keeping existing capture");
                previous
            }
            None => {
                let record = StateRecord::new(
                    ResourceKind::NodeGroup,
                    &self.ctx.cluster.name,
                    name,
                    &current,
                )?;
                self.ctx.store.put(&record)?;
                current
            }
        };

        let target = scale_down_target(current);
        self.ctx
            .call("set_node_group_scaling", || {
                self.ctx.access.set_node_group_scaling(name, target)
            })
            .await?;

        info!(node_group = %name, from = %current, to = %target, "Node group scaled down");
        Ok(NodeGroupResult {
            name: name.to_string(),
            status: if self.ctx.dry_run {
                NodeGroupStatus::Simulated
            } else {
                NodeGroupStatus::ScaledDown
            },
            before: Some(before),
            after: Some(target),
            message: None,
        })
    }

    /// Reapply the captured bounds and wait for the ready node count to reach
    /// the new minimum. The capture is consumed only once that succeeds.
    #[instrument(skip(self), fields(cluster = %self.ctx.cluster.name))]
    pub async fn scale_up(&self, name: &str, min_override: Option<u32>) -> Result<NodeGroupResult> {
        let Some(captured) = self.captured(name)? else {
            info!(node_group = %name, "No captured configuration, nothing to restore");
            return Ok(NodeGroupResult::skipped(name, "nothing to restore"));
        };

        let target = restore_target(captured, min_override);
        self.ctx
            .call("set_node_group_scaling", || {
                self.ctx.access.set_node_group_scaling(name, target)
            })
            .await?;

        let mut result = NodeGroupResult {
            name: name.to_string(),
            status: NodeGroupStatus::Restored,
            before: Some(captured),
            after: Some(target),
            message: None,
        };

        if self.ctx.dry_run {
            result.status = NodeGroupStatus::Simulated;
        } else if let Err(e) = self.wait_for_nodes(name, target.min).await {
            if e.is_fatal() {
                return Err(e);
            }
            warn!(node_group = %name, error = %e, "Node group did not converge, keeping capture");
            result.status = NodeGroupStatus::Failed;
            result.message = Some(e.to_string());
            return Ok(result);
        }

        self.ctx
            .store
            .delete(&self.ctx.cluster.name, ResourceKind::NodeGroup, name)?;

        info!(node_group = %name, scaling = %target, "Node group restored");
        Ok(result)
    }

    async fn wait_for_nodes(&self, name: &str, min: u32) -> Result<()> {
        let cfg = &self.ctx.config.node_groups;
        poll_until(
            cfg.convergence_timeout(),
            cfg.poll_interval(),
            format!("node group {} did not reach {} ready nodes", name, min),
            || async {
                let nodes = self
                    .ctx
                    .read("list_nodes", self.ctx.access.list_nodes(name))
                    .await?;
                let ready = nodes.iter().filter(|n| n.ready).count() as u32;
                Ok(ready >= min)
            },
        )
        .await
    }

    /// Scale down several groups concurrently.
    ///
    /// Non-fatal failures become `Failed` results; the first fatal error
    /// aborts the batch.
    pub async fn scale_down_all(&self, names: &[String]) -> Result<Vec<NodeGroupResult>> {
        let outcomes: Vec<(String, Result<NodeGroupResult>)> = stream::iter(names)
            .map(|name| async move { (name.clone(), self.scale_down(name).await) })
            .buffer_unordered(self.ctx.config.calls.concurrency)
            .collect()
            .await;
        collect_results(outcomes)
    }

    /// Scale up several groups concurrently; see [`Self::scale_down_all`]
    pub async fn scale_up_all(
        &self,
        names: &[String],
        min_override: Option<u32>,
    ) -> Result<Vec<NodeGroupResult>> {
        let outcomes: Vec<(String, Result<NodeGroupResult>)> = stream::iter(names)
            .map(|name| async move { (name.clone(), self.scale_up(name, min_override).await) })
            .buffer_unordered(self.ctx.config.calls.concurrency)
            .collect()
            .await;
        collect_results(outcomes)
    }
}

fn collect_results(outcomes: Vec<(String, Result<NodeGroupResult>)>) -> Result<Vec<NodeGroupResult>> {
    let mut results = Vec::with_capacity(outcomes.len());
    for (name, outcome) in outcomes {
        match outcome {
            Ok(result) => results.push(result),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(node_group = %name, error = %e, "Node group scaling failed");
                results.push(NodeGroupResult::failed(&name, &e));
            }
        }
    }
    results.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(results)
}

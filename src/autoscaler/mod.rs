//! Cluster autoscaler hand-off
//!
//! Before any node group is touched the autoscaler is scaled to zero so it
//! cannot fight the orchestrator over desired node counts. Its replica count
//! is captured in the state store first and restored at the end of `start`.

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::cluster::{WorkloadInfo, WorkloadKind, WorkloadRef};
use crate::context::Context;
use crate::retry::poll_until;
use crate::state::{ResourceKind, StateRecord};
use crate::{Error, Result};

/// The autoscaler has at most one record per cluster
pub const AUTOSCALER_RECORD_ID: &str = "cluster-autoscaler";

/// Captured autoscaler deployment
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoscalerState {
    /// Deployment namespace
    pub namespace: String,
    /// Deployment name
    pub name: String,
    /// Replica count before it was disabled
    pub replicas: u32,
}

/// What happened to the autoscaler
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoscalerManaged {
    /// Scaled to zero, original count captured
    Disabled,
    /// Found at zero replicas; nothing captured
    AlreadyDisabled,
    /// No autoscaler (stop) or no captured state (start)
    NotFound,
    /// Replicas restored and capture consumed
    Restored,
    /// The step failed; see the message
    Failed,
}

/// Autoscaler outcome as reported
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoscalerReport {
    /// Outcome
    pub managed: AutoscalerManaged,
    /// Deployment namespace, when known
    pub namespace: Option<String>,
    /// Deployment name, when known
    pub name: Option<String>,
    /// Captured or restored replica count
    pub replicas: Option<u32>,
    /// Failure detail
    pub message: Option<String>,
}

impl AutoscalerReport {
    fn new(managed: AutoscalerManaged) -> Self {
        Self {
            managed,
            namespace: None,
            name: None,
            replicas: None,
            message: None,
        }
    }

    fn for_state(managed: AutoscalerManaged, state: &AutoscalerState) -> Self {
        Self {
            managed,
            namespace: Some(state.namespace.clone()),
            name: Some(state.name.clone()),
            replicas: Some(state.replicas),
            message: None,
        }
    }

    /// Report a failed step
    pub fn failed(error: &Error) -> Self {
        Self {
            message: Some(error.to_string()),
            ..Self::new(AutoscalerManaged::Failed)
        }
    }
}

/// Finds, disables and restores the cluster's autoscaler
pub struct AutoscalerController {
    ctx: Context,
}

impl AutoscalerController {
    /// Create a controller
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// First configured candidate that exists (first match wins)
    pub async fn find(&self) -> Result<Option<(WorkloadRef, WorkloadInfo)>> {
        for candidate in &self.ctx.config.autoscaler.candidates {
            if candidate.kind != WorkloadKind::Deployment {
                warn!(candidate = %candidate, "Ignoring non-Deployment autoscaler candidate");
                continue;
            }
            let found = self
                .ctx
                .call("get_autoscaler", || self.ctx.access.get_workload(candidate))
                .await?;
            if let Some(info) = found {
                return Ok(Some((candidate.clone(), info)));
            }
        }
        Ok(None)
    }

    /// Capture the autoscaler's replica count, then scale it to zero.
    ///
    /// Absence and an already-zero autoscaler both succeed without writing
    /// state.
    #[instrument(skip(self), fields(cluster = %self.ctx.cluster.name))]
    pub async fn disable(&self) -> Result<AutoscalerReport> {
        let Some((workload, info)) = self.find().await? else {
            info!("No cluster autoscaler found, nothing to disable");
            return Ok(AutoscalerReport::new(AutoscalerManaged::NotFound));
        };

        let state = AutoscalerState {
            namespace: workload.namespace.clone(),
            name: workload.name.clone(),
            replicas: info.replicas,
        };

        if info.replicas == 0 {
            info!(autoscaler = %workload, "Autoscaler already at zero replicas");
            return Ok(AutoscalerReport::for_state(
                AutoscalerManaged::AlreadyDisabled,
                &state,
            ));
        }

        let record = StateRecord::new(
            ResourceKind::Autoscaler,
            &self.ctx.cluster.name,
            AUTOSCALER_RECORD_ID,
            &state,
        )?;
        self.ctx.store.put(&record)?;

        self.set_and_verify(&workload, 0).await?;

        info!(
            autoscaler = %workload,
            original_replicas = state.replicas,
            "Autoscaler disabled"
        );
        Ok(AutoscalerReport::for_state(AutoscalerManaged::Disabled, &state))
    }

    /// Scale the autoscaler back to its captured count and consume the capture.
    ///
    /// With no capture this is a successful no-op, which makes repeated
    /// calls safe. If the write fails the capture is kept for a later retry.
    #[instrument(skip(self), fields(cluster = %self.ctx.cluster.name))]
    pub async fn restore(&self) -> Result<AutoscalerReport> {
        let Some(record) = self.ctx.store.get(
            &self.ctx.cluster.name,
            ResourceKind::Autoscaler,
            AUTOSCALER_RECORD_ID,
        )?
        else {
            info!("No captured autoscaler state, nothing to restore");
            return Ok(AutoscalerReport::new(AutoscalerManaged::NotFound));
        };

        let state: AutoscalerState = record.decode()?;
        let workload = WorkloadRef::deployment(&state.namespace, &state.name);

        self.set_and_verify(&workload, state.replicas).await?;

        self.ctx.store.delete(
            &self.ctx.cluster.name,
            ResourceKind::Autoscaler,
            AUTOSCALER_RECORD_ID,
        )?;

        info!(autoscaler = %workload, replicas = state.replicas, "Autoscaler restored");
        Ok(AutoscalerReport::for_state(AutoscalerManaged::Restored, &state))
    }

    async fn set_and_verify(&self, workload: &WorkloadRef, replicas: u32) -> Result<()> {
        self.ctx
            .call("set_autoscaler_replicas", || {
                self.ctx
                    .access
                    .set_deployment_replicas(&workload.namespace, &workload.name, replicas)
            })
            .await?;

        let cfg = &self.ctx.config.autoscaler;
        poll_until(
            cfg.verify_timeout(),
            cfg.poll_interval(),
            format!("autoscaler {} did not reach {} replicas", workload, replicas),
            || async {
                let info = self
                    .ctx
                    .read("get_autoscaler", self.ctx.access.get_workload(workload))
                    .await?;
                Ok(info.map(|i| i.replicas == replicas).unwrap_or(false))
            },
        )
        .await
    }
}

//! Bootstrap capacity check for the start path
//!
//! Waking node groups with too little capacity can leave DNS and per-node
//! agents unschedulable, after which nothing else in the cluster makes
//! progress. Before any node group is scaled up, the requested node count is
//! compared against the budget the critical workloads need.
//!
//! The budget is:
//!
//! ```text
//! usable_cpu = node_cpu - Σ daemonset cpu      usable_mem = node_mem - Σ daemonset mem
//! required   = max(min_critical_nodes,
//!                  ceil(Σ deployment replicas x cpu / usable_cpu),
//!                  ceil(Σ deployment replicas x mem / usable_mem))
//! ```

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::cluster::{ResourceRequests, WorkloadKind};
use crate::config::BootstrapConfig;
use crate::context::Context;
use crate::Result;

/// Outcome of the bootstrap capacity check
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapReport {
    /// Nodes the critical workloads need
    pub required_nodes: u32,
    /// Nodes the restore will request
    pub requested_nodes: u32,
    /// Total CPU requested by critical Deployments
    pub critical_cpu_millis: u64,
    /// Total memory requested by critical Deployments
    pub critical_memory_mib: u64,
    /// Per-node CPU taken by critical DaemonSets
    pub agent_cpu_millis: u64,
    /// Per-node memory taken by critical DaemonSets
    pub agent_memory_mib: u64,
    /// Whether the requested capacity covers the budget
    pub satisfied: bool,
    /// Why the check failed
    pub message: Option<String>,
}

/// Aggregated requests of the critical workloads
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CriticalDemand {
    /// Summed over Deployment replicas
    pub workloads: ResourceRequests,
    /// Summed over DaemonSets; paid on every node
    pub per_node: ResourceRequests,
}

/// Nodes needed to host `demand`, or `None` if per-node overhead leaves no
/// room on a node at all
pub fn required_nodes(config: &BootstrapConfig, demand: &CriticalDemand) -> Option<u32> {
    if demand.per_node.cpu_millis >= config.node_cpu_millis
        || demand.per_node.memory_mib >= config.node_memory_mib
    {
        return None;
    }
    let usable_cpu = config.node_cpu_millis - demand.per_node.cpu_millis;
    let usable_mem = config.node_memory_mib - demand.per_node.memory_mib;

    let by_cpu = demand.workloads.cpu_millis.div_ceil(usable_cpu);
    let by_mem = demand.workloads.memory_mib.div_ceil(usable_mem);

    let nodes = by_cpu.max(by_mem).max(u64::from(config.min_critical_nodes));
    Some(u32::try_from(nodes).unwrap_or(u32::MAX))
}

/// Checks requested capacity against the critical workload budget
pub struct BootstrapValidator {
    ctx: Context,
}

impl BootstrapValidator {
    /// Create a validator
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// Read the configured critical workloads and total their requests.
    ///
    /// Workloads that do not exist contribute nothing.
    pub async fn demand(&self) -> Result<CriticalDemand> {
        let mut demand = CriticalDemand::default();
        for workload in &self.ctx.config.bootstrap.critical_workloads {
            let info = self
                .ctx
                .call("get_workload", || self.ctx.access.get_workload(workload))
                .await?;
            let Some(info) = info else {
                debug!(workload = %workload, "Critical workload not found");
                continue;
            };
            match workload.kind {
                WorkloadKind::Deployment => {
                    let replicas = u64::from(info.replicas);
                    demand.workloads.cpu_millis += replicas * info.pod_requests.cpu_millis;
                    demand.workloads.memory_mib += replicas * info.pod_requests.memory_mib;
                }
                WorkloadKind::DaemonSet => {
                    demand.per_node.cpu_millis += info.pod_requests.cpu_millis;
                    demand.per_node.memory_mib += info.pod_requests.memory_mib;
                }
            }
        }
        Ok(demand)
    }

    /// Compare `requested_nodes` against the critical budget
    #[instrument(skip(self), fields(cluster = %self.ctx.cluster.name))]
    pub async fn check(&self, requested_nodes: u32) -> Result<BootstrapReport> {
        let config = &self.ctx.config.bootstrap;
        let demand = self.demand().await?;

        let mut report = BootstrapReport {
            required_nodes: 0,
            requested_nodes,
            critical_cpu_millis: demand.workloads.cpu_millis,
            critical_memory_mib: demand.workloads.memory_mib,
            agent_cpu_millis: demand.per_node.cpu_millis,
            agent_memory_mib: demand.per_node.memory_mib,
            satisfied: false,
            message: None,
        };

        match required_nodes(config, &demand) {
            None => {
                report.message = Some(format!(
                    "per-node agent overhead ({}m cpu, {}Mi memory) exceeds node capacity ({}m cpu, {}Mi memory)",
                    demand.per_node.cpu_millis,
                    demand.per_node.memory_mib,
                    config.node_cpu_millis,
                    config.node_memory_mib
                ));
            }
            Some(required) => {
                report.required_nodes = required;
                report.satisfied = requested_nodes >= required;
                if !report.satisfied {
                    report.message = Some(format!(
                        "requested {} nodes but critical workloads need at least {}",
                        requested_nodes, required
                    ));
                }
            }
        }

        if report.satisfied {
            info!(
                required = report.required_nodes,
                requested = requested_nodes,
                "Bootstrap capacity check passed"
            );
        } else {
            warn!(
                requested = requested_nodes,
                reason = report.message.as_deref().unwrap_or_default(),
                "Bootstrap capacity check failed"
            );
        }
        Ok(report)
    }
}

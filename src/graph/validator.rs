//! Ordered readiness checks over the dependency graph

use std::collections::HashMap;

use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::DependencyGraph;
use crate::config::ServiceDependency;
use crate::context::Context;
use crate::retry::poll_until;
use crate::Result;

/// Readiness outcome of one service
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    /// Readiness predicate satisfied
    Ready,
    /// Predicate not satisfied within the service's timeout
    TimedOut,
    /// Not checked because a dependency is not ready
    Blocked,
}

/// Per-service entry of the report
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceResult {
    /// Service identifier
    pub id: String,
    /// Outcome
    pub status: ServiceStatus,
    /// Dependencies that kept this service from being checked
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocked_by: Vec<String>,
    /// Failure detail
    pub message: Option<String>,
}

/// Waits for declared services in dependency order
pub struct DependencyGraphValidator {
    ctx: Context,
    graph: DependencyGraph,
}

impl DependencyGraphValidator {
    /// Create a validator over an already-built graph
    pub fn new(ctx: Context, graph: DependencyGraph) -> Self {
        Self { ctx, graph }
    }

    /// Check every service in dependency order.
    ///
    /// A service is polled as soon as all of its own dependencies are
    /// Ready, without waiting on unrelated services; a timed-out service
    /// blocks its dependents but not other branches. At most
    /// `calls.concurrency` checks run at once. Results come back in graph
    /// order.
    #[instrument(skip(self), fields(cluster = %self.ctx.cluster.name))]
    pub async fn wait_ordered(&self) -> Result<Vec<ServiceResult>> {
        let concurrency = self.ctx.config.calls.concurrency.max(1);
        let mut results: HashMap<String, ServiceResult> = HashMap::new();
        let mut pending: Vec<&ServiceDependency> = self
            .graph
            .order()
            .iter()
            .filter_map(|id| self.graph.service(id))
            .collect();
        let mut running = FuturesUnordered::new();

        loop {
            // pending is topologically sorted, so a service blocked here is
            // seen before any of its dependents later in the same pass
            let mut i = 0;
            while i < pending.len() {
                let service = pending[i];
                if !service.depends_on.iter().all(|d| results.contains_key(d)) {
                    i += 1;
                    continue;
                }
                let blocked_by: Vec<String> = service
                    .depends_on
                    .iter()
                    .filter(|d| results[d.as_str()].status != ServiceStatus::Ready)
                    .cloned()
                    .collect();
                if !blocked_by.is_empty() {
                    warn!(service = %service.id, blocked_by = ?blocked_by, "Service blocked by unready dependencies");
                    results.insert(
                        service.id.clone(),
                        ServiceResult {
                            id: service.id.clone(),
                            status: ServiceStatus::Blocked,
                            message: Some(format!("waiting on {}", blocked_by.join(", "))),
                            blocked_by,
                        },
                    );
                    pending.remove(i);
                } else if running.len() < concurrency {
                    debug!(service = %service.id, "Dependencies ready, checking service");
                    running.push(self.check(service));
                    pending.remove(i);
                } else {
                    i += 1;
                }
            }

            match running.next().await {
                Some(result) => {
                    let result = result?;
                    results.insert(result.id.clone(), result);
                }
                None => break,
            }
        }

        Ok(self
            .graph
            .order()
            .into_iter()
            .filter_map(|id| results.remove(&id))
            .collect())
    }

    async fn check(&self, service: &ServiceDependency) -> Result<ServiceResult> {
        let timeout = if self.ctx.dry_run {
            std::time::Duration::ZERO
        } else {
            service.timeout()
        };
        let outcome = poll_until(
            timeout,
            self.ctx.config.services.poll_interval(),
            format!(
                "{} did not reach {} available replicas within {:?}",
                service.workload,
                service.min_available,
                service.timeout()
            ),
            || async {
                let info = self
                    .ctx
                    .read("get_workload", self.ctx.access.get_workload(&service.workload))
                    .await?;
                Ok(info
                    .map(|i| i.available_replicas >= service.min_available)
                    .unwrap_or(false))
            },
        )
        .await;

        match outcome {
            Ok(()) => {
                info!(service = %service.id, "Service ready");
                Ok(ServiceResult {
                    id: service.id.clone(),
                    status: ServiceStatus::Ready,
                    blocked_by: Vec::new(),
                    message: None,
                })
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(service = %service.id, error = %e, "Service not ready");
                Ok(ServiceResult {
                    id: service.id.clone(),
                    status: ServiceStatus::TimedOut,
                    blocked_by: Vec::new(),
                    message: Some(e.to_string()),
                })
            }
        }
    }
}

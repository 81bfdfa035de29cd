//! Node drain before scale-down
//!
//! Every node of a group is cordoned (one node at a time) before any pod on
//! the group is evicted. Evictions go through the eviction subresource so the
//! API server enforces disruption budgets; a budget-blocked eviction is
//! retried with backoff until the group's grace deadline, after which the pod
//! is force-deleted and recorded as such.

use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::cluster::{EvictionResponse, PodInfo};
use crate::context::Context;
use crate::Result;

/// How a pod left its node
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionOutcome {
    /// Graceful eviction accepted
    Evicted,
    /// Deleted with zero grace after the budget deadline passed
    ForceDeleted,
    /// Still resident: neither eviction nor force deletion succeeded
    Blocked,
}

/// What the disruption budget said about the eviction
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetCheck {
    /// Allowed on the first request
    Allowed,
    /// Refused at first, allowed before the deadline
    Deferred,
    /// Still refused at the deadline
    DeadlineExceeded,
    /// No answer was obtained (the request itself failed)
    NotChecked,
}

/// One pod's drain result
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodEvictionRecord {
    /// Pod namespace
    pub namespace: String,
    /// Pod name
    pub name: String,
    /// Node the pod ran on
    pub node: String,
    /// Node group being drained
    pub node_group: String,
    /// Outcome
    pub outcome: EvictionOutcome,
    /// Disruption-budget result
    pub budget_check: BudgetCheck,
    /// Eviction requests issued
    pub attempts: u32,
}

/// Drain result for one node group
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GroupEviction {
    /// Node group name
    pub node_group: String,
    /// Nodes cordoned by this pass
    pub cordoned: Vec<String>,
    /// One record per evictable pod
    pub records: Vec<PodEvictionRecord>,
    /// Failure that stopped the drain before every pod was handled
    pub error: Option<String>,
}

impl GroupEviction {
    /// Whether the group may be scaled down
    pub fn is_drained(&self) -> bool {
        self.error.is_none()
            && self
                .records
                .iter()
                .all(|r| r.outcome != EvictionOutcome::Blocked)
    }
}

/// Cordons and drains node groups
pub struct PodEvictionManager {
    ctx: Context,
}

impl PodEvictionManager {
    /// Create an eviction manager
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// Drain several groups one after another.
    ///
    /// Pods within a group are evicted concurrently; groups are sequential
    /// so the worker pool bound holds across the whole pass. Fatal errors
    /// abort; other failures are recorded on the group.
    pub async fn drain_all(&self, node_groups: &[String]) -> Result<Vec<GroupEviction>> {
        let mut results = Vec::with_capacity(node_groups.len());
        for group in node_groups {
            results.push(self.drain(group).await?);
        }
        Ok(results)
    }

    /// Cordon every node of the group, then evict its pods
    #[instrument(skip(self), fields(cluster = %self.ctx.cluster.name))]
    pub async fn drain(&self, node_group: &str) -> Result<GroupEviction> {
        let mut result = GroupEviction {
            node_group: node_group.to_string(),
            ..Default::default()
        };

        let nodes = match self
            .ctx
            .call("list_nodes", || self.ctx.access.list_nodes(node_group))
            .await
        {
            Ok(nodes) => nodes,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                result.error = Some(e.to_string());
                return Ok(result);
            }
        };

        for node in &nodes {
            if node.unschedulable {
                debug!(node = %node.name, "Node already cordoned");
                continue;
            }
            match self
                .ctx
                .call("cordon_node", || self.ctx.access.cordon_node(&node.name))
                .await
            {
                Ok(()) => result.cordoned.push(node.name.clone()),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(node = %node.name, error = %e, "Failed to cordon node");
                    result.error = Some(format!("cordon {}: {}", node.name, e));
                    return Ok(result);
                }
            }
        }

        let mut pods: Vec<PodInfo> = Vec::new();
        for node in &nodes {
            match self
                .ctx
                .call("list_pods", || self.ctx.access.list_pods(&node.name))
                .await
            {
                Ok(found) => pods.extend(found.into_iter().filter(PodInfo::is_evictable)),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    result.error = Some(format!("list pods on {}: {}", node.name, e));
                    return Ok(result);
                }
            }
        }

        info!(
            node_group,
            nodes = nodes.len(),
            pods = pods.len(),
            "Evicting pods"
        );

        let deadline = Instant::now() + self.ctx.config.eviction.grace_period();
        let outcomes: Vec<Result<PodEvictionRecord>> = stream::iter(pods)
            .map(|pod| self.evict(pod, node_group, deadline))
            .buffer_unordered(self.ctx.config.calls.concurrency)
            .collect()
            .await;

        for outcome in outcomes {
            result.records.push(outcome?);
        }
        result
            .records
            .sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));

        let forced = result
            .records
            .iter()
            .filter(|r| r.outcome == EvictionOutcome::ForceDeleted)
            .count();
        if forced > 0 {
            warn!(node_group, forced, "Pods force-deleted after disruption budget deadline");
        }
        Ok(result)
    }

    async fn evict(
        &self,
        pod: PodInfo,
        node_group: &str,
        deadline: Instant,
    ) -> Result<PodEvictionRecord> {
        let cfg = &self.ctx.config.eviction;
        let mut backoff = cfg.backoff();
        let mut record = PodEvictionRecord {
            namespace: pod.pod.namespace.clone(),
            name: pod.pod.name.clone(),
            node: pod.node.clone(),
            node_group: node_group.to_string(),
            outcome: EvictionOutcome::Blocked,
            budget_check: BudgetCheck::NotChecked,
            attempts: 0,
        };

        loop {
            record.attempts += 1;
            let response = match self
                .ctx
                .call("evict_pod", || {
                    self.ctx.access.evict_pod(&pod.pod, cfg.pod_grace_period_secs)
                })
                .await
            {
                Ok(response) => response,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(pod = %pod.pod, error = %e, "Eviction request failed");
                    return Ok(record);
                }
            };

            match response {
                EvictionResponse::Evicted => {
                    record.outcome = EvictionOutcome::Evicted;
                    if record.budget_check == BudgetCheck::NotChecked {
                        record.budget_check = BudgetCheck::Allowed;
                    }
                    return Ok(record);
                }
                EvictionResponse::Blocked => {
                    record.budget_check = BudgetCheck::Deferred;
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    let delay = backoff
                        .next()
                        .unwrap_or(Duration::from_millis(cfg.retry_max_ms))
                        .min(deadline - now);
                    debug!(pod = %pod.pod, delay_ms = delay.as_millis(), "Eviction deferred by disruption budget");
                    tokio::time::sleep(delay).await;
                }
            }
        }

        record.budget_check = BudgetCheck::DeadlineExceeded;
        match self
            .ctx
            .call("force_delete_pod", || self.ctx.access.force_delete_pod(&pod.pod))
            .await
        {
            Ok(()) => {
                warn!(pod = %pod.pod, node = %pod.node, "Force-deleted pod past disruption budget deadline");
                record.outcome = EvictionOutcome::ForceDeleted;
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => warn!(pod = %pod.pod, error = %e, "Force delete failed"),
        }
        Ok(record)
    }
}

//! Orchestrator configuration
//!
//! Loaded from an optional YAML file. Every field has a default, so an empty
//! file (or no file at all) yields a working configuration.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cluster::{WorkloadKind, WorkloadRef};
use crate::retry::RetryConfig;
use crate::{Error, Result};

/// Top-level configuration
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DormantConfig {
    /// Retry policy shared by every remote call
    pub retry: RetryConfig,
    /// Per-call timeout and worker pool settings
    pub calls: CallConfig,
    /// Autoscaler discovery and verification
    pub autoscaler: AutoscalerConfig,
    /// Pod eviction behaviour
    pub eviction: EvictionConfig,
    /// Node-group scaling verification
    pub node_groups: NodeGroupConfig,
    /// Admission webhook readiness wait
    pub webhooks: WebhookConfig,
    /// Bootstrap capacity budget
    pub bootstrap: BootstrapConfig,
    /// Polling of declared service dependencies
    pub services: ServiceWaitConfig,
    /// Declared service dependencies, checked in topological order on start
    pub dependencies: Vec<ServiceDependency>,
}

/// Per-call timeout and concurrency
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CallConfig {
    /// Deadline for a single remote call
    pub timeout_secs: u64,
    /// Maximum node groups (or pods) processed concurrently
    pub concurrency: usize,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            concurrency: 4,
        }
    }
}

impl CallConfig {
    /// Deadline for a single remote call
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Autoscaler discovery and verification
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AutoscalerConfig {
    /// Ordered candidate locations; the first one that exists wins
    pub candidates: Vec<WorkloadRef>,
    /// How long to wait for a replica change to be observed
    pub verify_timeout_secs: u64,
    /// Interval between verification reads
    pub poll_interval_ms: u64,
}

impl Default for AutoscalerConfig {
    fn default() -> Self {
        let deployment = |namespace: &str, name: &str| WorkloadRef {
            kind: WorkloadKind::Deployment,
            namespace: namespace.to_string(),
            name: name.to_string(),
        };
        Self {
            candidates: vec![
                deployment("kube-system", "cluster-autoscaler"),
                deployment("kube-system", "cluster-autoscaler-aws-cluster-autoscaler"),
                deployment("kube-system", "aws-cluster-autoscaler"),
                deployment("cluster-autoscaler", "cluster-autoscaler"),
            ],
            verify_timeout_secs: 60,
            poll_interval_ms: 2000,
        }
    }
}

impl AutoscalerConfig {
    /// Verification deadline
    pub fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.verify_timeout_secs)
    }

    /// Verification poll interval
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Pod eviction behaviour
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EvictionConfig {
    /// How long budget-blocked evictions are retried before force deletion
    pub grace_period_secs: u64,
    /// Pod termination grace passed with each eviction (None = pod's own)
    pub pod_grace_period_secs: Option<u32>,
    /// First delay after a budget-blocked eviction
    pub retry_initial_ms: u64,
    /// Cap on the delay between budget-blocked eviction attempts
    pub retry_max_ms: u64,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: 300,
            pod_grace_period_secs: None,
            retry_initial_ms: 100,
            retry_max_ms: 10_000,
        }
    }
}

impl EvictionConfig {
    /// Deadline after which blocked pods are force-deleted
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    /// Retry schedule for blocked evictions
    pub fn backoff(&self) -> crate::retry::Backoff {
        crate::retry::Backoff::new(
            Duration::from_millis(self.retry_initial_ms),
            Duration::from_millis(self.retry_max_ms),
            2.0,
        )
    }
}

/// Node-group scaling verification
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NodeGroupConfig {
    /// How long to wait for the ready node count to reach the new minimum
    pub convergence_timeout_secs: u64,
    /// Fixed interval between node count reads
    pub poll_interval_secs: u64,
}

impl Default for NodeGroupConfig {
    fn default() -> Self {
        Self {
            convergence_timeout_secs: 900,
            poll_interval_secs: 15,
        }
    }
}

impl NodeGroupConfig {
    /// Convergence deadline
    pub fn convergence_timeout(&self) -> Duration {
        Duration::from_secs(self.convergence_timeout_secs)
    }

    /// Convergence poll interval
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Admission webhook readiness wait
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WebhookConfig {
    /// Total time to wait for every webhook to become ready
    pub timeout_secs: u64,
    /// First delay between probe rounds
    pub retry_initial_ms: u64,
    /// Cap on the delay between probe rounds
    pub retry_max_ms: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            retry_initial_ms: 1000,
            retry_max_ms: 15_000,
        }
    }
}

impl WebhookConfig {
    /// Wait deadline
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Delay schedule between probe rounds
    pub fn backoff(&self) -> crate::retry::Backoff {
        crate::retry::Backoff::new(
            Duration::from_millis(self.retry_initial_ms),
            Duration::from_millis(self.retry_max_ms),
            2.0,
        )
    }
}

/// Bootstrap capacity budget
///
/// Critical Deployments contribute `replicas x requests`; critical DaemonSets
/// contribute their per-pod requests as overhead on every node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BootstrapConfig {
    /// Floor on the number of nodes, regardless of requests
    pub min_critical_nodes: u32,
    /// Allocatable CPU of one worker node, in millicores
    pub node_cpu_millis: u64,
    /// Allocatable memory of one worker node, in MiB
    pub node_memory_mib: u64,
    /// Workloads that must be schedulable for the cluster to make progress
    pub critical_workloads: Vec<WorkloadRef>,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            min_critical_nodes: 1,
            node_cpu_millis: 2000,
            node_memory_mib: 4096,
            critical_workloads: vec![
                WorkloadRef {
                    kind: WorkloadKind::Deployment,
                    namespace: "kube-system".to_string(),
                    name: "coredns".to_string(),
                },
                WorkloadRef {
                    kind: WorkloadKind::DaemonSet,
                    namespace: "kube-system".to_string(),
                    name: "kube-proxy".to_string(),
                },
            ],
        }
    }
}

/// Polling of declared service dependencies
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServiceWaitConfig {
    /// Interval between availability reads
    pub poll_interval_ms: u64,
}

impl Default for ServiceWaitConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2000,
        }
    }
}

impl ServiceWaitConfig {
    /// Availability poll interval
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// A service whose readiness gates its dependents during start
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDependency {
    /// Service identifier referenced by `depends_on`
    pub id: String,
    /// Identifiers of services that must be ready first
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Workload whose availability is the readiness predicate
    pub workload: WorkloadRef,
    /// Available replicas required to call the service ready
    #[serde(default = "default_min_available")]
    pub min_available: u32,
    /// How long to poll this service before giving up on it
    #[serde(default = "default_service_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_min_available() -> u32 {
    1
}

fn default_service_timeout_secs() -> u64 {
    300
}

impl ServiceDependency {
    /// Per-service readiness deadline
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl DormantConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::validation(format!("failed to read config {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML text
    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(content)
            .map_err(|e| Error::validation(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the orchestrator cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.calls.concurrency == 0 {
            return Err(Error::validation("calls.concurrency must be at least 1"));
        }
        if self.calls.timeout_secs == 0 {
            return Err(Error::validation("calls.timeoutSecs must be at least 1"));
        }
        if self.node_groups.poll_interval_secs == 0 {
            return Err(Error::validation(
                "nodeGroups.pollIntervalSecs must be at least 1",
            ));
        }
        let multiplier = self.retry.backoff_multiplier;
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(Error::validation(format!(
                "retry.backoffMultiplier must be a finite number of at least 1.0, got {}",
                multiplier
            )));
        }
        for (field, value) in [
            ("retry.initialDelayMs", self.retry.initial_delay.as_millis() as u64),
            ("retry.maxDelayMs", self.retry.max_delay.as_millis() as u64),
            ("eviction.retryInitialMs", self.eviction.retry_initial_ms),
            ("eviction.retryMaxMs", self.eviction.retry_max_ms),
            ("webhooks.retryInitialMs", self.webhooks.retry_initial_ms),
            ("webhooks.retryMaxMs", self.webhooks.retry_max_ms),
            ("autoscaler.pollIntervalMs", self.autoscaler.poll_interval_ms),
            ("services.pollIntervalMs", self.services.poll_interval_ms),
        ] {
            if value == 0 {
                return Err(Error::validation(format!("{} must be at least 1", field)));
            }
        }
        if self.bootstrap.node_cpu_millis == 0 || self.bootstrap.node_memory_mib == 0 {
            return Err(Error::validation(
                "bootstrap node capacity must be non-zero",
            ));
        }

        let mut seen = HashSet::new();
        for dep in &self.dependencies {
            if !seen.insert(dep.id.as_str()) {
                return Err(Error::validation(format!(
                    "service '{}' is declared more than once",
                    dep.id
                )));
            }
        }
        Ok(())
    }
}

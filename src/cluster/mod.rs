//! Access to the orchestrated cluster's control plane
//!
//! [`ClusterAccess`] is the request/response contract every orchestrator
//! component talks to. [`KubeClusterAccess`] implements it against a
//! self-managed Cluster API cluster; [`DryRunAccess`] wraps any
//! implementation and simulates every mutating call.

mod dry_run;
mod client;

use std::fmt;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};

use crate::Result;

pub use self::dry_run::DryRunAccess;
pub use self::client::KubeClusterAccess;

/// The cluster an operation targets
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    /// Cluster identifier (the CAPI Cluster name)
    pub name: String,
    /// Namespace holding the cluster's CAPI resources
    pub capi_namespace: String,
    /// Informational region
    pub region: Option<String>,
    /// Informational account
    pub account: Option<String>,
}

impl Cluster {
    /// Cluster with the conventional `capi-<name>` namespace
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            capi_namespace: capi_namespace(&name),
            name,
            region: None,
            account: None,
        }
    }
}

/// Conventional namespace for a cluster's CAPI resources
pub fn capi_namespace(cluster_name: &str) -> String {
    format!("capi-{}", cluster_name)
}

/// Kind of workload a [`WorkloadRef`] points at
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkloadKind {
    /// apps/v1 Deployment
    Deployment,
    /// apps/v1 DaemonSet
    DaemonSet,
}

/// Reference to a namespaced workload
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkloadRef {
    /// Workload kind
    pub kind: WorkloadKind,
    /// Namespace
    pub namespace: String,
    /// Name
    pub name: String,
}

impl WorkloadRef {
    /// Reference to a Deployment
    pub fn deployment(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: WorkloadKind::Deployment,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Reference to a DaemonSet
    pub fn daemonset(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: WorkloadKind::DaemonSet,
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for WorkloadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// Summed container resource requests of one pod
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequests {
    /// CPU in millicores
    pub cpu_millis: u64,
    /// Memory in MiB
    pub memory_mib: u64,
}

/// Observed state of a workload
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkloadInfo {
    /// Desired replicas (desired scheduled pods for a DaemonSet)
    pub replicas: u32,
    /// Available replicas
    pub available_replicas: u32,
    /// Requests of a single pod
    pub pod_requests: ResourceRequests,
}

/// Scaling bounds of a node group
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeGroupScaling {
    /// Minimum size
    pub min: u32,
    /// Maximum size
    pub max: u32,
    /// Desired size
    pub desired: u32,
}

impl fmt::Display for NodeGroupScaling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "min={} max={} desired={}", self.min, self.max, self.desired)
    }
}

/// A worker node
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeInfo {
    /// Node name
    pub name: String,
    /// Node group the node belongs to
    pub node_group: String,
    /// Whether the node is cordoned
    pub unschedulable: bool,
    /// Whether the node reports Ready=True
    pub ready: bool,
}

/// Namespaced pod identity
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PodRef {
    /// Namespace
    pub namespace: String,
    /// Name
    pub name: String,
}

impl PodRef {
    /// Create a pod reference
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for PodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A pod resident on a node
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodInfo {
    /// Pod identity
    pub pod: PodRef,
    /// Node the pod runs on
    pub node: String,
    /// Owned by a DaemonSet (recreated on every node, never evicted)
    pub daemonset_owned: bool,
    /// Static pod mirrored by the kubelet
    pub mirror: bool,
    /// Phase is Succeeded or Failed
    pub terminal: bool,
}

impl PodInfo {
    /// Whether a drain should evict this pod
    pub fn is_evictable(&self) -> bool {
        !(self.daemonset_owned || self.mirror || self.terminal)
    }
}

/// Result of a single eviction request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EvictionResponse {
    /// The eviction was accepted (or the pod is already gone)
    Evicted,
    /// A disruption budget forbids the eviction right now
    Blocked,
}

/// Kind of admission webhook
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookType {
    /// MutatingWebhookConfiguration entry
    Mutating,
    /// ValidatingWebhookConfiguration entry
    Validating,
}

/// Where a webhook's requests are sent
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookTarget {
    /// In-cluster service
    Service {
        /// Service namespace
        namespace: String,
        /// Service name
        name: String,
    },
    /// External URL
    Url(String),
}

/// Probed readiness of a webhook endpoint
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Readiness {
    /// Endpoint can serve requests
    Ready,
    /// Endpoint exists but cannot serve requests
    NotReady,
    /// Readiness could not be determined
    #[default]
    Unknown,
}

/// One admission webhook
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookEndpoint {
    /// Owning webhook configuration
    pub configuration: String,
    /// Webhook name within the configuration
    pub name: String,
    /// Mutating or validating
    #[serde(rename = "type")]
    pub webhook_type: WebhookType,
    /// Request target
    pub target: WebhookTarget,
    /// Last probed readiness
    pub readiness: Readiness,
}

/// Request/response contract with the cluster control plane
///
/// Every call is a single remote request; callers wrap them with
/// [`crate::retry::with_timeout`] and [`crate::retry::retry_with_backoff`].
/// Absent resources are `Ok(None)`, never an error.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterAccess: Send + Sync {
    /// Read a workload's replica counts and pod requests
    async fn get_workload(&self, workload: &WorkloadRef) -> Result<Option<WorkloadInfo>>;

    /// Set a Deployment's replica count
    async fn set_deployment_replicas(
        &self,
        namespace: &str,
        name: &str,
        replicas: u32,
    ) -> Result<()>;

    /// Names of the cluster's node groups
    async fn list_node_groups(&self) -> Result<Vec<String>>;

    /// Read a node group's scaling bounds
    async fn get_node_group(&self, name: &str) -> Result<Option<NodeGroupScaling>>;

    /// Write a node group's scaling bounds
    async fn set_node_group_scaling(&self, name: &str, scaling: NodeGroupScaling) -> Result<()>;

    /// Nodes belonging to a node group
    async fn list_nodes(&self, node_group: &str) -> Result<Vec<NodeInfo>>;

    /// Pods scheduled on a node
    async fn list_pods(&self, node: &str) -> Result<Vec<PodInfo>>;

    /// Mark a node unschedulable
    async fn cordon_node(&self, node: &str) -> Result<()>;

    /// Request a graceful, budget-respecting eviction
    async fn evict_pod(&self, pod: &PodRef, grace_period_secs: Option<u32>)
        -> Result<EvictionResponse>;

    /// Delete a pod immediately, bypassing disruption budgets
    async fn force_delete_pod(&self, pod: &PodRef) -> Result<()>;

    /// All mutating and validating admission webhooks
    async fn list_admission_webhooks(&self) -> Result<Vec<WebhookEndpoint>>;

    /// Probe one webhook endpoint
    async fn probe_webhook(&self, endpoint: &WebhookEndpoint) -> Result<Readiness>;
}

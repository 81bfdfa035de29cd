//! In-memory cluster implementing `ClusterAccess`
//!
//! Node groups materialize `desired` nodes named `<group>-<i>`, so scaling a
//! group immediately changes what `list_nodes` returns. Every mutating call
//! is counted so dry-run stories can assert that none reached the cluster.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use dormant::cluster::{
    Cluster, ClusterAccess, DryRunAccess, EvictionResponse, NodeGroupScaling, NodeInfo, PodInfo,
    PodRef, Readiness, ResourceRequests, WebhookEndpoint, WebhookTarget, WebhookType,
    WorkloadInfo, WorkloadKind, WorkloadRef,
};
use dormant::config::{DormantConfig, ServiceDependency};
use dormant::context::Context;
use dormant::orchestrator::Orchestrator;
use dormant::retry::RetryConfig;
use dormant::state::{DryRunStateStore, FileStateStore, StateStore};
use dormant::{Error, Result};

// =============================================================================
// Fake cluster
// =============================================================================

/// Observable state of the fake cluster
#[derive(Default)]
pub struct FakeState {
    pub deployments: HashMap<(String, String), WorkloadInfo>,
    pub daemonsets: HashMap<(String, String), WorkloadInfo>,
    pub node_groups: BTreeMap<String, NodeGroupScaling>,
    pub cordoned: HashSet<String>,
    pub pods: Vec<PodInfo>,
    /// Pods whose disruption budget never allows eviction
    pub budget_blocked: HashSet<String>,
    /// Groups whose nodes never report Ready
    pub stuck_groups: HashSet<String>,
    pub webhooks: Vec<WebhookEndpoint>,
    pub unready_webhooks: HashSet<String>,
    pub evicted: Vec<String>,
    pub force_deleted: Vec<String>,
    /// Every mutation is rejected as forbidden
    pub forbid_mutations: bool,
    /// Workload reads hang once any Deployment has been scaled
    pub stall_reads_after_write: bool,
    reads_stalled: bool,
}

#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<FakeState>,
    mutations: AtomicUsize,
}

fn key(namespace: &str, name: &str) -> (String, String) {
    (namespace.to_string(), name.to_string())
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn mutations(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    pub fn with_autoscaler(self, replicas: u32) -> Self {
        self.with_deployment("kube-system", "cluster-autoscaler", replicas)
    }

    pub fn with_deployment(self, namespace: &str, name: &str, replicas: u32) -> Self {
        self.state().deployments.insert(
            key(namespace, name),
            WorkloadInfo {
                replicas,
                available_replicas: replicas,
                pod_requests: ResourceRequests {
                    cpu_millis: 100,
                    memory_mib: 128,
                },
            },
        );
        self
    }

    pub fn with_daemonset(self, namespace: &str, name: &str, cpu_millis: u64) -> Self {
        self.state().daemonsets.insert(
            key(namespace, name),
            WorkloadInfo {
                replicas: 1,
                available_replicas: 1,
                pod_requests: ResourceRequests {
                    cpu_millis,
                    memory_mib: 64,
                },
            },
        );
        self
    }

    pub fn with_node_group(self, name: &str, min: u32, max: u32, desired: u32) -> Self {
        self.state()
            .node_groups
            .insert(name.to_string(), NodeGroupScaling { min, max, desired });
        self
    }

    pub fn with_pod(self, node: &str, name: &str) -> Self {
        self.state().pods.push(PodInfo {
            pod: PodRef::new("default", name),
            node: node.to_string(),
            daemonset_owned: false,
            mirror: false,
            terminal: false,
        });
        self
    }

    pub fn with_daemonset_pod(self, node: &str, name: &str) -> Self {
        self.state().pods.push(PodInfo {
            pod: PodRef::new("kube-system", name),
            node: node.to_string(),
            daemonset_owned: true,
            mirror: false,
            terminal: false,
        });
        self
    }

    pub fn with_webhook(self, name: &str, ready: bool) -> Self {
        {
            let mut state = self.state();
            state.webhooks.push(WebhookEndpoint {
                configuration: "admission".to_string(),
                name: name.to_string(),
                webhook_type: WebhookType::Validating,
                target: WebhookTarget::Service {
                    namespace: "admission-system".to_string(),
                    name: name.to_string(),
                },
                readiness: Readiness::Unknown,
            });
            if !ready {
                state.unready_webhooks.insert(name.to_string());
            }
        }
        self
    }

    pub fn replicas(&self, namespace: &str, name: &str) -> Option<u32> {
        self.state()
            .deployments
            .get(&key(namespace, name))
            .map(|d| d.replicas)
    }

    pub fn node_group(&self, name: &str) -> Option<NodeGroupScaling> {
        self.state().node_groups.get(name).copied()
    }

    fn mutate(&self) -> Result<MutexGuard<'_, FakeState>> {
        let state = self.state();
        if state.forbid_mutations {
            return Err(Error::forbidden("fake cluster rejects all mutations"));
        }
        self.mutations.fetch_add(1, Ordering::SeqCst);
        Ok(state)
    }
}

#[async_trait]
impl ClusterAccess for FakeCluster {
    async fn get_workload(&self, workload: &WorkloadRef) -> Result<Option<WorkloadInfo>> {
        let stalled = self.state().reads_stalled;
        if stalled {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        let state = self.state();
        let k = key(&workload.namespace, &workload.name);
        Ok(match workload.kind {
            WorkloadKind::Deployment => state.deployments.get(&k).cloned(),
            WorkloadKind::DaemonSet => state.daemonsets.get(&k).cloned(),
        })
    }

    async fn set_deployment_replicas(
        &self,
        namespace: &str,
        name: &str,
        replicas: u32,
    ) -> Result<()> {
        let mut state = self.mutate()?;
        let deployment = state
            .deployments
            .get_mut(&key(namespace, name))
            .ok_or_else(|| Error::cluster(format!("deployment {}/{} not found", namespace, name)))?;
        deployment.replicas = replicas;
        deployment.available_replicas = replicas;
        if state.stall_reads_after_write {
            state.reads_stalled = true;
        }
        Ok(())
    }

    async fn list_node_groups(&self) -> Result<Vec<String>> {
        Ok(self.state().node_groups.keys().cloned().collect())
    }

    async fn get_node_group(&self, name: &str) -> Result<Option<NodeGroupScaling>> {
        Ok(self.node_group(name))
    }

    async fn set_node_group_scaling(&self, name: &str, scaling: NodeGroupScaling) -> Result<()> {
        let mut state = self.mutate()?;
        match state.node_groups.get_mut(name) {
            Some(current) => {
                *current = scaling;
                Ok(())
            }
            None => Err(Error::cluster(format!("node group {} not found", name))),
        }
    }

    async fn list_nodes(&self, node_group: &str) -> Result<Vec<NodeInfo>> {
        let state = self.state();
        let desired = state
            .node_groups
            .get(node_group)
            .map(|s| s.desired)
            .unwrap_or(0);
        let ready = !state.stuck_groups.contains(node_group);
        Ok((0..desired)
            .map(|i| {
                let name = format!("{}-{}", node_group, i);
                NodeInfo {
                    unschedulable: state.cordoned.contains(&name),
                    name,
                    node_group: node_group.to_string(),
                    ready,
                }
            })
            .collect())
    }

    async fn list_pods(&self, node: &str) -> Result<Vec<PodInfo>> {
        Ok(self
            .state()
            .pods
            .iter()
            .filter(|p| p.node == node)
            .cloned()
            .collect())
    }

    async fn cordon_node(&self, node: &str) -> Result<()> {
        self.mutate()?.cordoned.insert(node.to_string());
        Ok(())
    }

    async fn evict_pod(
        &self,
        pod: &PodRef,
        _grace_period_secs: Option<u32>,
    ) -> Result<EvictionResponse> {
        let mut state = self.mutate()?;
        if state.budget_blocked.contains(&pod.name) {
            return Ok(EvictionResponse::Blocked);
        }
        state.pods.retain(|p| p.pod != *pod);
        state.evicted.push(pod.name.clone());
        Ok(EvictionResponse::Evicted)
    }

    async fn force_delete_pod(&self, pod: &PodRef) -> Result<()> {
        let mut state = self.mutate()?;
        state.pods.retain(|p| p.pod != *pod);
        state.force_deleted.push(pod.name.clone());
        Ok(())
    }

    async fn list_admission_webhooks(&self) -> Result<Vec<WebhookEndpoint>> {
        Ok(self.state().webhooks.clone())
    }

    async fn probe_webhook(&self, endpoint: &WebhookEndpoint) -> Result<Readiness> {
        Ok(if self.state().unready_webhooks.contains(&endpoint.name) {
            Readiness::NotReady
        } else {
            Readiness::Ready
        })
    }
}

// =============================================================================
// Harness
// =============================================================================

/// Configuration with millisecond-scale waits
pub fn fast_config() -> DormantConfig {
    let mut config = DormantConfig::default();
    config.retry = RetryConfig {
        max_attempts: 2,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        backoff_multiplier: 2.0,
    };
    config.autoscaler.verify_timeout_secs = 1;
    config.autoscaler.poll_interval_ms = 5;
    config.eviction.grace_period_secs = 0;
    config.eviction.retry_initial_ms = 1;
    config.eviction.retry_max_ms = 5;
    config.node_groups.convergence_timeout_secs = 1;
    config.node_groups.poll_interval_secs = 1;
    config.webhooks.timeout_secs = 0;
    config.services.poll_interval_ms = 5;
    config
}

pub fn service(id: &str, depends_on: &[&str]) -> ServiceDependency {
    ServiceDependency {
        id: id.to_string(),
        depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
        workload: WorkloadRef::deployment("apps", id),
        min_available: 1,
        timeout_secs: 0,
    }
}

pub fn file_store(dir: &Path) -> Arc<dyn StateStore> {
    Arc::new(FileStateStore::new(dir))
}

/// Orchestrator for cluster `c1` against the fake
pub fn orchestrator(
    fake: Arc<FakeCluster>,
    store: Arc<dyn StateStore>,
    config: DormantConfig,
    dry_run: bool,
) -> Orchestrator {
    let access: Arc<dyn ClusterAccess> = if dry_run {
        Arc::new(DryRunAccess::new(fake))
    } else {
        fake
    };
    let store: Arc<dyn StateStore> = if dry_run {
        Arc::new(DryRunStateStore::new(store))
    } else {
        store
    };
    Orchestrator::new(
        Context::new(Cluster::new("c1"), access, store, config, dry_run),
        CancellationToken::new(),
    )
}

//! kube-rs implementation of [`ClusterAccess`]
//!
//! Node groups are CAPI MachineDeployments living in the (self-managed)
//! cluster's own API server. Min/max bounds are the cluster-autoscaler
//! node-group annotations; desired is `spec.replicas`.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhookConfiguration, ValidatingWebhookConfiguration, WebhookClientConfig,
};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{Node, Pod, PodTemplateSpec};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::api::{
    Api, DeleteParams, DynamicObject, EvictParams, ListParams, Patch, PatchParams,
};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::core::GroupVersionKind;
use kube::discovery::ApiResource;
use kube::{Client, Config};
use tracing::{debug, info};

use super::{
    Cluster, ClusterAccess, EvictionResponse, NodeGroupScaling, NodeInfo, PodInfo, PodRef,
    Readiness, ResourceRequests, WebhookEndpoint, WebhookTarget, WebhookType, WorkloadInfo,
    WorkloadKind, WorkloadRef,
};
use crate::{Error, Result};

/// CAPI API group
const CAPI_GROUP: &str = "cluster.x-k8s.io";
/// CAPI API version
const CAPI_VERSION: &str = "v1beta2";
/// Label carrying the owning CAPI cluster name
const CLUSTER_NAME_LABEL: &str = "cluster.x-k8s.io/cluster-name";
/// Label carrying the owning MachineDeployment name on a Machine
const DEPLOYMENT_NAME_LABEL: &str = "cluster.x-k8s.io/deployment-name";
/// Cluster-autoscaler minimum size annotation
pub const MIN_SIZE_ANNOTATION: &str = "cluster.x-k8s.io/cluster-api-autoscaler-node-group-min-size";
/// Cluster-autoscaler maximum size annotation
pub const MAX_SIZE_ANNOTATION: &str = "cluster.x-k8s.io/cluster-api-autoscaler-node-group-max-size";
/// Annotation the kubelet sets on mirror pods
const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";
/// Label linking an EndpointSlice to its Service
const SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// [`ClusterAccess`] backed by a kube client
pub struct KubeClusterAccess {
    client: Client,
    cluster: Cluster,
    probe_timeout: Duration,
}

impl KubeClusterAccess {
    /// Wrap an existing client
    pub fn new(client: Client, cluster: Cluster) -> Self {
        Self {
            client,
            cluster,
            probe_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Build a credentialed client for the cluster from an optional kubeconfig path
    pub async fn connect(cluster: Cluster, kubeconfig: Option<&Path>) -> Result<Self> {
        let client = create_client(kubeconfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT)
            .await?;
        info!(cluster = %cluster.name, "Connected to cluster API server");
        Ok(Self::new(client, cluster))
    }

    fn capi_api(&self, kind: &str) -> Api<DynamicObject> {
        let ar = ApiResource::from_gvk(&GroupVersionKind::gvk(CAPI_GROUP, CAPI_VERSION, kind));
        Api::namespaced_with(self.client.clone(), &self.cluster.capi_namespace, &ar)
    }

    async fn get_node(&self, name: &str, node_group: &str) -> Result<Option<NodeInfo>> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        Ok(nodes.get_opt(name).await?.map(|node| NodeInfo {
            name: name.to_string(),
            node_group: node_group.to_string(),
            unschedulable: node
                .spec
                .as_ref()
                .and_then(|s| s.unschedulable)
                .unwrap_or(false),
            ready: node
                .status
                .as_ref()
                .and_then(|s| s.conditions.as_ref())
                .map(|conds| {
                    conds
                        .iter()
                        .any(|c| c.type_ == "Ready" && c.status == "True")
                })
                .unwrap_or(false),
        }))
    }

    async fn probe_service(&self, namespace: &str, name: &str) -> Result<Readiness> {
        let slices: Api<EndpointSlice> = Api::namespaced(self.client.clone(), namespace);
        let list = slices
            .list(&ListParams::default().labels(&format!("{}={}", SERVICE_NAME_LABEL, name)))
            .await?;

        if list.items.is_empty() {
            return Ok(Readiness::Unknown);
        }

        let ready = list.items.iter().any(|slice| {
            slice.endpoints.iter().any(|ep| {
                ep.conditions
                    .as_ref()
                    .and_then(|c| c.ready)
                    .unwrap_or(false)
            })
        });

        Ok(if ready {
            Readiness::Ready
        } else {
            Readiness::NotReady
        })
    }

    async fn probe_url(&self, raw: &str) -> Readiness {
        let Ok(url) = url::Url::parse(raw) else {
            return Readiness::Unknown;
        };
        let (Some(host), Some(port)) = (url.host_str(), url.port_or_known_default()) else {
            return Readiness::Unknown;
        };

        match tokio::time::timeout(
            self.probe_timeout,
            tokio::net::TcpStream::connect((host, port)),
        )
        .await
        {
            Ok(Ok(_)) => Readiness::Ready,
            Ok(Err(e)) => {
                debug!(url = %raw, error = %e, "Webhook URL refused connection");
                Readiness::NotReady
            }
            Err(_) => Readiness::NotReady,
        }
    }
}

#[async_trait]
impl ClusterAccess for KubeClusterAccess {
    async fn get_workload(&self, workload: &WorkloadRef) -> Result<Option<WorkloadInfo>> {
        match workload.kind {
            WorkloadKind::Deployment => {
                let api: Api<Deployment> =
                    Api::namespaced(self.client.clone(), &workload.namespace);
                Ok(api.get_opt(&workload.name).await?.map(|d| {
                    let spec = d.spec.as_ref();
                    WorkloadInfo {
                        replicas: spec.and_then(|s| s.replicas).unwrap_or(1).max(0) as u32,
                        available_replicas: d
                            .status
                            .as_ref()
                            .and_then(|s| s.available_replicas)
                            .unwrap_or(0)
                            .max(0) as u32,
                        pod_requests: spec
                            .map(|s| template_requests(&s.template))
                            .unwrap_or_default(),
                    }
                }))
            }
            WorkloadKind::DaemonSet => {
                let api: Api<DaemonSet> =
                    Api::namespaced(self.client.clone(), &workload.namespace);
                Ok(api.get_opt(&workload.name).await?.map(|ds| {
                    let status = ds.status.as_ref();
                    WorkloadInfo {
                        replicas: status
                            .map(|s| s.desired_number_scheduled)
                            .unwrap_or(0)
                            .max(0) as u32,
                        available_replicas: status
                            .and_then(|s| s.number_available)
                            .unwrap_or(0)
                            .max(0) as u32,
                        pod_requests: ds
                            .spec
                            .as_ref()
                            .map(|s| template_requests(&s.template))
                            .unwrap_or_default(),
                    }
                }))
            }
        }
    }

    async fn set_deployment_replicas(
        &self,
        namespace: &str,
        name: &str,
        replicas: u32,
    ) -> Result<()> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "spec": { "replicas": replicas } });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        debug!(namespace, name, replicas, "Patched deployment replicas");
        Ok(())
    }

    async fn list_node_groups(&self) -> Result<Vec<String>> {
        let list = self
            .capi_api("MachineDeployment")
            .list(&ListParams::default().labels(&format!(
                "{}={}",
                CLUSTER_NAME_LABEL, self.cluster.name
            )))
            .await?;

        let mut names: Vec<String> = list
            .items
            .into_iter()
            .filter_map(|md| md.metadata.name)
            .collect();
        names.sort();
        Ok(names)
    }

    async fn get_node_group(&self, name: &str) -> Result<Option<NodeGroupScaling>> {
        let Some(md) = self.capi_api("MachineDeployment").get_opt(name).await? else {
            return Ok(None);
        };
        Ok(Some(scaling_from_machine_deployment(&md)))
    }

    async fn set_node_group_scaling(&self, name: &str, scaling: NodeGroupScaling) -> Result<()> {
        let patch = scaling_patch(&scaling);
        self.capi_api("MachineDeployment")
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        debug!(node_group = %name, %scaling, "Patched MachineDeployment scaling");
        Ok(())
    }

    async fn list_nodes(&self, node_group: &str) -> Result<Vec<NodeInfo>> {
        let machines = self
            .capi_api("Machine")
            .list(&ListParams::default().labels(&format!(
                "{}={}",
                DEPLOYMENT_NAME_LABEL, node_group
            )))
            .await?;

        let mut nodes = Vec::new();
        for machine in &machines.items {
            let Some(node_name) = machine
                .data
                .get("status")
                .and_then(|s| s.get("nodeRef"))
                .and_then(|r| r.get("name"))
                .and_then(|n| n.as_str())
            else {
                continue;
            };
            if let Some(node) = self.get_node(node_name, node_group).await? {
                nodes.push(node);
            }
        }
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(nodes)
    }

    async fn list_pods(&self, node: &str) -> Result<Vec<PodInfo>> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let list = pods
            .list(&ListParams::default().fields(&format!("spec.nodeName={}", node)))
            .await?;

        Ok(list
            .items
            .into_iter()
            .filter_map(|pod| {
                let name = pod.metadata.name.clone()?;
                let namespace = pod.metadata.namespace.clone().unwrap_or_default();
                let daemonset_owned = pod
                    .metadata
                    .owner_references
                    .as_ref()
                    .map(|refs| refs.iter().any(|r| r.kind == "DaemonSet"))
                    .unwrap_or(false);
                let mirror = pod
                    .metadata
                    .annotations
                    .as_ref()
                    .map(|a| a.contains_key(MIRROR_POD_ANNOTATION))
                    .unwrap_or(false);
                let terminal = matches!(
                    pod.status.as_ref().and_then(|s| s.phase.as_deref()),
                    Some("Succeeded") | Some("Failed")
                );
                Some(PodInfo {
                    pod: PodRef::new(namespace, name),
                    node: node.to_string(),
                    daemonset_owned,
                    mirror,
                    terminal,
                })
            })
            .collect())
    }

    async fn cordon_node(&self, node: &str) -> Result<()> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        nodes.cordon(node).await?;
        Ok(())
    }

    async fn evict_pod(
        &self,
        pod: &PodRef,
        grace_period_secs: Option<u32>,
    ) -> Result<EvictionResponse> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &pod.namespace);
        let params = EvictParams {
            delete_options: Some(DeleteParams {
                grace_period_seconds: grace_period_secs,
                ..Default::default()
            }),
            ..Default::default()
        };

        match pods.evict(&pod.name, &params).await {
            Ok(_) => Ok(EvictionResponse::Evicted),
            // 429: a PodDisruptionBudget forbids this eviction right now
            Err(kube::Error::Api(ae)) if ae.code == 429 => Ok(EvictionResponse::Blocked),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(EvictionResponse::Evicted),
            Err(e) => Err(e.into()),
        }
    }

    async fn force_delete_pod(&self, pod: &PodRef) -> Result<()> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &pod.namespace);
        let params = DeleteParams {
            grace_period_seconds: Some(0),
            ..Default::default()
        };
        match pods.delete(&pod.name, &params).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_admission_webhooks(&self) -> Result<Vec<WebhookEndpoint>> {
        let mut endpoints = Vec::new();

        let mutating: Api<MutatingWebhookConfiguration> = Api::all(self.client.clone());
        for config in mutating.list(&ListParams::default()).await?.items {
            let config_name = config.metadata.name.clone().unwrap_or_default();
            for hook in config.webhooks.unwrap_or_default() {
                endpoints.push(endpoint(
                    &config_name,
                    hook.name,
                    WebhookType::Mutating,
                    &hook.client_config,
                ));
            }
        }

        let validating: Api<ValidatingWebhookConfiguration> = Api::all(self.client.clone());
        for config in validating.list(&ListParams::default()).await?.items {
            let config_name = config.metadata.name.clone().unwrap_or_default();
            for hook in config.webhooks.unwrap_or_default() {
                endpoints.push(endpoint(
                    &config_name,
                    hook.name,
                    WebhookType::Validating,
                    &hook.client_config,
                ));
            }
        }

        Ok(endpoints)
    }

    async fn probe_webhook(&self, endpoint: &WebhookEndpoint) -> Result<Readiness> {
        match &endpoint.target {
            WebhookTarget::Service { namespace, name } => self.probe_service(namespace, name).await,
            WebhookTarget::Url(url) => Ok(self.probe_url(url).await),
        }
    }
}

fn endpoint(
    configuration: &str,
    name: String,
    webhook_type: WebhookType,
    client_config: &WebhookClientConfig,
) -> WebhookEndpoint {
    let target = match (&client_config.service, &client_config.url) {
        (Some(svc), _) => WebhookTarget::Service {
            namespace: svc.namespace.clone(),
            name: svc.name.clone(),
        },
        (None, Some(url)) => WebhookTarget::Url(url.clone()),
        (None, None) => WebhookTarget::Url(String::new()),
    };
    WebhookEndpoint {
        configuration: configuration.to_string(),
        name,
        webhook_type,
        target,
        readiness: Readiness::Unknown,
    }
}

/// Read min/max/desired from a MachineDeployment.
///
/// A pool without autoscaler annotations is fixed-size: min and max both
/// read as the replica count.
pub(crate) fn scaling_from_machine_deployment(md: &DynamicObject) -> NodeGroupScaling {
    let desired = md
        .data
        .get("spec")
        .and_then(|s| s.get("replicas"))
        .and_then(|r| r.as_u64())
        .unwrap_or(0) as u32;

    let annotation = |key: &str| {
        md.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .and_then(|v| v.parse::<u32>().ok())
    };

    NodeGroupScaling {
        min: annotation(MIN_SIZE_ANNOTATION).unwrap_or(desired),
        max: annotation(MAX_SIZE_ANNOTATION).unwrap_or(desired),
        desired,
    }
}

/// Merge patch writing all three bounds at once
pub(crate) fn scaling_patch(scaling: &NodeGroupScaling) -> serde_json::Value {
    serde_json::json!({
        "metadata": {
            "annotations": {
                MIN_SIZE_ANNOTATION: scaling.min.to_string(),
                MAX_SIZE_ANNOTATION: scaling.max.to_string(),
            }
        },
        "spec": { "replicas": scaling.desired }
    })
}

/// Sum the requests of every container in a pod template
fn template_requests(template: &PodTemplateSpec) -> ResourceRequests {
    let mut total = ResourceRequests::default();
    let Some(spec) = template.spec.as_ref() else {
        return total;
    };
    for container in &spec.containers {
        let Some(requests) = container.resources.as_ref().and_then(|r| r.requests.as_ref())
        else {
            continue;
        };
        if let Some(cpu) = requests.get("cpu").and_then(|q| parse_cpu_millis(&q.0)) {
            total.cpu_millis += cpu;
        }
        if let Some(mem) = requests.get("memory").and_then(|q| parse_memory_mib(&q.0)) {
            total.memory_mib += mem;
        }
    }
    total
}

/// Parse a CPU quantity ("250m", "1", "0.5") into millicores
pub fn parse_cpu_millis(quantity: &str) -> Option<u64> {
    let q = quantity.trim();
    if let Some(millis) = q.strip_suffix('m') {
        return millis.parse::<u64>().ok();
    }
    q.parse::<f64>()
        .ok()
        .filter(|v| *v >= 0.0)
        .map(|v| (v * 1000.0).ceil() as u64)
}

/// Parse a memory quantity ("128Mi", "1Gi", "500M", "1048576") into MiB, rounding up
pub fn parse_memory_mib(quantity: &str) -> Option<u64> {
    const SUFFIXES: [(&str, f64); 8] = [
        ("Ki", 1024.0),
        ("Mi", 1024.0 * 1024.0),
        ("Gi", 1024.0 * 1024.0 * 1024.0),
        ("Ti", 1024.0 * 1024.0 * 1024.0 * 1024.0),
        ("k", 1e3),
        ("M", 1e6),
        ("G", 1e9),
        ("T", 1e12),
    ];

    let q = quantity.trim();
    let (number, multiplier) = SUFFIXES
        .iter()
        .find_map(|(suffix, mult)| q.strip_suffix(suffix).map(|n| (n, *mult)))
        .unwrap_or((q, 1.0));

    let bytes = number.parse::<f64>().ok().filter(|v| *v >= 0.0)? * multiplier;
    Some((bytes / (1024.0 * 1024.0)).ceil() as u64)
}

/// Create a kube client from optional kubeconfig path with custom timeouts
pub async fn create_client(
    kubeconfig: Option<&Path>,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Client> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::validation(format!("failed to read kubeconfig: {}", e))
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| Error::validation(format!("failed to load kubeconfig: {}", e)))?
        }
        None => Config::infer()
            .await
            .map_err(|e| Error::validation(format!("failed to infer config: {}", e)))?,
    };
    config.connect_timeout = Some(connect_timeout);
    config.read_timeout = Some(read_timeout);
    Client::try_from(config).map_err(|e| Error::cluster(format!("failed to create client: {}", e)))
}

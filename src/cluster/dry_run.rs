//! Dry-run wrapper: reads hit the cluster, mutations are logged and simulated

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use tracing::info;

use super::{
    ClusterAccess, EvictionResponse, NodeGroupScaling, NodeInfo, PodInfo, PodRef, Readiness,
    WebhookEndpoint, WorkloadInfo, WorkloadKind, WorkloadRef,
};
use crate::Result;

/// [`ClusterAccess`] that never mutates the cluster.
///
/// Simulated writes are kept in an overlay so later reads in the same run
/// observe them, which lets verification steps behave as in a real run.
pub struct DryRunAccess {
    inner: Arc<dyn ClusterAccess>,
    replicas: DashMap<(String, String), u32>,
    node_groups: DashMap<String, NodeGroupScaling>,
    cordoned: DashSet<String>,
}

impl DryRunAccess {
    /// Wrap a real access implementation
    pub fn new(inner: Arc<dyn ClusterAccess>) -> Self {
        Self {
            inner,
            replicas: DashMap::new(),
            node_groups: DashMap::new(),
            cordoned: DashSet::new(),
        }
    }
}

#[async_trait]
impl ClusterAccess for DryRunAccess {
    async fn get_workload(&self, workload: &WorkloadRef) -> Result<Option<WorkloadInfo>> {
        let mut info = self.inner.get_workload(workload).await?;
        if workload.kind == WorkloadKind::Deployment {
            let key = (workload.namespace.clone(), workload.name.clone());
            if let (Some(info), Some(replicas)) = (info.as_mut(), self.replicas.get(&key)) {
                info.replicas = *replicas;
            }
        }
        Ok(info)
    }

    async fn set_deployment_replicas(
        &self,
        namespace: &str,
        name: &str,
        replicas: u32,
    ) -> Result<()> {
        info!(namespace, name, replicas, "[dry-run] would set deployment replicas");
        self.replicas
            .insert((namespace.to_string(), name.to_string()), replicas);
        Ok(())
    }

    async fn list_node_groups(&self) -> Result<Vec<String>> {
        self.inner.list_node_groups().await
    }

    async fn get_node_group(&self, name: &str) -> Result<Option<NodeGroupScaling>> {
        if let Some(simulated) = self.node_groups.get(name) {
            return Ok(Some(*simulated));
        }
        self.inner.get_node_group(name).await
    }

    async fn set_node_group_scaling(&self, name: &str, scaling: NodeGroupScaling) -> Result<()> {
        info!(node_group = %name, %scaling, "[dry-run] would set node group scaling");
        self.node_groups.insert(name.to_string(), scaling);
        Ok(())
    }

    async fn list_nodes(&self, node_group: &str) -> Result<Vec<NodeInfo>> {
        let mut nodes = self.inner.list_nodes(node_group).await?;
        for node in &mut nodes {
            if self.cordoned.contains(&node.name) {
                node.unschedulable = true;
            }
        }
        Ok(nodes)
    }

    async fn list_pods(&self, node: &str) -> Result<Vec<PodInfo>> {
        self.inner.list_pods(node).await
    }

    async fn cordon_node(&self, node: &str) -> Result<()> {
        info!(node, "[dry-run] would cordon node");
        self.cordoned.insert(node.to_string());
        Ok(())
    }

    async fn evict_pod(
        &self,
        pod: &PodRef,
        grace_period_secs: Option<u32>,
    ) -> Result<EvictionResponse> {
        info!(pod = %pod, grace_period_secs = ?grace_period_secs, "[dry-run] would evict pod");
        Ok(EvictionResponse::Evicted)
    }

    async fn force_delete_pod(&self, pod: &PodRef) -> Result<()> {
        info!(pod = %pod, "[dry-run] would force-delete pod");
        Ok(())
    }

    async fn list_admission_webhooks(&self) -> Result<Vec<WebhookEndpoint>> {
        self.inner.list_admission_webhooks().await
    }

    async fn probe_webhook(&self, endpoint: &WebhookEndpoint) -> Result<Readiness> {
        self.inner.probe_webhook(endpoint).await
    }
}

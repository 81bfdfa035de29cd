//! Shared handles passed to every orchestrator component

use std::future::Future;
use std::sync::Arc;

use crate::cluster::{Cluster, ClusterAccess};
use crate::config::DormantConfig;
use crate::retry::{retry_with_backoff, with_timeout};
use crate::state::StateStore;
use crate::Result;

/// Everything a component needs to act on one cluster
#[derive(Clone)]
pub struct Context {
    /// Target cluster
    pub cluster: Cluster,
    /// Control-plane access (possibly a dry-run wrapper)
    pub access: Arc<dyn ClusterAccess>,
    /// Durable state (possibly a dry-run overlay)
    pub store: Arc<dyn StateStore>,
    /// Orchestrator configuration
    pub config: Arc<DormantConfig>,
    /// Whether mutations are simulated
    pub dry_run: bool,
}

impl Context {
    /// Create a context
    pub fn new(
        cluster: Cluster,
        access: Arc<dyn ClusterAccess>,
        store: Arc<dyn StateStore>,
        config: DormantConfig,
        dry_run: bool,
    ) -> Self {
        Self {
            cluster,
            access,
            store,
            config: Arc::new(config),
            dry_run,
        }
    }

    /// Issue a remote call with the per-call timeout and the shared retry policy
    pub async fn call<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let timeout = self.config.calls.timeout();
        retry_with_backoff(&self.config.retry, operation, || {
            with_timeout(timeout, operation, op())
        })
        .await
    }

    /// Issue a single remote read bounded by the per-call timeout.
    ///
    /// Used inside polling loops, which supply their own retry schedule.
    pub async fn read<T, Fut>(&self, operation: &str, fut: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        with_timeout(self.config.calls.timeout(), operation, fut).await
    }
}

//! In-memory overlay used by dry runs

use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use super::{ResourceKind, StateRecord, StateStore};
use crate::Result;

type Key = (String, ResourceKind, String);

/// Reads fall through to the wrapped store; writes and deletes stay in memory.
pub struct DryRunStateStore {
    inner: Arc<dyn StateStore>,
    // None marks a simulated delete
    overlay: DashMap<Key, Option<StateRecord>>,
}

impl DryRunStateStore {
    /// Wrap a durable store
    pub fn new(inner: Arc<dyn StateStore>) -> Self {
        Self {
            inner,
            overlay: DashMap::new(),
        }
    }
}

impl StateStore for DryRunStateStore {
    fn put(&self, record: &StateRecord) -> Result<()> {
        info!(
            cluster = %record.cluster,
            kind = record.kind.as_str(),
            resource = %record.resource_id,
            "[dry-run] would write state record"
        );
        self.overlay.insert(
            (record.cluster.clone(), record.kind, record.resource_id.clone()),
            Some(record.clone()),
        );
        Ok(())
    }

    fn get(
        &self,
        cluster: &str,
        kind: ResourceKind,
        resource_id: &str,
    ) -> Result<Option<StateRecord>> {
        let key = (cluster.to_string(), kind, resource_id.to_string());
        if let Some(entry) = self.overlay.get(&key) {
            return Ok(entry.clone());
        }
        self.inner.get(cluster, kind, resource_id)
    }

    fn delete(&self, cluster: &str, kind: ResourceKind, resource_id: &str) -> Result<()> {
        info!(
            cluster,
            kind = kind.as_str(),
            resource = resource_id,
            "[dry-run] would delete state record"
        );
        self.overlay
            .insert((cluster.to_string(), kind, resource_id.to_string()), None);
        Ok(())
    }

    fn list(&self, cluster: &str, kind: ResourceKind) -> Result<Vec<StateRecord>> {
        let mut records: Vec<StateRecord> = self
            .inner
            .list(cluster, kind)?
            .into_iter()
            .filter(|r| {
                !self
                    .overlay
                    .contains_key(&(cluster.to_string(), kind, r.resource_id.clone()))
            })
            .collect();

        records.extend(
            self.overlay
                .iter()
                .filter(|e| e.key().0 == cluster && e.key().1 == kind)
                .filter_map(|e| e.value().clone()),
        );
        records.sort_by(|a, b| a.resource_id.cmp(&b.resource_id));
        Ok(records)
    }
}

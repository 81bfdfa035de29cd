//! Durable orchestration state
//!
//! Captures taken before a mutation (autoscaler replica count, node-group
//! bounds) are written here first, so a crash between steps always leaves a
//! recoverable trail. Records are addressed by cluster, resource kind and
//! resource identifier, and are consumed (deleted) only after a verified
//! restore.

mod file;
mod overlay;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub use self::file::FileStateStore;
pub use self::overlay::DryRunStateStore;

/// Kind of captured resource
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Autoscaler deployment replica count
    Autoscaler,
    /// Node-group min/max/desired
    NodeGroup,
}

impl ResourceKind {
    /// Stable name used in file paths
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Autoscaler => "autoscaler",
            Self::NodeGroup => "node_group",
        }
    }
}

/// One captured resource
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    /// Resource kind
    pub kind: ResourceKind,
    /// Cluster the resource belongs to
    pub cluster: String,
    /// Resource identifier within the cluster
    pub resource_id: String,
    /// Captured fields
    pub captured: serde_json::Value,
    /// When the capture was taken
    pub captured_at: DateTime<Utc>,
}

impl StateRecord {
    /// Capture a typed value now
    pub fn new<T: Serialize>(
        kind: ResourceKind,
        cluster: &str,
        resource_id: &str,
        captured: &T,
    ) -> Result<Self> {
        Ok(Self {
            kind,
            cluster: cluster.to_string(),
            resource_id: resource_id.to_string(),
            captured: serde_json::to_value(captured)
                .map_err(|e| Error::serialization(e.to_string()))?,
            captured_at: Utc::now(),
        })
    }

    /// Decode the captured fields
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.captured.clone()).map_err(|e| {
            Error::state_store(format!(
                "corrupt {} record {}/{}: {}",
                self.kind.as_str(),
                self.cluster,
                self.resource_id,
                e
            ))
        })
    }
}

/// Per-cluster key-value persistence of captured resources.
///
/// `put` must be durable when it returns: callers issue the corresponding
/// live mutation only afterwards.
pub trait StateStore: Send + Sync {
    /// Write (or overwrite) a record
    fn put(&self, record: &StateRecord) -> Result<()>;

    /// Read a record; a missing record is `Ok(None)`
    fn get(&self, cluster: &str, kind: ResourceKind, resource_id: &str)
        -> Result<Option<StateRecord>>;

    /// Delete a record; deleting a missing record succeeds
    fn delete(&self, cluster: &str, kind: ResourceKind, resource_id: &str) -> Result<()>;

    /// All records of a kind for a cluster
    fn list(&self, cluster: &str, kind: ResourceKind) -> Result<Vec<StateRecord>>;
}

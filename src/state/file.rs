//! File-backed state store: one JSON document per captured resource

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::{ResourceKind, StateRecord, StateStore};
use crate::{Error, Result};

/// Stores records under `<root>/<cluster>/<kind>--<resource-id>.json`.
///
/// Writes go to a temporary file which is fsynced and renamed into place, so
/// a reader never observes a partial document.
#[derive(Clone, Debug)]
pub struct FileStateStore {
    root: PathBuf,
}

impl FileStateStore {
    /// Store rooted at `root` (created on first write)
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn cluster_dir(&self, cluster: &str) -> Result<PathBuf> {
        if cluster.is_empty()
            || cluster == "."
            || cluster == ".."
            || cluster.contains(['/', '\\'])
        {
            return Err(Error::validation(format!(
                "invalid cluster identifier '{}'",
                cluster
            )));
        }
        Ok(self.root.join(cluster))
    }

    fn record_path(&self, cluster: &str, kind: ResourceKind, resource_id: &str) -> Result<PathBuf> {
        Ok(self.cluster_dir(cluster)?.join(format!(
            "{}--{}.json",
            kind.as_str(),
            encode_id(resource_id)
        )))
    }
}

/// Injective, filesystem-safe encoding of a resource identifier
fn encode_id(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    for c in id.chars() {
        match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '.' | '_' => out.push(c),
            other => {
                let mut buf = [0u8; 4];
                for b in other.encode_utf8(&mut buf).bytes() {
                    out.push_str(&format!("%{:02X}", b));
                }
            }
        }
    }
    out
}

impl StateStore for FileStateStore {
    fn put(&self, record: &StateRecord) -> Result<()> {
        let path = self.record_path(&record.cluster, record.kind, &record.resource_id)?;
        let dir = self.cluster_dir(&record.cluster)?;
        fs::create_dir_all(&dir).map_err(|e| {
            Error::state_store(format!("failed to create {}: {}", dir.display(), e))
        })?;

        let body = serde_json::to_vec_pretty(record)
            .map_err(|e| Error::serialization(e.to_string()))?;

        let tmp = path.with_extension("json.tmp");
        let write = || -> std::io::Result<()> {
            let mut file = File::create(&tmp)?;
            file.write_all(&body)?;
            file.sync_all()?;
            fs::rename(&tmp, &path)?;
            // persist the rename itself
            File::open(&dir)?.sync_all()
        };
        write().map_err(|e| {
            let _ = fs::remove_file(&tmp);
            Error::state_store(format!("failed to write {}: {}", path.display(), e))
        })?;

        debug!(path = %path.display(), "Wrote state record");
        Ok(())
    }

    fn get(
        &self,
        cluster: &str,
        kind: ResourceKind,
        resource_id: &str,
    ) -> Result<Option<StateRecord>> {
        let path = self.record_path(cluster, kind, resource_id)?;
        let body = match fs::read(&path) {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::state_store(format!(
                    "failed to read {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        serde_json::from_slice(&body).map(Some).map_err(|e| {
            Error::state_store(format!("corrupt record {}: {}", path.display(), e))
        })
    }

    fn delete(&self, cluster: &str, kind: ResourceKind, resource_id: &str) -> Result<()> {
        let path = self.record_path(cluster, kind, resource_id)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(path = %path.display(), "Deleted state record");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::state_store(format!(
                "failed to delete {}: {}",
                path.display(),
                e
            ))),
        }
    }

    fn list(&self, cluster: &str, kind: ResourceKind) -> Result<Vec<StateRecord>> {
        let dir = self.cluster_dir(cluster)?;
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(Error::state_store(format!(
                    "failed to list {}: {}",
                    dir.display(),
                    e
                )))
            }
        };

        let prefix = format!("{}--", kind.as_str());
        let mut records = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.starts_with(&prefix) || !name.ends_with(".json") {
                continue;
            }
            // An unreadable file is surfaced by `get` for its own resource.
            let record = fs::read(entry.path())
                .map_err(|e| e.to_string())
                .and_then(|body| {
                    serde_json::from_slice::<StateRecord>(&body).map_err(|e| e.to_string())
                });
            match record {
                Ok(record) => records.push(record),
                Err(e) => warn!(file = %name, error = %e, "Skipping unreadable state record"),
            }
        }
        records.sort_by(|a, b| a.resource_id.cmp(&b.resource_id));
        Ok(records)
    }
}

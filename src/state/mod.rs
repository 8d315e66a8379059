//! Agent State Export
//!
//! Latest status snapshot per agent, readable concurrently by the
//! supervisor and optionally mirrored to a JSON file for dashboards.

use anyhow::{Context, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

use crate::collaborators::StateSink;
use crate::utils::types::StatusSnapshot;

/// Central snapshot store
pub struct StateExporter {
    snapshots: DashMap<String, StatusSnapshot>,
    export_path: Option<PathBuf>,
    write_lock: Mutex<()>,
    publish_count: AtomicU64,
}

impl StateExporter {
    pub fn new(export_path: Option<PathBuf>) -> Self {
        Self {
            snapshots: DashMap::new(),
            export_path,
            write_lock: Mutex::new(()),
            publish_count: AtomicU64::new(0),
        }
    }

    pub fn get(&self, id: &str) -> Option<StatusSnapshot> {
        self.snapshots.get(id).map(|s| s.value().clone())
    }

    /// All snapshots ordered by agent id
    pub fn all(&self) -> BTreeMap<String, StatusSnapshot> {
        self.snapshots
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn publish_count(&self) -> u64 {
        self.publish_count.load(Ordering::Relaxed)
    }

    /// Write every snapshot to `path` as one JSON object keyed by agent id
    pub fn export_to(&self, path: &Path) -> Result<()> {
        let _guard = self.write_lock.lock();
        let body = serde_json::to_vec_pretty(&self.all())?;

        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, body).with_context(|| format!("Failed to write {:?}", tmp))?;
        std::fs::rename(&tmp, path).with_context(|| format!("Failed to replace {:?}", path))?;
        Ok(())
    }
}

impl Default for StateExporter {
    fn default() -> Self {
        Self::new(None)
    }
}

impl StateSink for StateExporter {
    fn publish(&self, snapshot: StatusSnapshot) {
        debug!(agent = %snapshot.id, status = %snapshot.status, "Status snapshot");
        self.snapshots.insert(snapshot.id.clone(), snapshot);
        self.publish_count.fetch_add(1, Ordering::Relaxed);

        if let Some(path) = &self.export_path {
            if let Err(e) = self.export_to(path) {
                warn!(error = %e, "State export failed");
            }
        }
    }
}

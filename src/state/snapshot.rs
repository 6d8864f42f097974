//! JSON snapshot of a run: artifact history plus workflow counters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::core::{Artifact, ArtifactStore};
use crate::util::blocking;
use crate::workflow::{WorkflowEngine, WorkflowRun};
use crate::{Error, Result};

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub project: String,
    /// Every stored artifact version, grouped by type in version order.
    pub artifacts: Vec<Artifact>,
    pub run: WorkflowRun,
    pub saved_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn capture(project: &str, store: &ArtifactStore, run: &WorkflowRun) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            project: project.to_string(),
            artifacts: store.all(),
            run: run.clone(),
            saved_at: Utc::now(),
        }
    }

    /// Rebuild the store and adopt the run counters into `engine`.
    ///
    /// `engine` must declare the same phases, in the same order, as the
    /// engine the snapshot was taken from.
    pub fn restore(self, engine: &mut WorkflowEngine) -> Result<ArtifactStore> {
        if self.project != engine.project() {
            return Err(Error::CorruptHistory(format!(
                "snapshot belongs to project '{}', not '{}'",
                self.project,
                engine.project()
            )));
        }
        let store = ArtifactStore::from_history(self.artifacts)?;
        engine.restore(self.run)?;
        tracing::info!(project = %self.project, artifacts = store.len(), "snapshot restored");
        Ok(store)
    }

    pub fn load_from(path: &Path) -> Result<Option<Self>> {
        tracing::debug!(path = %path.display(), "Snapshot::load_from");
        if !path.exists() {
            tracing::debug!("snapshot not found");
            return Ok(None);
        }
        let snapshot: Snapshot = serde_json::from_str(&fs::read_to_string(path)?)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(Error::CorruptHistory(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }
        tracing::debug!(artifacts = snapshot.artifacts.len(), "snapshot loaded");
        Ok(Some(snapshot))
    }

    /// Write atomically, keeping the previous file as `.json.bak`.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        write_atomic(path, &serde_json::to_string_pretty(self)?)
    }

    pub async fn load(path: PathBuf) -> Result<Option<Self>> {
        blocking(move || Self::load_from(&path)).await
    }

    pub async fn save(&self, path: PathBuf) -> Result<()> {
        let contents = serde_json::to_string_pretty(self)?;
        blocking(move || write_atomic(&path, &contents)).await
    }
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }
    if path.exists() {
        let backup = path.with_extension("json.bak");
        fs::copy(path, &backup)?;
    }
    let temp = path.with_extension("json.tmp");
    fs::write(&temp, contents)?;
    fs::rename(&temp, path)?;
    tracing::debug!(path = %path.display(), "snapshot saved");
    Ok(())
}

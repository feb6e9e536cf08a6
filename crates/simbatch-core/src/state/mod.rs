//! Snapshot persistence — one JSON document holding folders, jobs, and
//! settings.
//!
//! Loads are permissive: a missing or unparsable file yields an empty
//! snapshot (the file is left in place for inspection), unknown fields are
//! ignored, and the result is normalized so scheduler invariants hold —
//! in particular, no job is ever Running after a load.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use simbatch_types::{display_name, FolderId, JobId, JobStatus, Snapshot};
use thiserror::Error;
use tracing::{debug, warn};

use crate::inspect;

/// Why a snapshot could not be read back.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Load/save of the persisted queue document.
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load and normalize the snapshot. Absent or corrupt files yield an
    /// empty snapshot; corruption is reported but the file is not deleted.
    pub fn load(&self) -> Snapshot {
        let mut snapshot = match self.read() {
            Ok(snapshot) => snapshot,
            Err(StateError::Read { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no state file; starting empty");
                Snapshot::default()
            }
            Err(e) => {
                warn!(error = %e, "state file unusable; starting empty");
                Snapshot::default()
            }
        };
        normalize(&mut snapshot);
        snapshot
    }

    fn read(&self) -> Result<Snapshot, StateError> {
        let raw = std::fs::read_to_string(&self.path).map_err(|source| StateError::Read {
            path: self.path.clone(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| StateError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    /// Persist the snapshot as indented JSON, enum values as their symbolic
    /// names. Callers treat failures as non-fatal.
    pub fn save(&self, snapshot: &Snapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating state directory {}", parent.display()))?;
            }
        }
        let json = serde_json::to_string_pretty(snapshot).context("serializing snapshot")?;
        std::fs::write(&self.path, json)
            .with_context(|| format!("writing {}", self.path.display()))?;
        Ok(())
    }
}

/// Repair a freshly loaded snapshot so scheduler invariants hold. Idempotent.
pub fn normalize(snapshot: &mut Snapshot) {
    let mut seen_folder_ids: HashSet<String> = HashSet::new();
    let mut seen_job_ids: HashSet<String> = HashSet::new();

    for folder in &mut snapshot.folders {
        if folder.id.is_blank() || !seen_folder_ids.insert(folder.id.0.clone()) {
            folder.id = FolderId::new();
            seen_folder_ids.insert(folder.id.0.clone());
        }
        if folder.name.trim().is_empty() {
            folder.name = display_name(&folder.path);
        }

        for job in &mut folder.jobs {
            if job.id.is_blank() || !seen_job_ids.insert(job.id.0.clone()) {
                job.id = JobId::new();
                seen_job_ids.insert(job.id.0.clone());
            }
            if job.name.trim().is_empty() {
                job.name = display_name(&job.bat_path);
            }
            if job.bat_path.is_file() {
                job.required_cores = inspect::required_cores(&job.bat_path);
            }
            job.required_cores = job.required_cores.max(1);

            // A job persisted as Running was mid-flight when the previous
            // process died; it is re-queued, never resumed.
            if job.status == JobStatus::Running {
                job.status = JobStatus::Queued;
                job.reset_run_fields();
            }
        }

        folder.recompute_status();
    }
}

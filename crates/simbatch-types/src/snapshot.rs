//! The persisted whole-system document and derived observation types.

use serde::{Deserialize, Serialize};

use crate::folder::Folder;
use crate::job::{Job, JobId};
use crate::settings::Settings;

/// Everything the orchestrator persists: folders (with their jobs) plus
/// settings. Unknown fields in a stored document are ignored on load.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
pub struct Snapshot {
    pub folders: Vec<Folder>,
    pub settings: Settings,
}

impl Snapshot {
    pub fn find_job(&self, id: &JobId) -> Option<&Job> {
        self.folders.iter().find_map(|f| f.job(id))
    }

    pub fn job_count(&self) -> usize {
        self.folders.iter().map(|f| f.jobs.len()).sum()
    }
}

/// Core-budget counters reported by `observe()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreUsage {
    /// Physical cores on the host (or the configured override).
    pub total: usize,
    /// Σ `required_cores` of Running jobs.
    pub used: usize,
    pub available: usize,
}

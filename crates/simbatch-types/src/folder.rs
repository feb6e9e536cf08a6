//! Folders — ordered groups of jobs sharing a working directory.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::{Job, JobStatus};

/// Unique identifier for a folder.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct FolderId(pub String);

impl FolderId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl std::fmt::Display for FolderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An ordered, named group of jobs sharing a working directory.
///
/// `status` is derived from the member jobs and eagerly recomputed by the
/// scheduler after every transition; it is never an independent input.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
pub struct Folder {
    pub id: FolderId,
    pub name: String,
    pub path: PathBuf,
    pub status: JobStatus,
    /// UI hint, persisted but opaque to the core.
    pub is_expanded: bool,
    pub jobs: Vec<Job>,
}

impl Folder {
    /// Create a queued folder named after its directory.
    pub fn new(path: impl Into<PathBuf>, jobs: Vec<Job>) -> Self {
        let path = path.into();
        Self {
            id: FolderId::new(),
            name: crate::job::display_name(&path),
            path,
            status: JobStatus::Queued,
            is_expanded: true,
            jobs,
        }
    }

    pub fn job(&self, id: &crate::JobId) -> Option<&Job> {
        self.jobs.iter().find(|j| &j.id == id)
    }

    pub fn has_running_job(&self) -> bool {
        self.jobs.iter().any(|j| j.status == JobStatus::Running)
    }

    /// Re-derive the aggregate status from the member jobs.
    pub fn recompute_status(&mut self) {
        self.status = self.derive_status();
    }

    fn derive_status(&self) -> JobStatus {
        if self.has_running_job() {
            return JobStatus::Running;
        }
        if !self.jobs.is_empty() && self.jobs.iter().all(|j| j.status == JobStatus::Completed) {
            return JobStatus::Completed;
        }
        // The most recent terminal transition decides between Failed,
        // Cancelled, and a folder that is still (or again) queued.
        let mut latest: Option<(DateTime<Local>, JobStatus)> = None;
        for job in &self.jobs {
            if matches!(job.status, JobStatus::Failed | JobStatus::Cancelled) {
                let ended = job.ended_at.unwrap_or(job.added_at);
                if latest.map_or(true, |(t, _)| ended >= t) {
                    latest = Some((ended, job.status));
                }
            }
        }
        match latest {
            Some((_, status)) => status,
            None => JobStatus::Queued,
        }
    }
}

/// Compare two enrolled paths the way the queue does: case-insensitively,
/// ignoring a trailing separator.
pub fn same_folder_path(a: &Path, b: &Path) -> bool {
    let norm = |p: &Path| {
        p.to_string_lossy()
            .trim_end_matches(['/', '\\'])
            .to_lowercase()
    };
    norm(a) == norm(b)
}

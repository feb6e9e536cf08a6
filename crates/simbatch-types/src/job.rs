//! Job identification, lifecycle status, and the job record itself.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a job. Assigned at creation, never reused.
///
/// Stored as a string so that snapshots written by older builds with blank
/// ids still parse; load-normalization fills blanks with fresh values.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a fresh id.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// True when the id carries no value and must be refilled on load.
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a job, and in aggregate of a folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum JobStatus {
    /// Waiting for admission.
    #[default]
    Queued,
    /// A supervisor owns a live child for this job.
    Running,
    /// The child exited with code 0.
    Completed,
    /// The child exited non-zero, its code was unreadable, or the spawn
    /// itself failed.
    Failed,
    /// Cancelled by the user, either from the queue or mid-run.
    Cancelled,
}

impl JobStatus {
    /// Completed, Failed, and Cancelled are terminal.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            JobStatus::Queued => "Queued",
            JobStatus::Running => "Running",
            JobStatus::Completed => "Completed",
            JobStatus::Failed => "Failed",
            JobStatus::Cancelled => "Cancelled",
        };
        write!(f, "{label}")
    }
}

/// A single script invocation with a fixed core requirement and a lifecycle
/// state.
///
/// The scheduler exclusively owns mutation of `status`, the run timestamps,
/// `exit_code`, and `log_path`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Job {
    pub id: JobId,
    /// Display label, defaulting to the script's file name.
    pub name: String,
    /// Absolute path to the script.
    pub bat_path: PathBuf,
    /// Physical cores this run occupies while Running. Always ≥ 1.
    pub required_cores: usize,
    pub status: JobStatus,
    pub added_at: DateTime<Local>,
    /// Set when a run starts; cleared on requeue. Unset together with
    /// `ended_at` iff the job never started.
    pub started_at: Option<DateTime<Local>>,
    pub ended_at: Option<DateTime<Local>>,
    /// Present iff a process completed and its code was retrievable.
    pub exit_code: Option<i32>,
    /// Log file of the current or most recent run.
    pub log_path: Option<PathBuf>,
    /// Auto-retry attempts consumed. Reset only by a user-initiated restart.
    pub retry_count: u32,
}

impl Default for Job {
    fn default() -> Self {
        Self {
            id: JobId::default(),
            name: String::new(),
            bat_path: PathBuf::new(),
            required_cores: 1,
            status: JobStatus::default(),
            added_at: Local::now(),
            started_at: None,
            ended_at: None,
            exit_code: None,
            log_path: None,
            retry_count: 0,
        }
    }
}

impl Job {
    /// Create a queued job for `bat_path`, named after the file.
    pub fn new(bat_path: impl Into<PathBuf>, required_cores: usize) -> Self {
        let bat_path = bat_path.into();
        Self {
            id: JobId::new(),
            name: display_name(&bat_path),
            required_cores: required_cores.max(1),
            bat_path,
            ..Self::default()
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Clear the per-run fields ahead of a requeue (restart or auto-retry).
    pub fn reset_run_fields(&mut self) {
        self.started_at = None;
        self.ended_at = None;
        self.exit_code = None;
        self.log_path = None;
    }
}

/// File name of `path`, or the whole path when there is no final component.
pub fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

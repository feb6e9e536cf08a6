//! The orchestrator — the mutation surface a front-end drives.
//!
//! Owns the scheduler, persistence, and the event channel. Construction
//! loads and normalizes the persisted snapshot, so no job is ever Running
//! after startup. Every control operation is followed by a best-effort
//! state save inside the scheduler.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use simbatch_types::{CoreUsage, Folder, FolderId, Job, JobId, Settings, Snapshot};
use tracing::{debug, info};

use crate::cores;
use crate::inspect;
use crate::logsink;
use crate::paths;
use crate::process_control::{NativeControls, ProcessControls};
use crate::scheduler::{event_channel, EventReceiver, Scheduler};
use crate::state::StateStore;

/// Scripts enrolled from a folder, in execution order. Missing ones are
/// skipped.
pub const KNOWN_SCRIPTS: [&str; 5] = [
    "prepare_case.bat",
    "generate_mesh.bat",
    "decompose_case.bat",
    "run_solver.bat",
    "save_results.bat",
];

/// Marker files whose presence means a folder was already processed and
/// must not be enrolled again.
const COMPLETED_MARKERS: [&str; 2] = [logsink::SUMMARY_FILE_NAME, "save_results.log"];

/// Construction knobs for [`Orchestrator`].
pub struct OrchestratorConfig {
    /// Location of the persisted snapshot.
    pub state_path: PathBuf,
    /// Directory receiving per-run log files.
    pub log_root: PathBuf,
    /// Core budget override; `None` probes the host once.
    pub total_cores: Option<usize>,
    /// Priority-elevation hook; swap for `NoopControls` in tests.
    pub controls: Arc<dyn ProcessControls>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            state_path: paths::state_file(),
            log_root: paths::log_dir(),
            total_cores: None,
            controls: Arc::new(NativeControls),
        }
    }
}

/// The Control API: add, remove, reorder, cancel, restart, start/pause the
/// queue, observe counts.
///
/// User errors (unknown ids, out-of-range indices) are no-ops; enrollment
/// reports acceptance through its return value. Everything else is
/// asynchronous only in the sense that it serializes on the scheduler lock.
pub struct Orchestrator {
    scheduler: Arc<Scheduler>,
    events: Option<EventReceiver>,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig) -> Self {
        let store = StateStore::new(config.state_path);
        let snapshot = store.load();
        let total_cores = config
            .total_cores
            .unwrap_or_else(cores::total_physical_cores);
        info!(
            total_cores,
            folders = snapshot.folders.len(),
            jobs = snapshot.job_count(),
            "orchestrator ready"
        );

        let (sender, receiver) = event_channel();
        let scheduler = Scheduler::new(
            snapshot,
            store,
            sender,
            config.controls,
            config.log_root,
            total_cores,
        );
        Self {
            scheduler,
            events: Some(receiver),
        }
    }

    /// Take the event receiver. There is exactly one; subsequent calls
    /// return `None`.
    pub fn take_events(&mut self) -> Option<EventReceiver> {
        self.events.take()
    }

    /// Enroll a case folder: the known scripts present in it, in fixed
    /// order. Returns `None` when the folder is already enrolled, was
    /// already processed, or contains none of the known scripts.
    pub async fn add_folder(&self, path: impl AsRef<Path>) -> Option<FolderId> {
        let path = path.as_ref();
        if already_completed(path) {
            info!(path = %path.display(), "folder already processed; skipping");
            return None;
        }
        let jobs: Vec<Job> = KNOWN_SCRIPTS
            .iter()
            .map(|name| path.join(name))
            .filter(|script| script.is_file())
            .map(|script| {
                let required = inspect::required_cores(&script);
                Job::new(script, required)
            })
            .collect();
        if jobs.is_empty() {
            debug!(path = %path.display(), "no known scripts in folder");
            return None;
        }
        self.scheduler.add_folder(Folder::new(path, jobs)).await
    }

    /// Enroll a single script as a synthetic one-job folder.
    pub async fn add_job(&self, script: impl AsRef<Path>) -> Option<FolderId> {
        let script = script.as_ref();
        if !script.is_file() {
            debug!(path = %script.display(), "script does not exist");
            return None;
        }
        let job = Job::new(script, inspect::required_cores(script));
        let dir = script.parent().filter(|p| !p.as_os_str().is_empty());
        let mut folder = Folder::new(dir.unwrap_or(Path::new(".")), vec![job]);
        folder.name = folder.jobs[0].name.clone();
        Some(self.scheduler.add_single_job(folder).await)
    }

    /// Cancel any running jobs inside the folder, then delete it.
    pub async fn remove_folder(&self, folder_id: &FolderId) {
        self.scheduler.remove_folder(folder_id).await;
    }

    pub async fn reorder_folders(&self, from: usize, to: usize) {
        self.scheduler.reorder_folders(from, to).await;
    }

    pub async fn reorder_jobs(&self, folder_id: &FolderId, from: usize, to: usize) {
        self.scheduler.reorder_jobs(folder_id, from, to).await;
    }

    pub async fn cancel_job(&self, job_id: &JobId) {
        self.scheduler.cancel_job(job_id).await;
    }

    pub async fn restart_job(&self, job_id: &JobId) {
        self.scheduler.restart_job(job_id).await;
    }

    pub async fn start_queue(&self) {
        self.scheduler.start_queue().await;
    }

    pub async fn pause_queue(&self) {
        self.scheduler.pause_queue().await;
    }

    pub async fn update_settings(&self, settings: Settings) {
        self.scheduler.update_settings(settings).await;
    }

    /// Core counters plus an immutable view of the whole queue.
    pub async fn observe(&self) -> (CoreUsage, Snapshot) {
        self.scheduler.observe().await
    }

    /// Force-kill all tracked children. In-flight jobs come back Queued on
    /// the next load.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
    }
}

fn already_completed(path: &Path) -> bool {
    COMPLETED_MARKERS
        .iter()
        .any(|marker| path.join(marker).exists())
}

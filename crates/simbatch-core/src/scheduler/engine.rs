//! The admission, dispatch, and completion engine.
//!
//! All job and folder state lives behind a single async mutex; admission
//! passes, completion handling, and control operations are serialized by
//! it. Suspension points — spawning, process-table reads, log writes, state
//! saves — always run outside the lock: take state, release, perform I/O,
//! re-enter to commit.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use chrono::Local;
use simbatch_types::{
    same_folder_path, CoreUsage, Folder, FolderId, Job, JobId, JobStatus, Settings, Snapshot,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::events::{EventSender, SchedulerEvent};
use super::supervisor;
use crate::logsink;
use crate::process_control::ProcessControls;
use crate::proctree;
use crate::state::StateStore;

/// Scheduler state guarded by the serialization lock.
struct Inner {
    folders: Vec<Folder>,
    settings: Settings,
    /// True while the user has the queue running (admission permitted).
    queue_running: bool,
    /// Re-entrancy guard for `try_start_jobs`: recursive entry is a no-op.
    admission_active: bool,
    /// Set when a pass was refused by the guard; the active pass loops
    /// once more instead, so no completion is ever left unadmitted.
    admission_pending: bool,
    running: HashMap<JobId, RunningJob>,
}

/// Book-keeping for one live child.
#[derive(Debug, Default)]
struct RunningJob {
    pid: Option<u32>,
    cancel_requested: bool,
    restart_requested: bool,
}

/// A job committed to Running by an admission pass, awaiting its spawn.
struct Launch {
    folder_id: FolderId,
    log_path: PathBuf,
    show_console: bool,
    job: Job,
}

/// The admission, dispatch, and completion engine.
///
/// Owns the job state machine and the core budget. The Control API layer
/// calls in for mutations; supervisors call back through [`Scheduler::on_exit`].
pub struct Scheduler {
    inner: Mutex<Inner>,
    store: StateStore,
    events: EventSender,
    controls: Arc<dyn ProcessControls>,
    log_root: PathBuf,
    total_cores: usize,
    /// Handle to ourselves for the supervisor tasks we spawn.
    self_ref: Weak<Scheduler>,
}

impl Scheduler {
    /// Build a scheduler over a loaded (already normalized) snapshot.
    pub fn new(
        snapshot: Snapshot,
        store: StateStore,
        events: EventSender,
        controls: Arc<dyn ProcessControls>,
        log_root: PathBuf,
        total_cores: usize,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            inner: Mutex::new(Inner {
                folders: snapshot.folders,
                settings: snapshot.settings,
                queue_running: false,
                admission_active: false,
                admission_pending: false,
                running: HashMap::new(),
            }),
            store,
            events,
            controls,
            log_root,
            total_cores: total_cores.max(1),
            self_ref: self_ref.clone(),
        })
    }

    /// Total physical cores this scheduler budgets against.
    pub fn total_cores(&self) -> usize {
        self.total_cores
    }

    // ================================================================
    // Admission
    // ================================================================

    /// Run one admission pass.
    ///
    /// Folders are considered in user order; within a folder jobs run
    /// strictly sequentially. A folder whose next job does not fit the
    /// remaining budget is skipped so a smaller job in a later folder can
    /// still start. Folders containing a Failed or Cancelled job are
    /// skipped too — they never stop the rest of the queue.
    ///
    /// When the pass ends with nothing running and nothing queued, the
    /// queue pauses itself and `QueueFinished` fires once.
    pub async fn try_start_jobs(&self) {
        {
            let mut inner = self.inner.lock().await;
            if !inner.queue_running {
                return;
            }
            if inner.admission_active {
                // A pass is mid-flight; ask it to go around once more so
                // the completion that triggered us is not left unadmitted.
                inner.admission_pending = true;
                return;
            }
            inner.admission_active = true;
            inner.admission_pending = false;
        }

        loop {
            let launches = {
                let mut inner = self.inner.lock().await;
                if inner.queue_running {
                    inner.select_admissions(self.total_cores, &self.log_root)
                } else {
                    Vec::new()
                }
            };
            if !launches.is_empty() {
                for launch in launches {
                    // A failed spawn marks the job Failed and frees its
                    // budget; the next select fills the gap.
                    let _ = self.launch(launch).await;
                }
                continue;
            }

            let mut inner = self.inner.lock().await;
            if inner.admission_pending {
                inner.admission_pending = false;
                continue;
            }
            inner.admission_active = false;
            let finished =
                inner.queue_running && !inner.any_running() && !inner.any_startable_queued();
            if finished {
                inner.queue_running = false;
            }
            drop(inner);
            if finished {
                info!("queue drained; pausing");
                self.events.emit(SchedulerEvent::QueueFinished);
            }
            break;
        }
        self.persist().await;
    }

    /// Spawn the child for an admitted job. Returns false when the spawn
    /// failed; the job is then Failed and its budget released.
    ///
    /// Returns an explicitly boxed, explicitly `Send` future (rather than
    /// `async fn`) so the compiler doesn't need to infer `Send` through the
    /// cycle `launch` -> spawned task -> `on_exit` -> `try_start_jobs` ->
    /// `launch`.
    fn launch<'a>(
        &'a self,
        launch: Launch,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = bool> + Send + 'a>> {
        Box::pin(async move {
            logsink::write_header(&launch.log_path, &launch.job);

            match supervisor::launch(&launch.job.bat_path, launch.show_console) {
                Ok(child) => {
                    let pid = child.id();
                    if let Some(pid) = pid {
                        self.controls.elevate(pid);
                    }

                    // Commit the pid; a cancel/restart that raced the spawn is
                    // honored here because no kill could have been issued yet.
                    let kill_now = {
                        let mut inner = self.inner.lock().await;
                        match inner.running.get_mut(&launch.job.id) {
                            Some(entry) => {
                                entry.pid = pid;
                                entry.cancel_requested || entry.restart_requested
                            }
                            None => false,
                        }
                    };
                    if kill_now {
                        if let Some(pid) = pid {
                            kill_tree_detached(pid);
                        }
                    }

                    info!(
                        job = %launch.job.id,
                        name = %launch.job.name,
                        cores = launch.job.required_cores,
                        "job started"
                    );
                    self.events.emit(SchedulerEvent::JobStarted {
                        folder: launch.folder_id,
                        job: launch.job.id.clone(),
                    });

                    let job_id = launch.job.id.clone();
                    let log_path = launch.log_path;
                    // Always upgradable: `&self` proves at least one strong ref.
                    let scheduler = self.self_ref.upgrade();
                    let _ = tokio::spawn(async move {
                        let report = supervisor::supervise(child, log_path).await;
                        if let Some(scheduler) = scheduler {
                            scheduler.on_exit(&job_id, report.exit_code).await;
                        }
                    });
                    true
                }
                Err(e) => {
                    warn!(job = %launch.job.id, error = %e, "spawn failed");
                    logsink::append_line(&launch.log_path, &format!("failed to start: {e:#}"));

                    let mut inner = self.inner.lock().await;
                    inner.running.remove(&launch.job.id);
                    if let Some((fi, ji)) = inner.locate(&launch.job.id) {
                        let folder = &mut inner.folders[fi];
                        let job = &mut folder.jobs[ji];
                        job.status = JobStatus::Failed;
                        job.ended_at = Some(Local::now());
                        folder.recompute_status();
                    }
                    false
                }
            }
        })
    }

    // ================================================================
    // Completion
    // ================================================================

    /// Completion handler, posted by a supervisor once the whole process
    /// tree of a job has exited.
    pub async fn on_exit(&self, job_id: &JobId, exit_code: Option<i32>) {
        let mut footer: Option<(PathBuf, Job, &'static str)> = None;
        let mut summary: Option<(PathBuf, String, Vec<Job>)> = None;
        let mut event: Option<SchedulerEvent> = None;
        {
            let mut inner = self.inner.lock().await;
            let entry = inner.running.remove(job_id).unwrap_or_default();
            let auto_retry = inner.settings.auto_retry_failed_jobs;

            if let Some((fi, ji)) = inner.locate(job_id) {
                let folder = &mut inner.folders[fi];
                let folder_id = folder.id.clone();
                let job = &mut folder.jobs[ji];
                job.ended_at = Some(Local::now());
                job.exit_code = exit_code;
                let footer_job = job.clone();

                let label: &'static str = if entry.restart_requested {
                    job.reset_run_fields();
                    job.retry_count = 0;
                    job.status = JobStatus::Queued;
                    "Restarted"
                } else if entry.cancel_requested {
                    job.status = JobStatus::Cancelled;
                    "Cancelled"
                } else if exit_code == Some(0) {
                    job.status = JobStatus::Completed;
                    "Completed"
                } else if auto_retry && job.retry_count < 1 {
                    job.retry_count += 1;
                    job.reset_run_fields();
                    job.status = JobStatus::Queued;
                    "Failed (auto retry)"
                } else {
                    job.status = JobStatus::Failed;
                    "Failed"
                };

                let status_after = job.status;
                folder.recompute_status();
                if folder.status == JobStatus::Completed {
                    summary = Some((
                        folder.path.join(logsink::SUMMARY_FILE_NAME),
                        folder.name.clone(),
                        folder.jobs.clone(),
                    ));
                }
                if let Some(path) = footer_job.log_path.clone() {
                    footer = Some((path, footer_job, label));
                }
                event = Some(SchedulerEvent::JobFinished {
                    folder: folder_id,
                    job: job_id.clone(),
                    status: status_after,
                });
            } else {
                debug!(job = %job_id, "exit for a job no longer tracked");
            }
        }

        if let Some((path, job, label)) = footer {
            info!(job = %job.id, status = label, exit = ?job.exit_code, "job finished");
            logsink::append_footer(&path, &job, label);
        }
        if let Some((path, name, jobs)) = summary {
            logsink::write_folder_summary(&path, &name, &jobs);
        }
        if let Some(event) = event {
            self.events.emit(event);
        }

        self.persist().await;
        self.try_start_jobs().await;
    }

    // ================================================================
    // Cancel / restart
    // ================================================================

    /// Cancel a job. Running jobs get their tree killed and finalize
    /// through the completion path; queued jobs cancel immediately;
    /// terminal jobs and unknown ids are no-ops.
    pub async fn cancel_job(&self, job_id: &JobId) {
        enum Outcome {
            Kill(Option<u32>),
            CancelledInQueue(SchedulerEvent),
            Noop,
        }

        let outcome = {
            let mut inner = self.inner.lock().await;
            match inner.locate(job_id) {
                None => Outcome::Noop,
                Some((fi, ji)) => match inner.folders[fi].jobs[ji].status {
                    JobStatus::Running => match inner.running.get_mut(job_id) {
                        Some(entry) => {
                            entry.cancel_requested = true;
                            Outcome::Kill(entry.pid)
                        }
                        None => Outcome::Noop,
                    },
                    JobStatus::Queued => {
                        let folder = &mut inner.folders[fi];
                        let job = &mut folder.jobs[ji];
                        job.status = JobStatus::Cancelled;
                        job.ended_at = Some(Local::now());
                        let event = SchedulerEvent::JobFinished {
                            folder: folder.id.clone(),
                            job: job.id.clone(),
                            status: JobStatus::Cancelled,
                        };
                        folder.recompute_status();
                        Outcome::CancelledInQueue(event)
                    }
                    _ => Outcome::Noop,
                },
            }
        };

        match outcome {
            Outcome::Kill(pid) => {
                info!(job = %job_id, ?pid, "cancelling running job");
                if let Some(pid) = pid {
                    kill_tree_detached(pid);
                }
                // pid not known yet: the spawn commit in `launch` sees the
                // intent flag and issues the kill itself.
            }
            Outcome::CancelledInQueue(event) => {
                info!(job = %job_id, "cancelled from queue");
                self.events.emit(event);
                self.persist().await;
            }
            Outcome::Noop => {}
        }
    }

    /// Restart a job. A running job is killed and re-queued by the
    /// completion path; an idle job resets and re-queues immediately.
    /// Either way `retry_count` starts over.
    pub async fn restart_job(&self, job_id: &JobId) {
        enum Outcome {
            Kill(Option<u32>),
            Requeued,
            Noop,
        }

        let outcome = {
            let mut inner = self.inner.lock().await;
            match inner.locate(job_id) {
                None => Outcome::Noop,
                Some((fi, ji)) => {
                    if inner.folders[fi].jobs[ji].status == JobStatus::Running {
                        match inner.running.get_mut(job_id) {
                            Some(entry) => {
                                entry.restart_requested = true;
                                Outcome::Kill(entry.pid)
                            }
                            None => Outcome::Noop,
                        }
                    } else {
                        let folder = &mut inner.folders[fi];
                        let job = &mut folder.jobs[ji];
                        job.reset_run_fields();
                        job.retry_count = 0;
                        job.status = JobStatus::Queued;
                        folder.recompute_status();
                        Outcome::Requeued
                    }
                }
            }
        };

        match outcome {
            Outcome::Kill(pid) => {
                info!(job = %job_id, ?pid, "restarting running job");
                if let Some(pid) = pid {
                    kill_tree_detached(pid);
                }
            }
            Outcome::Requeued => {
                info!(job = %job_id, "job re-queued");
                self.persist().await;
                self.try_start_jobs().await;
            }
            Outcome::Noop => {}
        }
    }

    // ================================================================
    // Queue control
    // ================================================================

    /// Permit admission passes and immediately run one.
    pub async fn start_queue(&self) {
        {
            let mut inner = self.inner.lock().await;
            inner.queue_running = true;
        }
        info!("queue started");
        self.try_start_jobs().await;
    }

    /// Forbid further admissions. Already-running jobs are unaffected.
    pub async fn pause_queue(&self) {
        {
            let mut inner = self.inner.lock().await;
            inner.queue_running = false;
        }
        info!("queue paused");
        self.persist().await;
    }

    // ================================================================
    // Structure mutations (Control API)
    // ================================================================

    /// Insert an enrolled folder, rejecting paths already present
    /// (case-insensitive match). Returns the id on acceptance.
    pub async fn add_folder(&self, folder: Folder) -> Option<FolderId> {
        let id = {
            let mut inner = self.inner.lock().await;
            if inner
                .folders
                .iter()
                .any(|f| same_folder_path(&f.path, &folder.path))
            {
                debug!(path = %folder.path.display(), "folder already enrolled");
                return None;
            }
            let id = folder.id.clone();
            inner.folders.push(folder);
            id
        };
        self.persist().await;
        self.try_start_jobs().await;
        Some(id)
    }

    /// Insert a synthetic one-job folder. No duplicate-path check: several
    /// single scripts may share a directory.
    pub async fn add_single_job(&self, folder: Folder) -> FolderId {
        let id = {
            let mut inner = self.inner.lock().await;
            let id = folder.id.clone();
            inner.folders.push(folder);
            id
        };
        self.persist().await;
        self.try_start_jobs().await;
        id
    }

    /// Cancel any running jobs in the folder, then delete it. Unknown ids
    /// are a no-op.
    pub async fn remove_folder(&self, folder_id: &FolderId) {
        let pids = {
            let mut inner = self.inner.lock().await;
            let Some(fi) = inner.folders.iter().position(|f| &f.id == folder_id) else {
                return;
            };
            let folder = inner.folders.remove(fi);
            let mut pids = Vec::new();
            for job in &folder.jobs {
                if let Some(entry) = inner.running.remove(&job.id) {
                    if let Some(pid) = entry.pid {
                        pids.push(pid);
                    }
                }
            }
            pids
        };
        for pid in pids {
            kill_tree_detached(pid);
        }
        self.persist().await;
        // Removing running jobs freed budget for the remaining folders.
        self.try_start_jobs().await;
    }

    /// Move a folder within the top-level order. Out-of-range indices are
    /// a no-op.
    pub async fn reorder_folders(&self, from: usize, to: usize) {
        let changed = {
            let mut inner = self.inner.lock().await;
            if from == to || from >= inner.folders.len() || to >= inner.folders.len() {
                false
            } else {
                let folder = inner.folders.remove(from);
                inner.folders.insert(to, folder);
                true
            }
        };
        if changed {
            self.persist().await;
        }
    }

    /// Move a job within its folder. Out-of-range indices are a no-op.
    pub async fn reorder_jobs(&self, folder_id: &FolderId, from: usize, to: usize) {
        let changed = {
            let mut inner = self.inner.lock().await;
            let Some(folder) = inner.folders.iter_mut().find(|f| &f.id == folder_id) else {
                return;
            };
            if from == to || from >= folder.jobs.len() || to >= folder.jobs.len() {
                false
            } else {
                let job = folder.jobs.remove(from);
                folder.jobs.insert(to, job);
                true
            }
        };
        if changed {
            self.persist().await;
        }
    }

    /// Replace the settings and re-run admission (retry policy or console
    /// visibility may change what starts next).
    pub async fn update_settings(&self, settings: Settings) {
        {
            let mut inner = self.inner.lock().await;
            inner.settings = settings;
        }
        self.persist().await;
        self.try_start_jobs().await;
    }

    // ================================================================
    // Observation / lifecycle
    // ================================================================

    /// Core counters plus an immutable snapshot of the whole queue.
    pub async fn observe(&self) -> (CoreUsage, Snapshot) {
        let inner = self.inner.lock().await;
        let used = inner.used_cores();
        (
            CoreUsage {
                total: self.total_cores,
                used,
                available: self.total_cores.saturating_sub(used),
            },
            inner.snapshot(),
        )
    }

    /// Force-kill every tracked child. The persisted snapshot re-queues
    /// these jobs on the next load.
    pub async fn shutdown(&self) {
        let pids: Vec<u32> = {
            let inner = self.inner.lock().await;
            inner.running.values().filter_map(|r| r.pid).collect()
        };
        for pid in pids {
            let _ = tokio::task::spawn_blocking(move || proctree::kill_tree(pid)).await;
        }
    }

    /// Best-effort save of the current snapshot. A failed save never
    /// alters job state.
    async fn persist(&self) {
        let snapshot = {
            let inner = self.inner.lock().await;
            inner.snapshot()
        };
        if let Err(e) = self.store.save(&snapshot) {
            warn!(error = %e, "state save failed");
        }
    }
}

/// Kill a process tree without blocking the scheduler.
fn kill_tree_detached(pid: u32) {
    let _ = tokio::task::spawn_blocking(move || proctree::kill_tree(pid));
}

impl Inner {
    fn used_cores(&self) -> usize {
        self.folders
            .iter()
            .flat_map(|f| &f.jobs)
            .filter(|j| j.status == JobStatus::Running)
            .map(|j| j.required_cores)
            .sum()
    }

    fn any_running(&self) -> bool {
        self.folders.iter().any(Folder::has_running_job)
    }

    /// Queued work that admission could eventually start. Jobs stranded in
    /// a dead folder are excluded: admission skips those folders forever,
    /// so they must not hold the queue open.
    fn any_startable_queued(&self) -> bool {
        self.folders.iter().any(|f| {
            !f.jobs
                .iter()
                .any(|j| matches!(j.status, JobStatus::Failed | JobStatus::Cancelled))
                && f.jobs.iter().any(|j| j.status == JobStatus::Queued)
        })
    }

    fn locate(&self, job_id: &JobId) -> Option<(usize, usize)> {
        self.folders.iter().enumerate().find_map(|(fi, folder)| {
            folder
                .jobs
                .iter()
                .position(|j| &j.id == job_id)
                .map(|ji| (fi, ji))
        })
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            folders: self.folders.clone(),
            settings: self.settings.clone(),
        }
    }

    /// Pick and commit the jobs to start this pass: parallel across
    /// folders, strictly sequential within each.
    fn select_admissions(&mut self, total_cores: usize, log_root: &Path) -> Vec<Launch> {
        let mut available = total_cores.saturating_sub(self.used_cores());
        let show_console = self.settings.show_console_window;
        let mut launches = Vec::new();

        for fi in 0..self.folders.len() {
            let folder = &self.folders[fi];
            if folder.has_running_job() {
                continue;
            }
            if folder
                .jobs
                .iter()
                .any(|j| matches!(j.status, JobStatus::Failed | JobStatus::Cancelled))
            {
                // Dead folder: skipped, never blocks the rest of the queue.
                continue;
            }
            let Some(ji) = folder
                .jobs
                .iter()
                .position(|j| j.status == JobStatus::Queued)
            else {
                continue;
            };
            if folder.jobs[..ji]
                .iter()
                .any(|j| j.status != JobStatus::Completed)
            {
                continue;
            }
            if folder.jobs[ji].required_cores > available {
                // Does not fit; a smaller job in a later folder still may.
                continue;
            }

            let now = Local::now();
            let folder = &mut self.folders[fi];
            let folder_id = folder.id.clone();
            let folder_name = folder.name.clone();
            let job = &mut folder.jobs[ji];
            job.status = JobStatus::Running;
            job.started_at = Some(now);
            job.ended_at = None;
            job.exit_code = None;
            let log_path = log_root.join(logsink::log_file_name(
                &folder_name,
                &job.name,
                &job.id,
                now,
            ));
            job.log_path = Some(log_path.clone());
            available -= job.required_cores;
            let job = job.clone();
            folder.recompute_status();

            self.running.insert(job.id.clone(), RunningJob::default());
            launches.push(Launch {
                folder_id,
                log_path,
                show_console,
                job,
            });
        }
        launches
    }
}

//! End-to-end scheduler scenarios with real child processes.
//!
//! Scripts are plain `sh` bodies named `*.bat`; the engine launches them
//! through the platform shell, so these tests exercise the whole path:
//! admission, supervision, log capture, completion, and persistence.

#![cfg(unix)]

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use simbatch_core::types::{JobStatus, Settings, Snapshot};
use simbatch_core::{
    EventReceiver, NoopControls, Orchestrator, OrchestratorConfig, SchedulerEvent,
};
use tempfile::TempDir;
use tokio::time::{sleep, timeout};

const WAIT: Duration = Duration::from_secs(30);

fn orchestrator_with(dir: &TempDir, cores: usize) -> Orchestrator {
    Orchestrator::new(OrchestratorConfig {
        state_path: dir.path().join("batchrunner_state.json"),
        log_root: dir.path().join("logs"),
        total_cores: Some(cores),
        controls: Arc::new(NoopControls),
    })
}

fn case_folder(dir: &TempDir, name: &str, scripts: &[(&str, &str)]) -> PathBuf {
    let case = dir.path().join(name);
    fs::create_dir_all(&case).unwrap();
    for (script, body) in scripts {
        fs::write(case.join(script), body).unwrap();
    }
    case
}

async fn wait_for_queue_finished(events: &mut EventReceiver) {
    timeout(WAIT, async {
        loop {
            match events.recv().await {
                Some(SchedulerEvent::QueueFinished) => break,
                Some(_) => continue,
                None => panic!("event channel closed before QueueFinished"),
            }
        }
    })
    .await
    .expect("queue should finish in time");
}

async fn wait_until<F>(orchestrator: &Orchestrator, mut predicate: F)
where
    F: FnMut(&Snapshot) -> bool,
{
    timeout(WAIT, async {
        loop {
            let (_, snapshot) = orchestrator.observe().await;
            if predicate(&snapshot) {
                return;
            }
            sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn log_bodies(dir: &TempDir) -> Vec<String> {
    let mut bodies = Vec::new();
    if let Ok(entries) = fs::read_dir(dir.path().join("logs")) {
        for entry in entries.flatten() {
            bodies.push(fs::read_to_string(entry.path()).unwrap_or_default());
        }
    }
    bodies
}

// ============================================================================
// Core scenarios
// ============================================================================

#[tokio::test]
async fn single_small_job_runs_to_completion() {
    let dir = TempDir::new().unwrap();
    let case = case_folder(
        &dir,
        "case1",
        &[("run_solver.bat", ": solver -np 2\necho solving\nexit 0\n")],
    );

    let mut orchestrator = orchestrator_with(&dir, 4);
    let mut events = orchestrator.take_events().unwrap();
    orchestrator.add_folder(&case).await.unwrap();
    orchestrator.start_queue().await;

    wait_for_queue_finished(&mut events).await;

    let (usage, snapshot) = orchestrator.observe().await;
    let folder = &snapshot.folders[0];
    let job = &folder.jobs[0];
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.exit_code, Some(0));
    assert!(job.started_at.is_some() && job.ended_at.is_some());
    assert!(job.ended_at.unwrap() >= job.started_at.unwrap());
    assert_eq!(folder.status, JobStatus::Completed);
    assert_eq!(usage.used, 0);

    // Completion wrote the folder summary, and the run log has the footer.
    assert!(case.join("batch_runner_summary.log").exists());
    let logs = log_bodies(&dir);
    assert_eq!(logs.len(), 1);
    assert!(logs[0].contains("solving"));
    assert!(logs[0].contains("Status: Completed"));

    // queue_finished fired exactly once for this start/pause cycle.
    let extra = events
        .drain()
        .into_iter()
        .filter(|e| *e == SchedulerEvent::QueueFinished)
        .count();
    assert_eq!(extra, 0);
}

#[tokio::test]
async fn folders_run_in_parallel_within_the_budget() {
    let dir = TempDir::new().unwrap();
    let body = ": mpiexec -np 4\nsleep 1\nexit 0\n";
    let a = case_folder(&dir, "caseA", &[("run_solver.bat", body)]);
    let b = case_folder(&dir, "caseB", &[("run_solver.bat", body)]);

    let mut orchestrator = orchestrator_with(&dir, 8);
    let mut events = orchestrator.take_events().unwrap();
    orchestrator.add_folder(&a).await.unwrap();
    orchestrator.add_folder(&b).await.unwrap();
    orchestrator.start_queue().await;

    wait_until(&orchestrator, |s| {
        s.folders
            .iter()
            .all(|f| f.jobs[0].status == JobStatus::Running)
    })
    .await;
    let (usage, _) = orchestrator.observe().await;
    assert_eq!(usage.used, 8);
    assert_eq!(usage.available, 0);

    wait_for_queue_finished(&mut events).await;
    let (_, snapshot) = orchestrator.observe().await;
    assert!(snapshot
        .folders
        .iter()
        .all(|f| f.status == JobStatus::Completed));
}

#[tokio::test]
async fn jobs_within_a_folder_run_sequentially() {
    let dir = TempDir::new().unwrap();
    let case = case_folder(
        &dir,
        "case1",
        &[
            ("generate_mesh.bat", ": mesh -np 2\nsleep 1\nexit 0\n"),
            ("run_solver.bat", ": solver -np 2\nexit 0\n"),
        ],
    );

    let mut orchestrator = orchestrator_with(&dir, 4);
    let mut events = orchestrator.take_events().unwrap();
    orchestrator.add_folder(&case).await.unwrap();
    orchestrator.start_queue().await;

    // Two cores stay free, but the second job must wait for the first.
    wait_until(&orchestrator, |s| {
        s.folders[0].jobs[0].status == JobStatus::Running
    })
    .await;
    let (usage, snapshot) = orchestrator.observe().await;
    assert_eq!(snapshot.folders[0].jobs[1].status, JobStatus::Queued);
    assert_eq!(usage.used, 2);

    wait_for_queue_finished(&mut events).await;
    let (_, snapshot) = orchestrator.observe().await;
    assert!(snapshot.folders[0]
        .jobs
        .iter()
        .all(|j| j.status == JobStatus::Completed));
}

#[tokio::test]
async fn oversized_job_is_denied_and_queue_stays_open() {
    let dir = TempDir::new().unwrap();
    let case = case_folder(&dir, "case1", &[("run_solver.bat", ": big -np 4\nexit 0\n")]);

    let mut orchestrator = orchestrator_with(&dir, 2);
    let mut events = orchestrator.take_events().unwrap();
    orchestrator.add_folder(&case).await.unwrap();
    orchestrator.start_queue().await;

    sleep(Duration::from_millis(500)).await;
    let (usage, snapshot) = orchestrator.observe().await;
    assert_eq!(snapshot.folders[0].jobs[0].status, JobStatus::Queued);
    assert_eq!(usage.used, 0);
    assert!(!events
        .drain()
        .iter()
        .any(|e| *e == SchedulerEvent::QueueFinished));
}

#[tokio::test]
async fn failed_job_is_retried_once_then_fails() {
    let dir = TempDir::new().unwrap();
    let case = case_folder(&dir, "case1", &[("run_solver.bat", "exit 3\n")]);

    let mut orchestrator = orchestrator_with(&dir, 4);
    let mut events = orchestrator.take_events().unwrap();
    orchestrator.add_folder(&case).await.unwrap();
    orchestrator.start_queue().await;

    wait_for_queue_finished(&mut events).await;

    let (_, snapshot) = orchestrator.observe().await;
    let job = &snapshot.folders[0].jobs[0];
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retry_count, 1);
    assert_eq!(job.exit_code, Some(3));
    assert_eq!(snapshot.folders[0].status, JobStatus::Failed);

    // Two runs, two logs: the first footer announces the retry.
    let logs = log_bodies(&dir);
    assert_eq!(logs.len(), 2);
    assert!(logs.iter().any(|l| l.contains("Failed (auto retry)")));
    assert!(logs.iter().any(|l| l.contains("Status: Failed\n")));
}

#[tokio::test]
async fn auto_retry_can_be_disabled() {
    let dir = TempDir::new().unwrap();
    let case = case_folder(&dir, "case1", &[("run_solver.bat", "exit 3\n")]);

    let mut orchestrator = orchestrator_with(&dir, 4);
    let mut events = orchestrator.take_events().unwrap();
    orchestrator
        .update_settings(Settings {
            auto_retry_failed_jobs: false,
            show_console_window: false,
        })
        .await;
    orchestrator.add_folder(&case).await.unwrap();
    orchestrator.start_queue().await;

    wait_for_queue_finished(&mut events).await;
    let (_, snapshot) = orchestrator.observe().await;
    let job = &snapshot.folders[0].jobs[0];
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retry_count, 0);
    assert_eq!(log_bodies(&dir).len(), 1);
}

#[tokio::test]
async fn restarting_a_running_job_requeues_it() {
    let dir = TempDir::new().unwrap();
    let case = case_folder(&dir, "case1", &[("run_solver.bat", "sleep 30\nexit 0\n")]);

    let mut orchestrator = orchestrator_with(&dir, 4);
    let _events = orchestrator.take_events().unwrap();
    orchestrator.add_folder(&case).await.unwrap();
    orchestrator.start_queue().await;

    wait_until(&orchestrator, |s| {
        s.folders[0].jobs[0].status == JobStatus::Running
    })
    .await;
    let (_, snapshot) = orchestrator.observe().await;
    let job_id = snapshot.folders[0].jobs[0].id.clone();

    // Pause so the requeued job is not immediately re-admitted; that lets
    // us observe the reset state.
    orchestrator.pause_queue().await;
    orchestrator.restart_job(&job_id).await;

    wait_until(&orchestrator, |s| {
        s.folders[0].jobs[0].status == JobStatus::Queued
    })
    .await;
    let (usage, snapshot) = orchestrator.observe().await;
    let job = &snapshot.folders[0].jobs[0];
    assert!(job.started_at.is_none());
    assert!(job.ended_at.is_none());
    assert!(job.exit_code.is_none());
    assert!(job.log_path.is_none());
    assert_eq!(job.retry_count, 0);
    assert_eq!(usage.used, 0);

    let logs = log_bodies(&dir);
    assert!(logs.iter().any(|l| l.contains("Status: Restarted")));
}

#[tokio::test]
async fn cancelling_a_running_job_kills_its_tree() {
    let dir = TempDir::new().unwrap();
    let case = case_folder(&dir, "case1", &[("run_solver.bat", "sleep 30\nexit 0\n")]);

    let mut orchestrator = orchestrator_with(&dir, 4);
    let mut events = orchestrator.take_events().unwrap();
    orchestrator.add_folder(&case).await.unwrap();
    orchestrator.start_queue().await;

    wait_until(&orchestrator, |s| {
        s.folders[0].jobs[0].status == JobStatus::Running
    })
    .await;
    let (_, snapshot) = orchestrator.observe().await;
    let job_id = snapshot.folders[0].jobs[0].id.clone();
    orchestrator.cancel_job(&job_id).await;

    // With the only folder dead, the queue drains.
    wait_for_queue_finished(&mut events).await;
    let (_, snapshot) = orchestrator.observe().await;
    let job = &snapshot.folders[0].jobs[0];
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.ended_at.is_some());
    assert_eq!(snapshot.folders[0].status, JobStatus::Cancelled);

    let logs = log_bodies(&dir);
    assert!(logs.iter().any(|l| l.contains("Status: Cancelled")));
}

#[tokio::test]
async fn cancelling_a_queued_job_is_immediate() {
    let dir = TempDir::new().unwrap();
    let case = case_folder(&dir, "case1", &[("run_solver.bat", "exit 0\n")]);

    let mut orchestrator = orchestrator_with(&dir, 4);
    let _events = orchestrator.take_events().unwrap();
    orchestrator.add_folder(&case).await.unwrap();
    // Queue never started: the job is still Queued.
    let (_, snapshot) = orchestrator.observe().await;
    let job_id = snapshot.folders[0].jobs[0].id.clone();
    orchestrator.cancel_job(&job_id).await;

    let (_, snapshot) = orchestrator.observe().await;
    let job = &snapshot.folders[0].jobs[0];
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.started_at.is_none());
    assert!(job.ended_at.is_some());

    // Cancelling again is a no-op.
    orchestrator.cancel_job(&job_id).await;
    let (_, snapshot) = orchestrator.observe().await;
    assert_eq!(snapshot.folders[0].jobs[0].status, JobStatus::Cancelled);
}

#[tokio::test]
async fn failed_folder_does_not_stop_other_folders() {
    let dir = TempDir::new().unwrap();
    let bad = case_folder(
        &dir,
        "bad",
        &[
            ("generate_mesh.bat", "exit 7\n"),
            ("run_solver.bat", "exit 0\n"),
        ],
    );
    let good = case_folder(&dir, "good", &[("run_solver.bat", "exit 0\n")]);

    let mut orchestrator = orchestrator_with(&dir, 4);
    let mut events = orchestrator.take_events().unwrap();
    orchestrator
        .update_settings(Settings {
            auto_retry_failed_jobs: false,
            show_console_window: false,
        })
        .await;
    orchestrator.add_folder(&bad).await.unwrap();
    orchestrator.add_folder(&good).await.unwrap();
    orchestrator.start_queue().await;

    wait_for_queue_finished(&mut events).await;
    let (_, snapshot) = orchestrator.observe().await;
    assert_eq!(snapshot.folders[0].status, JobStatus::Failed);
    // The queued job behind the failure never ran.
    assert_eq!(snapshot.folders[0].jobs[1].status, JobStatus::Queued);
    assert_eq!(snapshot.folders[1].status, JobStatus::Completed);
}

#[tokio::test]
async fn empty_queue_finishes_immediately() {
    let dir = TempDir::new().unwrap();
    let mut orchestrator = orchestrator_with(&dir, 4);
    let mut events = orchestrator.take_events().unwrap();
    orchestrator.start_queue().await;
    wait_for_queue_finished(&mut events).await;
}

// ============================================================================
// Budget invariants
// ============================================================================

#[tokio::test]
async fn core_budget_is_never_exceeded() {
    let dir = TempDir::new().unwrap();
    let body = ": mpiexec -np 4\nsleep 1\nexit 0\n";
    for name in ["caseA", "caseB", "caseC"] {
        case_folder(&dir, name, &[("run_solver.bat", body)]);
    }

    let mut orchestrator = orchestrator_with(&dir, 8);
    let mut events = orchestrator.take_events().unwrap();
    for name in ["caseA", "caseB", "caseC"] {
        orchestrator.add_folder(dir.path().join(name)).await.unwrap();
    }
    orchestrator.start_queue().await;

    // Poll the whole run: used cores stay within budget, and no folder
    // ever has two running jobs.
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let (usage, snapshot) = orchestrator.observe().await;
        assert!(usage.used <= usage.total, "budget exceeded: {usage:?}");
        for folder in &snapshot.folders {
            let running = folder
                .jobs
                .iter()
                .filter(|j| j.status == JobStatus::Running)
                .count();
            assert!(running <= 1, "{} running jobs in one folder", running);
        }
        if snapshot
            .folders
            .iter()
            .all(|f| f.status == JobStatus::Completed)
        {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "run did not finish");
        sleep(Duration::from_millis(20)).await;
    }
    wait_for_queue_finished(&mut events).await;
}

// ============================================================================
// Crash recovery
// ============================================================================

#[tokio::test]
async fn snapshot_with_running_job_recovers_to_queued() {
    let dir = TempDir::new().unwrap();
    let case = case_folder(&dir, "case1", &[("run_solver.bat", "exit 0\n")]);
    let script = case.join("run_solver.bat");

    // A snapshot persisted mid-flight: the job claims to be Running.
    let state = format!(
        r#"{{
            "Folders": [
                {{ "Id": "f-1", "Name": "case1", "Path": {case:?},
                   "Status": "Running",
                   "Jobs": [
                     {{ "Id": "j-1", "Name": "run_solver.bat",
                        "BatPath": {script:?}, "RequiredCores": 2,
                        "Status": "Running",
                        "StartedAt": "2026-07-01T10:00:00+02:00",
                        "LogPath": "/tmp/old.log" }}
                   ] }}
            ]
        }}"#,
        case = case.to_string_lossy(),
        script = script.to_string_lossy(),
    );
    let state_path = dir.path().join("batchrunner_state.json");
    fs::write(&state_path, state).unwrap();

    let mut orchestrator = orchestrator_with(&dir, 4);
    let (usage, snapshot) = orchestrator.observe().await;
    let job = &snapshot.folders[0].jobs[0];
    assert_eq!(job.status, JobStatus::Queued);
    assert!(job.started_at.is_none());
    assert!(job.ended_at.is_none());
    assert!(job.exit_code.is_none());
    assert!(job.log_path.is_none());
    assert_eq!(snapshot.folders[0].status, JobStatus::Queued);
    // Nothing was spawned by the load itself.
    assert_eq!(usage.used, 0);

    // An admission pass elects it like any other queued job.
    let mut events = orchestrator.take_events().unwrap();
    orchestrator.start_queue().await;
    wait_for_queue_finished(&mut events).await;
    let (_, snapshot) = orchestrator.observe().await;
    assert_eq!(snapshot.folders[0].jobs[0].status, JobStatus::Completed);
}

#[tokio::test]
async fn queue_survives_a_reload() {
    let dir = TempDir::new().unwrap();
    let a = case_folder(&dir, "caseA", &[("run_solver.bat", ": -np 2\nexit 0\n")]);
    let b = case_folder(&dir, "caseB", &[("run_solver.bat", ": -np 3\nexit 0\n")]);

    {
        let orchestrator = orchestrator_with(&dir, 8);
        orchestrator.add_folder(&a).await.unwrap();
        orchestrator.add_folder(&b).await.unwrap();
    }

    // A fresh orchestrator over the same state file sees the same queue,
    // in the same order.
    let orchestrator = orchestrator_with(&dir, 8);
    let (_, snapshot) = orchestrator.observe().await;
    assert_eq!(snapshot.folders.len(), 2);
    assert_eq!(snapshot.folders[0].name, "caseA");
    assert_eq!(snapshot.folders[1].name, "caseB");
    assert_eq!(snapshot.folders[0].jobs[0].required_cores, 2);
    assert_eq!(snapshot.folders[1].jobs[0].required_cores, 3);
}

// ============================================================================
// Structure mutations under load
// ============================================================================

#[tokio::test]
async fn removing_a_folder_cancels_its_running_job() {
    let dir = TempDir::new().unwrap();
    let case = case_folder(&dir, "case1", &[("run_solver.bat", "sleep 30\nexit 0\n")]);

    let mut orchestrator = orchestrator_with(&dir, 4);
    let _events = orchestrator.take_events().unwrap();
    let folder_id = orchestrator.add_folder(&case).await.unwrap();
    orchestrator.start_queue().await;

    wait_until(&orchestrator, |s| {
        s.folders[0].jobs[0].status == JobStatus::Running
    })
    .await;
    orchestrator.remove_folder(&folder_id).await;

    let (usage, snapshot) = orchestrator.observe().await;
    assert!(snapshot.folders.is_empty());
    assert_eq!(usage.used, 0);

    // The orphaned supervisor's exit report must be ignored gracefully;
    // give it a moment to arrive.
    sleep(Duration::from_millis(200)).await;
    let (_, snapshot) = orchestrator.observe().await;
    assert!(snapshot.folders.is_empty());
}

#[tokio::test]
async fn reordering_folders_changes_admission_order() {
    let dir = TempDir::new().unwrap();
    let a = case_folder(&dir, "caseA", &[("run_solver.bat", ": -np 4\nexit 0\n")]);
    let b = case_folder(&dir, "caseB", &[("run_solver.bat", ": -np 4\nexit 0\n")]);

    let orchestrator = orchestrator_with(&dir, 4);
    orchestrator.add_folder(&a).await.unwrap();
    orchestrator.add_folder(&b).await.unwrap();
    orchestrator.reorder_folders(1, 0).await;

    let (_, snapshot) = orchestrator.observe().await;
    assert_eq!(snapshot.folders[0].name, "caseB");
    assert_eq!(snapshot.folders[1].name, "caseA");
}

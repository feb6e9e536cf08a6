//! simbatch CLI entry point.
//!
//! Usage:
//!   simbatch run <path>...       # enroll paths and run the queue to completion
//!   simbatch add <path>...       # enroll only; persisted for a later run
//!   simbatch status              # print the persisted queue
//!
//! A path may be a case folder (enrolls its known scripts) or a single
//! .bat script (enrolls as a one-job folder).

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use simbatch_core::types::{JobStatus, Settings, Snapshot};
use simbatch_core::{Orchestrator, OrchestratorConfig, SchedulerEvent};

fn main() -> ExitCode {
    // Initialize tracing (respects RUST_LOG env var)
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:?}");
            ExitCode::FAILURE
        }
    }
}

/// Flags shared by every command.
#[derive(Default)]
struct Options {
    cores: Option<usize>,
    state: Option<PathBuf>,
    logs: Option<PathBuf>,
    no_retry: bool,
    show_console: bool,
}

impl Options {
    fn into_config(self) -> (OrchestratorConfig, Settings) {
        let mut config = OrchestratorConfig::default();
        if let Some(state) = self.state {
            config.state_path = state;
        }
        if let Some(logs) = self.logs {
            config.log_root = logs;
        }
        config.total_cores = self.cores;
        let settings = Settings {
            auto_retry_failed_jobs: !self.no_retry,
            show_console_window: self.show_console,
        };
        (config, settings)
    }
}

fn run() -> Result<ExitCode> {
    let args: Vec<String> = env::args().skip(1).collect();
    let (options, rest) = parse_options(&args)?;

    match rest.first().map(String::as_str) {
        None | Some("--help" | "-h") => {
            print_help();
            Ok(ExitCode::SUCCESS)
        }
        Some("--version" | "-V") => {
            println!("simbatch {}", env!("CARGO_PKG_VERSION"));
            Ok(ExitCode::SUCCESS)
        }
        Some("run") => run_queue(options, &rest[1..]),
        Some("add") => add_paths(options, &rest[1..]),
        Some("status") => show_status(options),
        Some(unknown) => {
            eprintln!("Unknown command: {unknown}");
            eprintln!("Run 'simbatch --help' for usage.");
            Ok(ExitCode::FAILURE)
        }
    }
}

fn parse_options(args: &[String]) -> Result<(Options, Vec<String>)> {
    let mut options = Options::default();
    let mut rest = Vec::new();
    for arg in args {
        if let Some(value) = arg.strip_prefix("--cores=") {
            options.cores = Some(value.parse()?);
        } else if let Some(value) = arg.strip_prefix("--state=") {
            options.state = Some(PathBuf::from(value));
        } else if let Some(value) = arg.strip_prefix("--logs=") {
            options.logs = Some(PathBuf::from(value));
        } else if arg == "--no-retry" {
            options.no_retry = true;
        } else if arg == "--show-console" {
            options.show_console = true;
        } else {
            rest.push(arg.clone());
        }
    }
    Ok((options, rest))
}

fn print_help() {
    println!(
        r#"simbatch v{} — batch orchestrator for simulation scripts

Usage:
  simbatch run <path>...       Enroll paths and run the queue to completion
  simbatch add <path>...       Enroll paths without starting the queue
  simbatch status              Print the persisted queue

Options:
  --cores=<N>                  Override the physical core budget
  --state=<path>               State file (default: batchrunner_state.json
                               next to the executable)
  --logs=<dir>                 Log directory (default: logs/ next to the
                               executable)
  --no-retry                   Disable the single auto-retry of failed jobs
  --show-console               Show a console window per job (Windows)
  -h, --help                   Show this help
  -V, --version                Show version

Examples:
  simbatch run ~/cases/wing_v3            # run one case folder
  simbatch run caseA caseB --cores=16     # two folders under a 16-core budget
  simbatch add nightly/sweep_01.bat       # queue a single script for later
"#,
        env!("CARGO_PKG_VERSION")
    );
}

/// Enroll paths, start the queue, and wait for it to drain.
fn run_queue(options: Options, paths: &[String]) -> Result<ExitCode> {
    if paths.is_empty() {
        bail!("run requires at least one folder or script path");
    }
    let (config, settings) = options.into_config();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let mut orchestrator = Orchestrator::new(config);
        orchestrator.update_settings(settings).await;

        let accepted = enroll(&orchestrator, paths).await;
        println!("Enrolled {accepted} of {} path(s)", paths.len());

        let mut events = orchestrator
            .take_events()
            .context("event channel already taken")?;
        orchestrator.start_queue().await;

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(SchedulerEvent::JobStarted { job, .. }) => {
                        let (usage, snapshot) = orchestrator.observe().await;
                        if let Some(job) = snapshot.find_job(&job) {
                            println!(
                                "started  {} ({} cores, {}/{} in use)",
                                job.name, job.required_cores, usage.used, usage.total
                            );
                        }
                    }
                    Some(SchedulerEvent::JobFinished { job, status, .. }) => {
                        let (_, snapshot) = orchestrator.observe().await;
                        if let Some(job) = snapshot.find_job(&job) {
                            println!("finished {} -> {status}", job.name);
                        }
                    }
                    Some(SchedulerEvent::QueueFinished) | None => break,
                },
                _ = tokio::signal::ctrl_c() => {
                    eprintln!("interrupted; killing running jobs");
                    orchestrator.shutdown().await;
                    return Ok(ExitCode::FAILURE);
                }
            }
        }

        let (_, snapshot) = orchestrator.observe().await;
        print_snapshot(&snapshot);
        let all_completed = snapshot
            .folders
            .iter()
            .flat_map(|f| &f.jobs)
            .all(|j| j.status == JobStatus::Completed);
        Ok(if all_completed {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        })
    })
}

/// Enroll paths into the persisted queue without running it.
fn add_paths(options: Options, paths: &[String]) -> Result<ExitCode> {
    if paths.is_empty() {
        bail!("add requires at least one folder or script path");
    }
    let (config, _) = options.into_config();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let orchestrator = Orchestrator::new(config);
        let accepted = enroll(&orchestrator, paths).await;
        println!("Enrolled {accepted} of {} path(s)", paths.len());
        Ok(if accepted > 0 {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        })
    })
}

fn show_status(options: Options) -> Result<ExitCode> {
    let (config, _) = options.into_config();
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let orchestrator = Orchestrator::new(config);
        let (usage, snapshot) = orchestrator.observe().await;
        println!(
            "Cores: {} total, {} in use, {} available",
            usage.total, usage.used, usage.available
        );
        print_snapshot(&snapshot);
        Ok(ExitCode::SUCCESS)
    })
}

async fn enroll(orchestrator: &Orchestrator, paths: &[String]) -> usize {
    let mut accepted = 0;
    for raw in paths {
        let path = PathBuf::from(raw);
        let added = if path.is_dir() {
            orchestrator.add_folder(&path).await
        } else {
            orchestrator.add_job(&path).await
        };
        match added {
            Some(_) => accepted += 1,
            None => eprintln!("skipped {raw}"),
        }
    }
    accepted
}

fn print_snapshot(snapshot: &Snapshot) {
    if snapshot.folders.is_empty() {
        println!("Queue is empty.");
        return;
    }
    for folder in &snapshot.folders {
        println!("{} [{}] — {}", folder.name, folder.status, folder.path.display());
        for job in &folder.jobs {
            let exit = job
                .exit_code
                .map(|c| format!(" (exit {c})"))
                .unwrap_or_default();
            println!(
                "  {:<30} {:>10} {} core(s){exit}",
                job.name, job.status.to_string(), job.required_cores
            );
        }
    }
}

//! Per-run log files — header, footer, and ad-hoc lines.
//!
//! Every write is best-effort: failures are reported at warn level and
//! swallowed, never surfacing to the scheduler. The body of each log (the
//! child's merged stdout+stderr) is streamed in by the supervisor between
//! the header and the footer.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Local};
use simbatch_types::{Job, JobId};
use tracing::warn;

const SEPARATOR: &str = "------------------------------------------------------------";
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Create the log file (and its parent directory) with the run header.
pub fn write_header(path: &Path, job: &Job) {
    if let Some(parent) = path.parent() {
        if let Err(e) = fs::create_dir_all(parent) {
            warn!(path = %parent.display(), error = %e, "cannot create log directory");
            return;
        }
    }
    let started = job.started_at.unwrap_or_else(Local::now);
    let header = format!(
        "Started: {}\nJob: {}\nBatch: {}\nCores: {}\n{SEPARATOR}\n",
        started.format(TIME_FORMAT),
        job.name,
        job.bat_path.display(),
        job.required_cores,
    );
    if let Err(e) = fs::write(path, header) {
        warn!(path = %path.display(), error = %e, "cannot write log header");
    }
}

/// Append the run footer: end time, status label, and exit code.
pub fn append_footer(path: &Path, job: &Job, status_label: &str) {
    let ended = job.ended_at.unwrap_or_else(Local::now);
    let exit = job
        .exit_code
        .map(|c| c.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    append(
        path,
        &format!(
            "\nEnded: {}\nStatus: {}\nExitCode: {}\n",
            ended.format(TIME_FORMAT),
            status_label,
            exit,
        ),
    );
}

/// Append a timestamped free-form message.
pub fn append_line(path: &Path, message: &str) {
    append(
        path,
        &format!("[{}] {}\n", Local::now().format(TIME_FORMAT), message),
    );
}

fn append(path: &Path, text: &str) {
    let result = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut file| file.write_all(text.as_bytes()));
    if let Err(e) = result {
        warn!(path = %path.display(), error = %e, "log append failed");
    }
}

/// File name of the per-folder completion summary. Its presence marks a
/// folder as already processed and blocks re-enrollment.
pub const SUMMARY_FILE_NAME: &str = "batch_runner_summary.log";

/// Write the human-readable completion report into the folder itself.
pub fn write_folder_summary(path: &Path, folder_name: &str, jobs: &[Job]) {
    let mut text = format!(
        "Batch summary for {folder_name}\nGenerated: {}\n\n",
        Local::now().format(TIME_FORMAT)
    );
    for job in jobs {
        let elapsed = match (job.started_at, job.ended_at) {
            (Some(started), Some(ended)) => format_elapsed(ended.signed_duration_since(started)),
            _ => "--:--:--".to_string(),
        };
        text.push_str(&format!(
            "{}: {}\n  Started: {}\n  Ended: {}\n  Elapsed: {}\n  ExitCode: {}\n\n",
            job.name,
            job.status,
            format_opt(job.started_at),
            format_opt(job.ended_at),
            elapsed,
            job.exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
        ));
    }
    if let Err(e) = fs::write(path, text) {
        warn!(path = %path.display(), error = %e, "cannot write folder summary");
    }
}

fn format_opt(time: Option<DateTime<Local>>) -> String {
    time.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".to_string())
}

/// Elapsed wall time as `HH:MM:SS`; hours may exceed 24.
fn format_elapsed(duration: chrono::Duration) -> String {
    let secs = duration.num_seconds().max(0);
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

/// Log file name for one run: timestamp, folder, job, and the job id to
/// disambiguate collisions within the same second.
pub fn log_file_name(
    folder_name: &str,
    job_name: &str,
    job_id: &JobId,
    started: DateTime<Local>,
) -> String {
    format!(
        "{}_{}_{}_{}.log",
        started.format("%Y%m%d_%H%M%S"),
        sanitize(folder_name),
        sanitize(job_name),
        job_id,
    )
}

/// Replace filesystem-hostile characters with `_`.
pub fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect()
}

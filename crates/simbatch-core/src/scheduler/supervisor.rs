//! Per-job child supervision: launch, stream output, await the whole tree.
//!
//! One supervisor task exists per live job and is the only party holding the
//! OS child handle. It never mutates job state; it reports the exit back to
//! the scheduler, which owns all transitions.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::proctree;

/// How often the drain loop re-checks for surviving descendants.
const DRAIN_POLL: Duration = Duration::from_secs(2);

/// What the supervisor reports once the process tree is gone.
#[derive(Debug, Clone, Copy)]
pub struct ExitReport {
    /// `None` when the exit code was unretrievable (signal death, wait
    /// failure).
    pub exit_code: Option<i32>,
}

/// Spawn the script through the platform shell with piped output.
///
/// Working directory is the script's own directory, falling back to the
/// process cwd for bare file names. The environment is inherited verbatim.
pub fn launch(bat_path: &Path, show_console: bool) -> Result<Child> {
    let mut cmd = shell_command(bat_path, show_console);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = bat_path.parent().filter(|p| p.is_dir()) {
        cmd.current_dir(dir);
    }
    cmd.spawn()
        .with_context(|| format!("spawning {}", bat_path.display()))
}

#[cfg(windows)]
fn shell_command(bat_path: &Path, show_console: bool) -> Command {
    const CREATE_NEW_CONSOLE: u32 = 0x0000_0010;
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(bat_path);
    cmd.creation_flags(if show_console {
        CREATE_NEW_CONSOLE
    } else {
        CREATE_NO_WINDOW
    });
    cmd
}

#[cfg(not(windows))]
fn shell_command(bat_path: &Path, _show_console: bool) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg(bat_path);
    cmd
}

/// Stream the child's merged stdout+stderr into the log, wait for the root
/// to exit, then wait until no descendant survives.
pub async fn supervise(mut child: Child, log_path: PathBuf) -> ExitReport {
    let root_pid = child.id();

    // Both pipes feed one writer so the log stays a single interleaved
    // stream, in arrival order.
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    if let Some(stdout) = child.stdout.take() {
        let _ = tokio::spawn(copy_stream(stdout, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        let _ = tokio::spawn(copy_stream(stderr, tx.clone()));
    }
    drop(tx);

    let writer = tokio::spawn(async move {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await;
        match file {
            Ok(mut file) => {
                while let Some(chunk) = rx.recv().await {
                    if file.write_all(&chunk).await.is_err() {
                        break;
                    }
                }
                let _ = file.flush().await;
            }
            Err(e) => {
                warn!(path = %log_path.display(), error = %e, "cannot open log for streaming");
                // Drain so the readers do not stall on a full channel.
                while rx.recv().await.is_some() {}
            }
        }
    });

    let exit_code = match child.wait().await {
        Ok(status) => status.code(),
        Err(e) => {
            warn!(error = %e, "waiting on child failed");
            None
        }
    };

    // The body must be fully written before the scheduler appends a footer.
    let _ = writer.await;

    if let Some(pid) = root_pid {
        drain_descendants(pid).await;
    }

    ExitReport { exit_code }
}

async fn copy_stream<R: AsyncRead + Unpin>(mut reader: R, tx: mpsc::UnboundedSender<Vec<u8>>) {
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
        }
    }
}

/// Poll the process table until no descendant of `root_pid` remains. An
/// empty read is trusted; an unreadable table reads as empty and ends the
/// wait optimistically.
async fn drain_descendants(root_pid: u32) {
    loop {
        let surviving =
            tokio::task::spawn_blocking(move || proctree::descendants(root_pid).len())
                .await
                .unwrap_or(0);
        if surviving == 0 {
            return;
        }
        debug!(root_pid, surviving, "waiting for descendants to exit");
        tokio::time::sleep(DRAIN_POLL).await;
    }
}

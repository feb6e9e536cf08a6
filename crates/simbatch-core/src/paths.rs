//! Default on-disk locations for simbatch runtime files.
//!
//! The state file and the log directory live next to the executable so a
//! portable install keeps everything in one place. Both can be overridden
//! through `OrchestratorConfig`.

use std::path::{Path, PathBuf};

/// File name of the persisted queue snapshot.
pub const STATE_FILE_NAME: &str = "batchrunner_state.json";

/// Directory name for per-run log files, under the install directory.
pub const LOG_DIR_NAME: &str = "logs";

/// Directory containing the running executable, falling back to the current
/// working directory when the executable path cannot be resolved.
pub fn install_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Default path of the persisted queue snapshot.
pub fn state_file() -> PathBuf {
    install_dir().join(STATE_FILE_NAME)
}

/// Default directory for per-run log files.
pub fn log_dir() -> PathBuf {
    install_dir().join(LOG_DIR_NAME)
}

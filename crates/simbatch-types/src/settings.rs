//! User-facing behaviour toggles, persisted with the queue.

use serde::{Deserialize, Serialize};

/// Queue-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase", default)]
pub struct Settings {
    /// Re-queue a failed job once before giving up.
    pub auto_retry_failed_jobs: bool,
    /// Show a console window for each child (Windows only; ignored elsewhere).
    pub show_console_window: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            auto_retry_failed_jobs: true,
            show_console_window: false,
        }
    }
}

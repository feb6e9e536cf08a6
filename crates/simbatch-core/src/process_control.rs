//! Best-effort process priority elevation.

/// Capability hook for raising a spawned child above normal scheduling
/// priority. Platforms without a usable elevation primitive are no-ops.
pub trait ProcessControls: Send + Sync {
    /// Raise `pid` above normal priority. Failures (typically missing
    /// privileges) are ignored.
    fn elevate(&self, pid: u32);
}

/// Controls for the host platform.
#[derive(Debug, Default)]
pub struct NativeControls;

impl ProcessControls for NativeControls {
    #[cfg(unix)]
    fn elevate(&self, pid: u32) {
        // Negative nice needs privileges; EPERM is the expected outcome on
        // an ordinary user account.
        let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS as _, pid as _, -5) };
        if rc != 0 {
            tracing::debug!(pid, "priority elevation not permitted");
        }
    }

    #[cfg(not(unix))]
    fn elevate(&self, _pid: u32) {}
}

/// Inert controls for tests.
#[derive(Debug, Default)]
pub struct NoopControls;

impl ProcessControls for NoopControls {
    fn elevate(&self, _pid: u32) {}
}

//! Physical core discovery.

use std::sync::OnceLock;

use sysinfo::{CpuRefreshKind, RefreshKind, System};

/// Total physical cores on this host, probed once and cached.
///
/// Hosts where the physical package layout cannot be resolved fall back to
/// the logical CPU count, and finally to 1.
pub fn total_physical_cores() -> usize {
    static CORES: OnceLock<usize> = OnceLock::new();
    *CORES.get_or_init(probe)
}

fn probe() -> usize {
    let system = System::new_with_specifics(
        RefreshKind::new().with_cpu(CpuRefreshKind::new().with_frequency()),
    );
    system
        .physical_core_count()
        .filter(|&n| n > 0)
        .unwrap_or_else(logical_cores)
}

fn logical_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

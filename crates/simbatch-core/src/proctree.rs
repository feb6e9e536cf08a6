//! Process-tree inspection and teardown.
//!
//! Each query snapshots the OS process table once, builds a parent→children
//! map, and BFS-expands from the root. A missing or already-exited root
//! yields an empty set.

use std::collections::{HashMap, HashSet, VecDeque};

use sysinfo::{Pid, ProcessRefreshKind, RefreshKind, System};
use tracing::debug;

/// All transitive children of `root_pid` at this instant. Never contains
/// the root itself.
pub fn descendants(root_pid: u32) -> HashSet<u32> {
    let system = snapshot();
    collect_descendants(&system, root_pid)
}

/// Force-kill `root_pid` and every descendant. Best-effort: processes that
/// exit between the snapshot and the kill are skipped silently.
pub fn kill_tree(root_pid: u32) {
    let system = snapshot();
    let mut targets = collect_descendants(&system, root_pid);
    targets.insert(root_pid);
    debug!(root_pid, count = targets.len(), "killing process tree");
    for pid in targets {
        if let Some(process) = system.process(Pid::from_u32(pid)) {
            process.kill();
        }
    }
}

fn snapshot() -> System {
    System::new_with_specifics(RefreshKind::new().with_processes(ProcessRefreshKind::new()))
}

fn collect_descendants(system: &System, root_pid: u32) -> HashSet<u32> {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for (pid, process) in system.processes() {
        if let Some(parent) = process.parent() {
            children
                .entry(parent.as_u32())
                .or_default()
                .push(pid.as_u32());
        }
    }

    let mut found = HashSet::new();
    let mut frontier = VecDeque::from([root_pid]);
    while let Some(pid) = frontier.pop_front() {
        if let Some(kids) = children.get(&pid) {
            for &kid in kids {
                if found.insert(kid) {
                    frontier.push_back(kid);
                }
            }
        }
    }
    found
}

//! simbatch-core: the batch-orchestration engine.
//!
//! This crate provides:
//!
//! - **CoreProbe** (`cores`): physical core discovery, queried once
//! - **ScriptInspector** (`inspect`): derive a script's core requirement
//! - **ProcessTree** (`proctree`): descendant enumeration and tree kill
//! - **LogSink** (`logsink`): per-run log header/footer/line writers
//! - **StateStore** (`state`): the persisted JSON snapshot, with
//!   load-normalization
//! - **Scheduler** (`scheduler`): core-budgeted admission, the per-job state
//!   machine, and per-child supervision
//! - **Orchestrator** (`orchestrator`): the mutation surface a front-end
//!   drives
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Orchestrator                          │
//! │  add / remove / reorder / cancel / restart / start / pause  │
//! └───────────────┬─────────────────────────────────────────────┘
//!                 │ control ops
//! ┌───────────────▼─────────────────────────────────────────────┐
//! │                        Scheduler                            │
//! │  folders + jobs + core budget behind one async mutex        │
//! │  try_start_jobs ──▶ spawn ──▶ Supervisor (task per child)   │
//! │        ▲                            │                       │
//! │        └──────────── on_exit ◀──────┘                       │
//! └─────────────────────────────────────────────────────────────┘
//!                 │ snapshots                  │ events
//!           StateStore (JSON)           EventReceiver (UI)
//! ```

pub mod cores;
pub mod inspect;
pub mod logsink;
pub mod orchestrator;
pub mod paths;
pub mod process_control;
pub mod proctree;
pub mod scheduler;
pub mod state;

pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub use process_control::{NativeControls, NoopControls, ProcessControls};
pub use scheduler::{EventReceiver, Scheduler, SchedulerEvent};
pub use state::StateStore;

// Re-export the data model so most consumers depend on one crate.
pub use simbatch_types as types;

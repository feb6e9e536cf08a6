//! Scheduler module for simbatch — admission, supervision, and events.
//!
//! This module provides:
//! - **Admission**: `Scheduler::try_start_jobs` walks folders in user order
//!   and starts the head of each folder's queue while the core budget lasts.
//! - **Supervision**: one task per started job streams output to the run
//!   log, waits for the root child, drains the descendant tree, and posts
//!   the exit back to the scheduler.
//! - **Events**: a cloneable channel carrying job-started / job-finished /
//!   queue-finished notifications for a front-end.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                        Scheduler                           │
//! │  Inner (folders, settings, running map) behind one Mutex   │
//! │                                                            │
//! │  try_start_jobs ──commit──▶ spawn ──▶ supervisor task      │
//! │        ▲                                  │ wait + drain   │
//! │        └───────────── on_exit ◀───────────┘                │
//! └────────────────────────────────────────────────────────────┘
//! ```

mod engine;
mod events;
mod supervisor;

pub use engine::Scheduler;
pub use events::{event_channel, EventReceiver, EventSender, SchedulerEvent};

//! Pure data types for simbatch — jobs, folders, settings, snapshots.
//!
//! This crate is a leaf dependency with no async runtime and no I/O. It
//! exists so that front-ends can render and diff the queue without pulling
//! the engine crate's transitive deps.

pub mod folder;
pub mod job;
pub mod settings;
pub mod snapshot;

// Flat re-exports for convenience
pub use folder::*;
pub use job::*;
pub use settings::*;
pub use snapshot::*;

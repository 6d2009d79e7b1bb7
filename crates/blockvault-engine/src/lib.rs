//! blockvault storage engine.
//!
//! The core of a single storage node: a write-ahead journal, an in-place
//! metadata region and a flat data region over raw devices, driven by a
//! single-threaded cooperative submission loop. The engine turns those
//! three regions into a durable, crash-consistent, versioned object store
//! with snapshot/stability semantics:
//!
//! - full-block ("big") writes go straight to a freshly allocated data
//!   block, with a journal record deferred until after the data fsync;
//! - sub-block ("small") writes and deletes live inline in the journal;
//! - `SYNC` orders data fsync before journal fsync and acknowledges in
//!   FIFO order across concurrent syncs;
//! - `STABLE`/`ROLLBACK` promote or discard pending versions;
//! - a background flusher migrates stable journal state into the
//!   metadata region and reclaims journal space.

pub mod allocator;
pub mod engine;
pub mod flusher;
pub mod index;
pub mod init;
pub mod journal;
pub mod meta;
pub mod op;
pub mod raw_io;
pub mod read;
pub mod ring;
pub mod stable;
pub mod stats;
pub mod sync;
pub mod write;

pub use engine::Engine;
pub use op::{ListParams, OpKind, Operation};
pub use stats::{EngineStats, OpStats, StatsHandle};

pub use blockvault_common::{
    EngineConfig, Error, ImmediateCommit, ObjectId, ObjectVersion, RegionConfig, Result,
};

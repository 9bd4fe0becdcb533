//! Trophic Engine -- the run driver: tick loop, background persistence and
//! time travel.
//!
//! A [`SimulationRun`](run::SimulationRun) owns the live
//! [`SimulationStore`](trophic_store::store::SimulationStore) and a background
//! writer that persists every visited timestep to a
//! [`TimestepLog`](trophic_log::log::TimestepLog). Systems registered on the run
//! read the current snapshot and queue deltas; the run commits them and
//! advances the index. The replay operations (pause, step, scrub, resume with
//! an explicit fork policy) move the live store through recorded history.
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use trophic_engine::prelude::*;
//!
//! fn grow(snapshot: &TimestepSnapshot, deltas: &mut DeltaBuffer, _ctx: &mut TickContext) {
//!     deltas.set_cell(0, 0, snapshot.grid.get(0, 0).unwrap_or(0.0) + 1.0);
//! }
//!
//! let dir = tempfile::tempdir().unwrap();
//! let config = RunConfig { flush_interval: 4, sync_writes: false, ..RunConfig::default() };
//! let schema = Arc::new(SchemaRegistry::new());
//! let catalog = Arc::new(EntityCatalog::new());
//!
//! let mut run = SimulationRun::create(dir.path().join("run.trophlog"), &config, schema, catalog).unwrap();
//! run.add_system("grow", grow);
//! run.run_ticks(10).unwrap();
//! run.flush().unwrap();
//! assert_eq!(run.highest_index(), Some(10));
//!
//! run.pause().unwrap();
//! run.step_back().unwrap();
//! assert_eq!(run.replay_state(), ReplayState::PausedAt(9));
//! ```

#![deny(unsafe_code)]

pub mod config;
pub mod replay;
pub mod run;
pub mod stats;
pub mod telemetry;
pub mod tick;
pub mod writer;

use trophic_log::LogError;
use trophic_store::StoreError;

use crate::replay::ReplayState;

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

/// Re-export the store crate for convenience.
pub use trophic_store;

/// Re-export the log crate for convenience.
pub use trophic_log;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by run control and replay.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// The operation needs a live run (ticking) but the run is paused or
    /// scrubbing.
    #[error("run is not live (state: {state:?})")]
    NotLive { state: ReplayState },

    /// The operation needs a paused (or scrubbing) run.
    #[error("run is not paused (state: {state:?})")]
    NotPaused { state: ReplayState },

    /// Resuming here would fork the timeline and the policy forbids
    /// discarding the recorded future.
    #[error("resuming at index {at} would discard snapshots {} through {highest}", .at + 1)]
    WouldDiscardHistory { at: u64, highest: u64 },

    /// The current step was already captured for the log and can no longer
    /// be edited.
    #[error("timestep {index} is already recorded and cannot be edited")]
    StepAlreadyRecorded { index: u64 },

    /// The background writer failed or exited; no further snapshots are
    /// persisted.
    #[error("background writer stopped: {reason}")]
    WriterStopped { reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Log(#[from] LogError),
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common engine usage.
pub mod prelude {
    pub use trophic_log::prelude::*;
    pub use trophic_store::prelude::*;

    pub use crate::config::RunConfig;
    pub use crate::replay::{ForkPolicy, ReplayState};
    pub use crate::run::SimulationRun;
    pub use crate::stats::{population_history, CsvLayout, KindStats, PopulationStats};
    pub use crate::tick::{SystemFn, TickContext, TickDiagnostics};
    pub use crate::RunError;
}

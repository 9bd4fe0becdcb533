//! Trophic Log -- durable, append-only timestep history.
//!
//! A [`TimestepLog`](log::TimestepLog) persists one immutable group per
//! timestep. Each group stores the environment grid and, per entity kind, one
//! contiguous column per field, every column compressed with zstd. Groups are
//! committed with a separate commit frame, so a crash mid-append leaves a
//! staged fragment that the next [`open`](log::TimestepLog::open) discards.
//!
//! Any number of [`LogReader`](reader::LogReader)s may read committed indices
//! while the single writer appends.
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use trophic_log::prelude::*;
//! use trophic_store::prelude::*;
//!
//! let dir = tempfile::tempdir().unwrap();
//! let path = dir.path().join("run.trophlog");
//!
//! let schema = Arc::new(SchemaRegistry::new());
//! schema.declare_field("producer", "energy", ValueType::Float, Value::Float(10.0)).unwrap();
//! let catalog = Arc::new(EntityCatalog::new());
//! let producer = catalog.id_for("producer");
//!
//! let store = SimulationStore::new(
//!     Arc::clone(&schema),
//!     Arc::clone(&catalog),
//!     EnvironmentGrid::filled(10, 10, 1.0),
//! );
//! store.apply_delta(&[Delta::spawn(producer, 1, 1)]).unwrap();
//!
//! let mut log = TimestepLog::create(
//!     &path,
//!     RunMetadata::default(),
//!     schema,
//!     catalog,
//!     LogOptions::default(),
//! )
//! .unwrap();
//! log.append(&store.snapshot()).unwrap();
//!
//! assert_eq!(log.highest_index(), Some(0));
//! assert_eq!(log.read(0).unwrap().entities.len(), 1);
//! ```

#![deny(unsafe_code)]

pub mod column;
pub mod format;
pub mod log;
pub mod reader;

use trophic_store::StoreError;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by the durable log.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// An append was not exactly one past the highest committed index.
    #[error("out-of-order write: expected index {expected}, got {got}")]
    OutOfOrderWrite { expected: u64, got: u64 },

    /// No committed snapshot exists at the requested index.
    #[error("no snapshot recorded at index {index}")]
    IndexNotFound { index: u64 },

    /// The file ends in a staged-but-uncommitted fragment and recovery was
    /// disabled.
    #[error("partial write detected after index {last_good:?} ({staged_bytes} staged bytes)")]
    PartialWriteDetected {
        last_good: Option<u64>,
        staged_bytes: u64,
    },

    /// Another writer holds the log file.
    #[error("log file {path} is already open for writing")]
    AlreadyOpen { path: std::path::PathBuf },

    /// A committed frame could not be decoded.
    #[error("corrupt log at byte {offset}: {reason}")]
    Corrupt { offset: u64, reason: String },

    /// The file does not start with a supported log header.
    #[error("not a trophic log file (bad header)")]
    BadHeader,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("log I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("log metadata error: {0}")]
    Metadata(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::format::RunMetadata;
    pub use crate::log::{LogOptions, RecoveryReport, TimestepLog};
    pub use crate::reader::LogReader;
    pub use crate::LogError;
}

//! Trophic Store -- the memory-resident state of a running ecosystem simulation.
//!
//! This crate owns everything that describes "now" in a simulation run:
//!
//! - [`schema::SchemaRegistry`]: per-kind field declarations, versioned so old
//!   recordings can be decoded after new fields are added.
//! - [`catalog::EntityCatalog`]: append-only kind name <-> [`KindId`](catalog::KindId)
//!   mapping, versioned.
//! - [`store::SimulationStore`]: the live environment grid and entity set,
//!   mutated through [`delta::Delta`]s and captured as copy-on-write
//!   [`snapshot::TimestepSnapshot`]s.
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use trophic_store::prelude::*;
//!
//! let schema = Arc::new(SchemaRegistry::new());
//! schema.declare_field("producer", "energy", ValueType::Float, Value::Float(10.0)).unwrap();
//!
//! let catalog = Arc::new(EntityCatalog::new());
//! let producer = catalog.id_for("producer");
//!
//! let store = SimulationStore::new(schema, catalog, EnvironmentGrid::filled(20, 20, 1.0));
//! let outcome = store
//!     .apply_delta(&[Delta::spawn(producer, 3, 4)])
//!     .unwrap();
//!
//! let snapshot = store.snapshot();
//! let record = &snapshot.entities[&outcome.spawned[0]];
//! assert_eq!(record.field("energy"), Some(&Value::Float(10.0)));
//! ```

#![deny(unsafe_code)]

pub mod catalog;
pub mod delta;
pub mod entity;
pub mod grid;
pub mod schema;
pub mod snapshot;
pub mod store;
pub mod value;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by schema, catalog and store operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    /// A field was redeclared for a kind with a different value type.
    #[error("field '{field}' of kind '{kind}' is declared as {existing:?}, cannot redeclare as {requested:?}")]
    SchemaConflict {
        kind: String,
        field: String,
        existing: value::ValueType,
        requested: value::ValueType,
    },

    /// A field declaration carried a default of the wrong type.
    #[error("default for field '{field}' of kind '{kind}' is not a {expected:?}")]
    DefaultTypeMismatch {
        kind: String,
        field: String,
        expected: value::ValueType,
    },

    /// The field name collides with a built-in column (`id`, `x`, `y`).
    #[error("field name '{field}' is reserved")]
    ReservedField { field: String },

    /// A kind id does not resolve in the entity catalog.
    #[error("kind {kind:?} does not resolve in catalog version {catalog_version}")]
    UnknownKind {
        kind: catalog::KindId,
        catalog_version: u64,
    },

    /// A delta targeted an entity that is not present in the store.
    #[error("entity {entity} is not present")]
    UnknownEntity { entity: entity::EntityId },

    /// An entity id appeared twice in a full-state substitution.
    #[error("entity {entity} appears more than once")]
    DuplicateEntity { entity: entity::EntityId },

    /// A field value referenced a field the schema does not declare for the kind.
    #[error("field '{field}' is not declared for kind '{kind}'")]
    UndeclaredField { kind: String, field: String },

    /// A field value had a different type than its declaration.
    #[error("field '{field}' of kind '{kind}' expects {expected:?}, got {actual:?}")]
    FieldTypeMismatch {
        kind: String,
        field: String,
        expected: value::ValueType,
        actual: value::ValueType,
    },

    /// A position or grid cell lies outside the environment grid.
    #[error("cell ({x}, {y}) is outside the {width}x{height} grid")]
    OutOfBounds {
        x: i32,
        y: i32,
        width: u32,
        height: u32,
    },

    /// Grid dimensions and cell buffer length disagree.
    #[error("grid of {width}x{height} needs {expected} cells, got {actual}")]
    GridSizeMismatch {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },

    /// A persisted catalog disagrees with the ids already allocated in memory.
    #[error("catalog mismatch at id {id}: expected '{expected}', found '{found}'")]
    CatalogMismatch {
        id: u32,
        expected: String,
        found: String,
    },
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::catalog::{EntityCatalog, KindId};
    pub use crate::delta::{CellChange, Delta, DeltaBuffer, DeltaOutcome, RejectedDelta, TickReport};
    pub use crate::entity::{EntityAllocator, EntityId, EntityRecord};
    pub use crate::grid::EnvironmentGrid;
    pub use crate::schema::{FieldDecl, FieldDeclaration, SchemaRegistry};
    pub use crate::snapshot::{StepMetadata, TimestepSnapshot};
    pub use crate::store::SimulationStore;
    pub use crate::value::{Value, ValueType};
    pub use crate::StoreError;
}

//! Piecewise updates to the live store.
//!
//! A [`Delta`] is one incremental change: spawn an entity, despawn one, update
//! fields, move, or mutate grid cells. The per-tick simulation logic queues
//! deltas into a [`DeltaBuffer`] instead of rewriting the whole state, and the
//! store applies them in FIFO order.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use trophic_store::prelude::*;
//!
//! let schema = Arc::new(SchemaRegistry::new());
//! schema.declare_field("herbivore", "energy", ValueType::Float, Value::Float(10.0)).unwrap();
//! let catalog = Arc::new(EntityCatalog::new());
//! let herbivore = catalog.id_for("herbivore");
//! let store = SimulationStore::new(schema, catalog, EnvironmentGrid::filled(10, 10, 1.0));
//!
//! let mut buffer = DeltaBuffer::new();
//! buffer.spawn(herbivore, 2, 2, [("energy", Value::Float(4.0))]);
//! buffer.set_cell(2, 2, 0.25);
//!
//! let report = store.commit_tick(buffer);
//! assert_eq!(report.applied, 2);
//! assert_eq!(store.current_index(), 1);
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::catalog::KindId;
use crate::entity::EntityId;
use crate::value::Value;
use crate::StoreError;

// ---------------------------------------------------------------------------
// Delta
// ---------------------------------------------------------------------------

/// A single grid cell assignment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CellChange {
    pub x: i32,
    pub y: i32,
    pub value: f32,
}

/// One piecewise change to the live state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Delta {
    /// Add an entity. Fields not given take their declared defaults.
    Spawn {
        kind: KindId,
        x: i32,
        y: i32,
        fields: BTreeMap<String, Value>,
    },
    /// Remove an entity.
    Despawn { id: EntityId },
    /// Overwrite some fields of an entity.
    Update {
        id: EntityId,
        fields: BTreeMap<String, Value>,
    },
    /// Move an entity to another cell.
    Move { id: EntityId, x: i32, y: i32 },
    /// Assign one or more grid cells.
    SetCells { cells: Vec<CellChange> },
}

impl Delta {
    /// Spawn with all fields defaulted.
    pub fn spawn(kind: KindId, x: i32, y: i32) -> Self {
        Delta::Spawn {
            kind,
            x,
            y,
            fields: BTreeMap::new(),
        }
    }

    pub fn spawn_with<'a>(
        kind: KindId,
        x: i32,
        y: i32,
        fields: impl IntoIterator<Item = (&'a str, Value)>,
    ) -> Self {
        Delta::Spawn {
            kind,
            x,
            y,
            fields: collect_fields(fields),
        }
    }

    pub fn despawn(id: EntityId) -> Self {
        Delta::Despawn { id }
    }

    pub fn update<'a>(id: EntityId, fields: impl IntoIterator<Item = (&'a str, Value)>) -> Self {
        Delta::Update {
            id,
            fields: collect_fields(fields),
        }
    }

    /// The existing entity this delta targets, if any.
    pub fn target(&self) -> Option<EntityId> {
        match self {
            Delta::Despawn { id } | Delta::Update { id, .. } | Delta::Move { id, .. } => Some(*id),
            Delta::Spawn { .. } | Delta::SetCells { .. } => None,
        }
    }
}

fn collect_fields<'a>(fields: impl IntoIterator<Item = (&'a str, Value)>) -> BTreeMap<String, Value> {
    fields
        .into_iter()
        .map(|(name, value)| (name.to_owned(), value))
        .collect()
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Result of a successful [`SimulationStore::apply_delta`](crate::store::SimulationStore::apply_delta).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeltaOutcome {
    /// Ids allocated by `Spawn` deltas, in delta order.
    pub spawned: Vec<EntityId>,
}

/// A delta that was rejected during a tick commit.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedDelta {
    /// Position of the delta in the committed batch.
    pub position: usize,
    pub delta: Delta,
    pub error: StoreError,
}

/// Summary of one [`SimulationStore::commit_tick`](crate::store::SimulationStore::commit_tick).
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    /// Index the store represents after the commit.
    pub index: u64,
    /// Number of deltas applied.
    pub applied: usize,
    /// Deltas skipped because they failed validation.
    pub rejected: Vec<RejectedDelta>,
    /// Ids allocated by spawns, in delta order.
    pub spawned: Vec<EntityId>,
}

// ---------------------------------------------------------------------------
// DeltaBuffer
// ---------------------------------------------------------------------------

/// Collects deltas during a tick, in insertion order, together with the
/// debug events the tick wants recorded on its step.
#[derive(Debug, Clone, Default)]
pub struct DeltaBuffer {
    deltas: Vec<Delta>,
    events: Vec<String>,
}

impl DeltaBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, delta: Delta) {
        self.deltas.push(delta);
    }

    pub fn spawn<'a>(
        &mut self,
        kind: KindId,
        x: i32,
        y: i32,
        fields: impl IntoIterator<Item = (&'a str, Value)>,
    ) {
        self.push(Delta::spawn_with(kind, x, y, fields));
    }

    pub fn despawn(&mut self, id: EntityId) {
        self.push(Delta::despawn(id));
    }

    pub fn update<'a>(&mut self, id: EntityId, fields: impl IntoIterator<Item = (&'a str, Value)>) {
        self.push(Delta::update(id, fields));
    }

    pub fn move_to(&mut self, id: EntityId, x: i32, y: i32) {
        self.push(Delta::Move { id, x, y });
    }

    /// Queue a single cell assignment. Consecutive cell assignments are
    /// merged into one `SetCells` delta.
    pub fn set_cell(&mut self, x: i32, y: i32, value: f32) {
        let change = CellChange { x, y, value };
        if let Some(Delta::SetCells { cells }) = self.deltas.last_mut() {
            cells.push(change);
        } else {
            self.push(Delta::SetCells {
                cells: vec![change],
            });
        }
    }

    /// Record a debug message on the step this buffer produces.
    pub fn log_event(&mut self, message: impl Into<String>) {
        self.events.push(message.into());
    }

    pub fn events(&self) -> &[String] {
        &self.events
    }

    pub fn deltas(&self) -> &[Delta] {
        &self.deltas
    }

    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    /// Drain the buffer, returning the queued deltas in order.
    pub fn take(&mut self) -> Vec<Delta> {
        std::mem::take(&mut self.deltas)
    }

    pub(crate) fn take_events(&mut self) -> Vec<String> {
        std::mem::take(&mut self.events)
    }
}

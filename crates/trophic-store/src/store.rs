//! The memory-resident store: the single authoritative "now" of a run.
//!
//! [`SimulationStore`] holds the environment grid, the entity set and the
//! allocator for exactly one timestep index behind a single `RwLock`. Every
//! public mutation takes the write lock once, validates, and only then
//! mutates, so readers observe either the state before an operation or the
//! state after it -- never a half-applied delta or a grid from one step with
//! entities from another.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;

use crate::catalog::{EntityCatalog, KindId};
use crate::delta::{CellChange, Delta, DeltaBuffer, DeltaOutcome, RejectedDelta, TickReport};
use crate::entity::{EntityAllocator, EntityId, EntityRecord};
use crate::grid::EnvironmentGrid;
use crate::schema::SchemaRegistry;
use crate::snapshot::{StepMetadata, TimestepSnapshot};
use crate::value::Value;
use crate::StoreError;

// ---------------------------------------------------------------------------
// LiveState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct LiveState {
    index: u64,
    grid: EnvironmentGrid,
    entities: Arc<BTreeMap<EntityId, EntityRecord>>,
    allocator: EntityAllocator,
    debug_logs: Vec<String>,
    seed: Option<u64>,
}

/// Entities a batch has spawned or removed so far, for validating later
/// deltas of the same batch before anything is mutated.
#[derive(Default)]
struct BatchOverlay {
    spawned: HashMap<EntityId, KindId>,
    removed: HashSet<EntityId>,
}

impl BatchOverlay {
    fn kind_of(&self, state: &LiveState, id: EntityId) -> Option<KindId> {
        if let Some(&kind) = self.spawned.get(&id) {
            return Some(kind);
        }
        if self.removed.contains(&id) {
            return None;
        }
        state.entities.get(&id).map(|e| e.kind)
    }
}

// ---------------------------------------------------------------------------
// SimulationStore
// ---------------------------------------------------------------------------

/// Live, mutable simulation state for one run.
///
/// The store starts at index 0. The tick loop advances it with
/// [`commit_tick`](Self::commit_tick); the replay controller substitutes a
/// historical state with [`restore`](Self::restore).
#[derive(Debug)]
pub struct SimulationStore {
    schema: Arc<SchemaRegistry>,
    catalog: Arc<EntityCatalog>,
    state: RwLock<LiveState>,
}

impl SimulationStore {
    /// Create a store at index 0 with an empty population.
    pub fn new(
        schema: Arc<SchemaRegistry>,
        catalog: Arc<EntityCatalog>,
        grid: EnvironmentGrid,
    ) -> Self {
        Self {
            schema,
            catalog,
            state: RwLock::new(LiveState {
                index: 0,
                grid,
                entities: Arc::new(BTreeMap::new()),
                allocator: EntityAllocator::new(),
                debug_logs: Vec::new(),
                seed: None,
            }),
        }
    }

    pub fn schema(&self) -> &Arc<SchemaRegistry> {
        &self.schema
    }

    pub fn catalog(&self) -> &Arc<EntityCatalog> {
        &self.catalog
    }

    /// Record the run's random seed in every subsequent snapshot.
    pub fn set_seed(&self, seed: Option<u64>) {
        self.state.write().seed = seed;
    }

    // -- reads --------------------------------------------------------------

    /// The timestep index this store currently represents.
    pub fn current_index(&self) -> u64 {
        self.state.read().index
    }

    pub fn entity(&self, id: EntityId) -> Option<EntityRecord> {
        self.state.read().entities.get(&id).cloned()
    }

    pub fn entity_count(&self) -> usize {
        self.state.read().entities.len()
    }

    pub fn entities_of_kind(&self, kind: KindId) -> Vec<EntityRecord> {
        self.state
            .read()
            .entities
            .values()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }

    /// Copy-on-write handle to the current grid.
    pub fn grid(&self) -> EnvironmentGrid {
        self.state.read().grid.clone()
    }

    /// Capture an immutable view of the current state.
    ///
    /// O(1): the grid and entity map are shared with the live store until the
    /// store next mutates them.
    pub fn snapshot(&self) -> TimestepSnapshot {
        let state = self.state.read();
        TimestepSnapshot {
            index: state.index,
            grid: state.grid.clone(),
            entities: Arc::clone(&state.entities),
            next_entity_id: state.allocator.next_raw(),
            catalog_version: self.catalog.version(),
            schema_version: self.schema.version(),
            metadata: StepMetadata {
                wall_clock_ms: unix_millis(),
                seed: state.seed,
                debug_logs: state.debug_logs.clone(),
            },
        }
    }

    // -- full-state substitution ---------------------------------------------

    /// Atomically replace the whole state.
    ///
    /// The allocator resumes at `next_entity_id`, or after the largest id in
    /// `entities` if that is higher.
    ///
    /// # Errors
    ///
    /// [`StoreError::UnknownKind`], [`StoreError::DuplicateEntity`] or
    /// [`StoreError::OutOfBounds`]; the store is unchanged on error.
    pub fn replace_state(
        &self,
        index: u64,
        grid: EnvironmentGrid,
        entities: Vec<EntityRecord>,
        next_entity_id: u64,
    ) -> Result<(), StoreError> {
        let catalog_version = self.catalog.version();
        let mut map = BTreeMap::new();
        for record in entities {
            self.check_kind(record.kind, catalog_version)?;
            grid.check_bounds(record.x, record.y)?;
            let id = record.id;
            if map.insert(id, record).is_some() {
                return Err(StoreError::DuplicateEntity { entity: id });
            }
        }
        let next = map
            .keys()
            .next_back()
            .map_or(next_entity_id, |max| next_entity_id.max(max.to_raw() + 1));

        let mut state = self.state.write();
        state.index = index;
        state.grid = grid;
        state.entities = Arc::new(map);
        state.allocator = EntityAllocator::starting_at(next);
        state.debug_logs.clear();
        Ok(())
    }

    /// Atomically substitute a recorded snapshot.
    ///
    /// Shares the snapshot's grid and entity map (no copy).
    ///
    /// # Errors
    ///
    /// [`StoreError::UnknownKind`] if a record's kind does not resolve in the
    /// snapshot's catalog version; the store is unchanged on error.
    pub fn restore(&self, snapshot: &TimestepSnapshot) -> Result<(), StoreError> {
        for record in snapshot.entities.values() {
            self.check_kind(record.kind, snapshot.catalog_version)?;
        }
        let mut state = self.state.write();
        state.index = snapshot.index;
        state.grid = snapshot.grid.clone();
        state.entities = Arc::clone(&snapshot.entities);
        state.allocator = EntityAllocator::starting_at(snapshot.next_entity_id);
        state.debug_logs = snapshot.metadata.debug_logs.clone();
        Ok(())
    }

    // -- piecewise updates ----------------------------------------------------

    /// Apply a batch of deltas to the current step, all or nothing.
    ///
    /// The whole batch is validated against the current state (taking earlier
    /// deltas of the batch into account) before anything is mutated. The
    /// index does not change.
    ///
    /// # Errors
    ///
    /// The first validation failure: [`StoreError::UnknownEntity`],
    /// [`StoreError::UnknownKind`], [`StoreError::UndeclaredField`],
    /// [`StoreError::FieldTypeMismatch`] or [`StoreError::OutOfBounds`].
    pub fn apply_delta(&self, changes: &[Delta]) -> Result<DeltaOutcome, StoreError> {
        let mut state = self.state.write();
        self.validate_batch(&state, changes)?;

        let mut outcome = DeltaOutcome::default();
        for delta in changes {
            if let Some(id) = self.apply_one(&mut state, delta)? {
                outcome.spawned.push(id);
            }
        }
        Ok(outcome)
    }

    /// Apply one tick's deltas and advance to the next index.
    ///
    /// Deltas are applied in FIFO order, each atomically; an invalid delta is
    /// skipped, logged and reported while the rest still apply. Events logged
    /// on the buffer become the debug log of the new step. Everything happens
    /// under one write lock, so readers see either the previous step or the
    /// finished next one.
    pub fn commit_tick(&self, mut buffer: DeltaBuffer) -> TickReport {
        let events = buffer.take_events();
        let deltas = buffer.take();

        let mut state = self.state.write();
        let next_index = state.index + 1;
        let mut report = TickReport::default();
        let mut debug_logs = Vec::with_capacity(events.len());

        for (position, delta) in deltas.into_iter().enumerate() {
            match self.apply_one(&mut state, &delta) {
                Ok(spawned) => {
                    report.applied += 1;
                    report.spawned.extend(spawned);
                }
                Err(error) => {
                    tracing::warn!(
                        index = next_index,
                        position,
                        error = %error,
                        "rejected delta"
                    );
                    debug_logs.push(format_event(
                        next_index,
                        &format!("rejected delta {position}: {error}"),
                    ));
                    report.rejected.push(RejectedDelta {
                        position,
                        delta,
                        error,
                    });
                }
            }
        }
        debug_logs.extend(events.iter().map(|e| format_event(next_index, e)));

        state.index = next_index;
        state.debug_logs = debug_logs;
        report.index = next_index;
        report
    }

    /// Append a timestamped debug message to the current step.
    pub fn log_event(&self, message: &str) {
        let mut state = self.state.write();
        let line = format_event(state.index, message);
        state.debug_logs.push(line);
    }

    // -- validation -----------------------------------------------------------

    fn kind_name(&self, kind: KindId, catalog_version: u64) -> Result<String, StoreError> {
        self.catalog
            .name_for(kind, catalog_version)
            .ok_or(StoreError::UnknownKind {
                kind,
                catalog_version,
            })
    }

    fn check_kind(&self, kind: KindId, catalog_version: u64) -> Result<(), StoreError> {
        self.kind_name(kind, catalog_version).map(|_| ())
    }

    fn check_fields(
        &self,
        kind: KindId,
        fields: &BTreeMap<String, Value>,
    ) -> Result<String, StoreError> {
        let kind_name = self.kind_name(kind, self.catalog.version())?;
        for (name, value) in fields {
            let decl = self
                .schema
                .field(&kind_name, name)
                .ok_or_else(|| StoreError::UndeclaredField {
                    kind: kind_name.clone(),
                    field: name.clone(),
                })?;
            if decl.value_type != value.value_type() {
                return Err(StoreError::FieldTypeMismatch {
                    kind: kind_name.clone(),
                    field: name.clone(),
                    expected: decl.value_type,
                    actual: value.value_type(),
                });
            }
        }
        Ok(kind_name)
    }

    fn check_cells(grid: &EnvironmentGrid, cells: &[CellChange]) -> Result<(), StoreError> {
        cells
            .iter()
            .try_for_each(|cell| grid.check_bounds(cell.x, cell.y))
    }

    fn validate_batch(&self, state: &LiveState, changes: &[Delta]) -> Result<(), StoreError> {
        let mut overlay = BatchOverlay::default();
        let mut spawn_count = 0;

        for delta in changes {
            match delta {
                Delta::Spawn { kind, x, y, fields } => {
                    self.check_fields(*kind, fields)?;
                    state.grid.check_bounds(*x, *y)?;
                    overlay
                        .spawned
                        .insert(state.allocator.peek(spawn_count), *kind);
                    spawn_count += 1;
                }
                Delta::Despawn { id } => {
                    overlay
                        .kind_of(state, *id)
                        .ok_or(StoreError::UnknownEntity { entity: *id })?;
                    if overlay.spawned.remove(id).is_none() {
                        overlay.removed.insert(*id);
                    }
                }
                Delta::Update { id, fields } => {
                    let kind = overlay
                        .kind_of(state, *id)
                        .ok_or(StoreError::UnknownEntity { entity: *id })?;
                    self.check_fields(kind, fields)?;
                }
                Delta::Move { id, x, y } => {
                    overlay
                        .kind_of(state, *id)
                        .ok_or(StoreError::UnknownEntity { entity: *id })?;
                    state.grid.check_bounds(*x, *y)?;
                }
                Delta::SetCells { cells } => Self::check_cells(&state.grid, cells)?,
            }
        }
        Ok(())
    }

    /// Validate and apply one delta. On error nothing has been mutated.
    fn apply_one(&self, state: &mut LiveState, delta: &Delta) -> Result<Option<EntityId>, StoreError> {
        match delta {
            Delta::Spawn { kind, x, y, fields } => {
                let kind_name = self.check_fields(*kind, fields)?;
                state.grid.check_bounds(*x, *y)?;

                let id = state.allocator.allocate();
                let mut record = EntityRecord::new(id, *kind, *x, *y);
                for decl in self.schema.fields_for(&kind_name) {
                    record.fields.insert(decl.name, decl.default);
                }
                record
                    .fields
                    .extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
                Arc::make_mut(&mut state.entities).insert(id, record);
                Ok(Some(id))
            }
            Delta::Despawn { id } => {
                if !state.entities.contains_key(id) {
                    return Err(StoreError::UnknownEntity { entity: *id });
                }
                Arc::make_mut(&mut state.entities).remove(id);
                Ok(None)
            }
            Delta::Update { id, fields } => {
                let kind = state
                    .entities
                    .get(id)
                    .map(|e| e.kind)
                    .ok_or(StoreError::UnknownEntity { entity: *id })?;
                self.check_fields(kind, fields)?;
                if let Some(record) = Arc::make_mut(&mut state.entities).get_mut(id) {
                    record
                        .fields
                        .extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
                Ok(None)
            }
            Delta::Move { id, x, y } => {
                if !state.entities.contains_key(id) {
                    return Err(StoreError::UnknownEntity { entity: *id });
                }
                state.grid.check_bounds(*x, *y)?;
                if let Some(record) = Arc::make_mut(&mut state.entities).get_mut(id) {
                    record.x = *x;
                    record.y = *y;
                }
                Ok(None)
            }
            Delta::SetCells { cells } => {
                Self::check_cells(&state.grid, cells)?;
                for cell in cells {
                    state.grid.set(cell.x, cell.y, cell.value)?;
                }
                Ok(None)
            }
        }
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

fn format_event(index: u64, message: &str) -> String {
    format!("[{}] Timestep {index}: {message}", unix_millis() / 1000)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ValueType;

    struct Fixture {
        store: SimulationStore,
        producer: KindId,
        herbivore: KindId,
    }

    fn fixture() -> Fixture {
        let schema = Arc::new(SchemaRegistry::new());
        schema
            .declare_field("producer", "energy", ValueType::Float, Value::Float(10.0))
            .unwrap();
        schema
            .declare_field("herbivore", "energy", ValueType::Float, Value::Float(15.0))
            .unwrap();
        schema
            .declare_field("herbivore", "generation", ValueType::Int, Value::Int(0))
            .unwrap();
        let catalog = Arc::new(EntityCatalog::new());
        let producer = catalog.id_for("producer");
        let herbivore = catalog.id_for("herbivore");
        let store = SimulationStore::new(schema, catalog, EnvironmentGrid::filled(8, 8, 1.0));
        Fixture {
            store,
            producer,
            herbivore,
        }
    }

    #[test]
    fn spawn_fills_defaults() {
        let f = fixture();
        let out = f
            .store
            .apply_delta(&[Delta::spawn_with(
                f.herbivore,
                1,
                1,
                [("energy", Value::Float(3.0))],
            )])
            .unwrap();
        let rec = f.store.entity(out.spawned[0]).unwrap();
        assert_eq!(rec.field("energy"), Some(&Value::Float(3.0)));
        assert_eq!(rec.field("generation"), Some(&Value::Int(0)));
        assert_eq!(f.store.current_index(), 0);
    }

    #[test]
    fn failing_batch_leaves_store_untouched() {
        let f = fixture();
        let before = f.store.snapshot();
        let err = f
            .store
            .apply_delta(&[
                Delta::spawn(f.producer, 0, 0),
                Delta::SetCells {
                    cells: vec![CellChange { x: 0, y: 0, value: 0.0 }],
                },
                Delta::despawn(EntityId::from_raw(77)),
            ])
            .unwrap_err();
        assert_eq!(
            err,
            StoreError::UnknownEntity {
                entity: EntityId::from_raw(77)
            }
        );
        let after = f.store.snapshot();
        assert_eq!(before.content_hash(), after.content_hash());
        assert_eq!(f.store.entity_count(), 0);
    }

    #[test]
    fn batch_may_reference_its_own_spawns() {
        let f = fixture();
        let first = EntityId::from_raw(0);
        let out = f
            .store
            .apply_delta(&[
                Delta::spawn(f.herbivore, 0, 0),
                Delta::update(first, [("generation", Value::Int(2))]),
                Delta::Move { id: first, x: 5, y: 5 },
            ])
            .unwrap();
        assert_eq!(out.spawned, vec![first]);
        let rec = f.store.entity(first).unwrap();
        assert_eq!((rec.x, rec.y), (5, 5));
        assert_eq!(rec.field("generation"), Some(&Value::Int(2)));
    }

    #[test]
    fn batch_cannot_touch_what_it_despawned() {
        let f = fixture();
        let out = f.store.apply_delta(&[Delta::spawn(f.producer, 0, 0)]).unwrap();
        let id = out.spawned[0];
        let err = f
            .store
            .apply_delta(&[Delta::despawn(id), Delta::Move { id, x: 1, y: 1 }])
            .unwrap_err();
        assert_eq!(err, StoreError::UnknownEntity { entity: id });
        assert!(f.store.entity(id).is_some());
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let f = fixture();
        let err = f
            .store
            .apply_delta(&[Delta::spawn(KindId(9), 0, 0)])
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownKind { kind: KindId(9), .. }));
    }

    #[test]
    fn field_checks() {
        let f = fixture();
        let err = f
            .store
            .apply_delta(&[Delta::spawn_with(
                f.producer,
                0,
                0,
                [("speed", Value::Int(1))],
            )])
            .unwrap_err();
        assert!(matches!(err, StoreError::UndeclaredField { .. }));

        let err = f
            .store
            .apply_delta(&[Delta::spawn_with(
                f.producer,
                0,
                0,
                [("energy", Value::Int(1))],
            )])
            .unwrap_err();
        assert!(matches!(err, StoreError::FieldTypeMismatch { .. }));
    }

    #[test]
    fn commit_tick_skips_bad_deltas_and_advances() {
        let f = fixture();
        let mut buf = DeltaBuffer::new();
        buf.push(Delta::spawn(f.producer, 2, 2));
        buf.despawn(EntityId::from_raw(500));
        buf.set_cell(0, 0, 0.0);
        buf.log_event("seeded");

        let report = f.store.commit_tick(buf);
        assert_eq!(report.index, 1);
        assert_eq!(report.applied, 2);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].position, 1);
        assert_eq!(f.store.current_index(), 1);
        assert_eq!(f.store.entity_count(), 1);

        let logs = f.store.snapshot().metadata.debug_logs;
        assert_eq!(logs.len(), 2);
        assert!(logs[0].contains("Timestep 1: rejected delta 1"));
        assert!(logs[1].ends_with("Timestep 1: seeded"));
    }

    #[test]
    fn snapshot_is_isolated_from_later_mutation() {
        let f = fixture();
        f.store.apply_delta(&[Delta::spawn(f.producer, 0, 0)]).unwrap();
        let frozen = f.store.snapshot();

        let mut buf = DeltaBuffer::new();
        buf.despawn(EntityId::from_raw(0));
        buf.set_cell(3, 3, 42.0);
        f.store.commit_tick(buf);

        assert_eq!(frozen.index, 0);
        assert_eq!(frozen.entities.len(), 1);
        assert_eq!(frozen.grid.get(3, 3), Some(1.0));
        assert_eq!(f.store.entity_count(), 0);
        assert_eq!(f.store.grid().get(3, 3), Some(42.0));
    }

    #[test]
    fn restore_swaps_everything() {
        let f = fixture();
        f.store.apply_delta(&[Delta::spawn(f.producer, 0, 0)]).unwrap();
        let at_zero = f.store.snapshot();

        let mut buf = DeltaBuffer::new();
        buf.push(Delta::spawn(f.herbivore, 1, 1));
        f.store.commit_tick(buf);
        assert_eq!(f.store.entity_count(), 2);

        f.store.restore(&at_zero).unwrap();
        assert_eq!(f.store.current_index(), 0);
        assert_eq!(f.store.entity_count(), 1);
        assert_eq!(f.store.snapshot().content_hash(), at_zero.content_hash());

        // Allocation continues where the recorded step left off.
        let out = f.store.apply_delta(&[Delta::spawn(f.producer, 0, 1)]).unwrap();
        assert_eq!(out.spawned[0], EntityId::from_raw(1));
    }

    #[test]
    fn replace_state_validates_before_swapping() {
        let f = fixture();
        let grid = EnvironmentGrid::filled(8, 8, 0.0);
        let dup = EntityRecord::new(EntityId::from_raw(3), f.producer, 0, 0);
        let err = f
            .store
            .replace_state(7, grid.clone(), vec![dup.clone(), dup.clone()], 4)
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateEntity { .. }));
        assert_eq!(f.store.current_index(), 0);

        f.store.replace_state(7, grid, vec![dup], 0).unwrap();
        assert_eq!(f.store.current_index(), 7);
        assert_eq!(f.store.snapshot().next_entity_id, 4);
    }
}

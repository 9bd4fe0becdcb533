//! Integration tests for the live store: schema evolution, catalog growth and
//! snapshot isolation seen through the public API.

use std::sync::Arc;
use std::thread;

use trophic_store::prelude::*;

// -- helpers ----------------------------------------------------------------

fn ecosystem() -> (SimulationStore, KindId, KindId) {
    let schema = Arc::new(SchemaRegistry::new());
    schema
        .declare_field("producer", "energy", ValueType::Float, Value::Float(10.0))
        .unwrap();
    schema
        .declare_field("herbivore", "energy", ValueType::Float, Value::Float(15.0))
        .unwrap();
    schema
        .declare_field("herbivore", "speed", ValueType::Float, Value::Float(1.0))
        .unwrap();
    let catalog = Arc::new(EntityCatalog::new());
    let producer = catalog.id_for("producer");
    let herbivore = catalog.id_for("herbivore");
    let store = SimulationStore::new(schema, catalog, EnvironmentGrid::filled(20, 20, 1.0));
    (store, producer, herbivore)
}

// -- tests ------------------------------------------------------------------

#[test]
fn new_field_is_defaulted_for_later_spawns_only() {
    let (store, _, herbivore) = ecosystem();
    let old = store.apply_delta(&[Delta::spawn(herbivore, 0, 0)]).unwrap().spawned[0];
    let before = store.snapshot();

    store
        .schema()
        .declare_field("herbivore", "generation", ValueType::Int, Value::Int(0))
        .unwrap();
    let young = store.apply_delta(&[Delta::spawn(herbivore, 1, 0)]).unwrap().spawned[0];

    assert_eq!(store.entity(old).unwrap().field("generation"), None);
    assert_eq!(store.entity(young).unwrap().field("generation"), Some(&Value::Int(0)));

    let after = store.snapshot();
    assert_eq!(after.schema_version, before.schema_version + 1);

    // Existing records may be given the new field explicitly.
    store
        .apply_delta(&[Delta::update(old, [("generation", Value::Int(4))])])
        .unwrap();
    assert_eq!(store.entity(old).unwrap().field("generation"), Some(&Value::Int(4)));
}

#[test]
fn new_kind_becomes_spawnable() {
    let (store, _, _) = ecosystem();
    let carnivore = store.catalog().id_for("carnivore");
    let err = store
        .apply_delta(&[Delta::spawn_with(carnivore, 0, 0, [("energy", Value::Float(1.0))])])
        .unwrap_err();
    assert!(matches!(err, StoreError::UndeclaredField { .. }));

    store
        .schema()
        .declare_field("carnivore", "energy", ValueType::Float, Value::Float(20.0))
        .unwrap();
    let id = store.apply_delta(&[Delta::spawn(carnivore, 4, 4)]).unwrap().spawned[0];
    assert_eq!(store.entities_of_kind(carnivore).len(), 1);
    assert_eq!(store.snapshot().catalog_version, 3);
    assert_eq!(store.entity(id).unwrap().field("energy"), Some(&Value::Float(20.0)));
}

#[test]
fn out_of_bounds_moves_and_cells_are_rejected() {
    let (store, producer, _) = ecosystem();
    let id = store.apply_delta(&[Delta::spawn(producer, 19, 19)]).unwrap().spawned[0];

    let err = store
        .apply_delta(&[Delta::Move { id, x: 20, y: 0 }])
        .unwrap_err();
    assert_eq!(
        err,
        StoreError::OutOfBounds {
            x: 20,
            y: 0,
            width: 20,
            height: 20
        }
    );

    let err = store
        .apply_delta(&[Delta::SetCells {
            cells: vec![
                CellChange { x: 0, y: 0, value: 3.0 },
                CellChange { x: 0, y: -1, value: 3.0 },
            ],
        }])
        .unwrap_err();
    assert!(matches!(err, StoreError::OutOfBounds { .. }));
    assert_eq!(store.grid().get(0, 0), Some(1.0));
}

#[test]
fn ids_are_never_reused_after_despawn() {
    let (store, producer, _) = ecosystem();
    let first = store.apply_delta(&[Delta::spawn(producer, 0, 0)]).unwrap().spawned[0];
    store.apply_delta(&[Delta::despawn(first)]).unwrap();
    let second = store.apply_delta(&[Delta::spawn(producer, 0, 0)]).unwrap().spawned[0];
    assert!(second > first);
}

#[test]
fn ticks_advance_one_index_at_a_time() {
    let (store, producer, _) = ecosystem();
    for expected in 1..=5u64 {
        let mut buf = DeltaBuffer::new();
        buf.push(Delta::spawn(producer, expected as i32, 0));
        let report = store.commit_tick(buf);
        assert_eq!(report.index, expected);
        assert_eq!(store.current_index(), expected);
    }
    assert_eq!(store.entity_count(), 5);
}

#[test]
fn readers_never_see_a_blended_step() {
    let (store, producer, _) = ecosystem();
    let store = Arc::new(store);

    let writer = {
        let store = Arc::clone(&store);
        thread::spawn(move || {
            for i in 0..200 {
                let mut buf = DeltaBuffer::new();
                buf.push(Delta::spawn(producer, 0, 0));
                buf.set_cell(0, 0, (i + 1) as f32);
                store.commit_tick(buf);
            }
        })
    };

    // Each committed step n has exactly n entities and cell (0, 0) == n.
    for _ in 0..200 {
        let snap = store.snapshot();
        assert_eq!(snap.entities.len() as u64, snap.index);
        if snap.index > 0 {
            assert_eq!(snap.grid.get(0, 0), Some(snap.index as f32));
        }
    }
    writer.join().unwrap();
    assert_eq!(store.current_index(), 200);
}

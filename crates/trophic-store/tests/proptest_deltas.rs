//! Property tests for delta application.
//!
//! Random delta sequences are applied to the store and to a plain model; after
//! every batch the two must agree.

use std::collections::BTreeMap;
use std::sync::Arc;

use proptest::prelude::*;
use trophic_store::prelude::*;

const SIZE: i32 = 6;

#[derive(Debug, Clone)]
enum Op {
    Spawn(i32, i32, f64),
    Despawn(usize),
    Update(usize, f64),
    Move(usize, i32, i32),
    SetCell(i32, i32, f32),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..SIZE, 0..SIZE, 0.0..100.0f64).prop_map(|(x, y, e)| Op::Spawn(x, y, e)),
        (0..16usize).prop_map(Op::Despawn),
        (0..16usize, 0.0..100.0f64).prop_map(|(i, e)| Op::Update(i, e)),
        (0..16usize, -1..SIZE + 1, -1..SIZE + 1).prop_map(|(i, x, y)| Op::Move(i, x, y)),
        (-1..SIZE + 1, -1..SIZE + 1, 0.0..5.0f32).prop_map(|(x, y, v)| Op::SetCell(x, y, v)),
    ]
}

#[derive(Debug, Default)]
struct Model {
    entities: BTreeMap<EntityId, (i32, i32, f64)>,
    cells: BTreeMap<(i32, i32), f32>,
    next_id: u64,
}

fn in_bounds(x: i32, y: i32) -> bool {
    (0..SIZE).contains(&x) && (0..SIZE).contains(&y)
}

fn setup() -> (SimulationStore, KindId) {
    let schema = Arc::new(SchemaRegistry::new());
    schema
        .declare_field("producer", "energy", ValueType::Float, Value::Float(10.0))
        .unwrap();
    let catalog = Arc::new(EntityCatalog::new());
    let producer = catalog.id_for("producer");
    let grid = EnvironmentGrid::filled(SIZE as u32, SIZE as u32, 1.0);
    (SimulationStore::new(schema, catalog, grid), producer)
}

/// Pick an existing (or, for out-of-range picks, a never-allocated) id.
fn pick(model: &Model, i: usize) -> EntityId {
    model
        .entities
        .keys()
        .nth(i)
        .copied()
        .unwrap_or(EntityId::from_raw(10_000 + i as u64))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Applying deltas one at a time matches the model, and rejected deltas
    /// leave the store exactly as it was.
    #[test]
    fn cumulative_deltas_match_model(ops in prop::collection::vec(op_strategy(), 1..60)) {
        let (store, producer) = setup();
        let mut model = Model::default();

        for op in &ops {
            let before = store.snapshot().content_hash();
            let (delta, valid) = match *op {
                Op::Spawn(x, y, e) => (
                    Delta::spawn_with(producer, x, y, [("energy", Value::Float(e))]),
                    true,
                ),
                Op::Despawn(i) => {
                    let id = pick(&model, i);
                    (Delta::despawn(id), model.entities.contains_key(&id))
                }
                Op::Update(i, e) => {
                    let id = pick(&model, i);
                    (Delta::update(id, [("energy", Value::Float(e))]), model.entities.contains_key(&id))
                }
                Op::Move(i, x, y) => {
                    let id = pick(&model, i);
                    (Delta::Move { id, x, y }, model.entities.contains_key(&id) && in_bounds(x, y))
                }
                Op::SetCell(x, y, value) => (
                    Delta::SetCells { cells: vec![CellChange { x, y, value }] },
                    in_bounds(x, y),
                ),
            };

            let result = store.apply_delta(std::slice::from_ref(&delta));
            prop_assert_eq!(result.is_ok(), valid, "delta {:?}", delta);

            if !valid {
                prop_assert_eq!(store.snapshot().content_hash(), before);
                continue;
            }
            match *op {
                Op::Spawn(x, y, e) => {
                    let id = EntityId::from_raw(model.next_id);
                    model.next_id += 1;
                    prop_assert_eq!(&result.unwrap().spawned, &vec![id]);
                    model.entities.insert(id, (x, y, e));
                }
                Op::Despawn(i) => {
                    let id = pick(&model, i);
                    model.entities.remove(&id);
                }
                Op::Update(i, e) => {
                    let id = pick(&model, i);
                    if let Some(entry) = model.entities.get_mut(&id) {
                        entry.2 = e;
                    }
                }
                Op::Move(i, x, y) => {
                    let id = pick(&model, i);
                    if let Some(entry) = model.entities.get_mut(&id) {
                        entry.0 = x;
                        entry.1 = y;
                    }
                }
                Op::SetCell(x, y, v) => {
                    model.cells.insert((x, y), v);
                }
            }
        }

        let snap = store.snapshot();
        prop_assert_eq!(snap.index, 0);
        prop_assert_eq!(snap.next_entity_id, model.next_id);
        prop_assert_eq!(snap.entities.len(), model.entities.len());
        for (id, (x, y, e)) in &model.entities {
            let rec = snap.entity(*id).unwrap();
            prop_assert_eq!((rec.x, rec.y), (*x, *y));
            prop_assert_eq!(rec.field("energy"), Some(&Value::Float(*e)));
        }
        for y in 0..SIZE {
            for x in 0..SIZE {
                let expected = model.cells.get(&(x, y)).copied().unwrap_or(1.0);
                prop_assert_eq!(snap.grid.get(x, y), Some(expected));
            }
        }
    }

    /// A batch containing one invalid delta applies nothing.
    #[test]
    fn batches_are_all_or_nothing(
        spawns in 1..8usize,
        bad_at in 0..8usize,
    ) {
        let (store, producer) = setup();
        let mut batch: Vec<Delta> = (0..spawns).map(|i| Delta::spawn(producer, i as i32 % SIZE, 0)).collect();
        let bad_at = bad_at.min(batch.len());
        batch.insert(bad_at, Delta::despawn(EntityId::from_raw(9_999)));

        let before = store.snapshot();
        prop_assert!(store.apply_delta(&batch).is_err());
        let after = store.snapshot();
        prop_assert_eq!(before.content_hash(), after.content_hash());
        prop_assert_eq!(after.next_entity_id, 0);
    }

    /// Snapshots taken along a tick sequence never change afterwards.
    #[test]
    fn snapshots_are_frozen(cells in prop::collection::vec((0..SIZE, 0..SIZE, 0.0..9.0f32), 1..20)) {
        let (store, producer) = setup();
        let mut taken = Vec::new();
        for (x, y, v) in &cells {
            let snap = store.snapshot();
            taken.push((snap.content_hash(), snap));
            let mut buf = DeltaBuffer::new();
            buf.push(Delta::spawn(producer, *x, *y));
            buf.set_cell(*x, *y, *v);
            store.commit_tick(buf);
        }
        for (i, (hash, snap)) in taken.iter().enumerate() {
            prop_assert_eq!(snap.index, i as u64);
            prop_assert_eq!(&snap.content_hash(), hash);
        }
    }
}

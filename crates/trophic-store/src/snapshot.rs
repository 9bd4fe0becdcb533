//! Immutable timestep snapshots.
//!
//! A [`TimestepSnapshot`] is the unit handed from the live store to the
//! durable log and back. It is copy-on-write: the grid and the entity map are
//! `Arc`-shared with the store that produced them, so capturing one is O(1)
//! and later mutation of the live store never changes it.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::catalog::KindId;
use crate::entity::{EntityId, EntityRecord};
use crate::grid::EnvironmentGrid;

/// Per-step metadata stored with every snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepMetadata {
    /// Wall-clock time (milliseconds since the Unix epoch) at capture.
    pub wall_clock_ms: u64,
    /// Random seed of the run, if the run is seeded.
    pub seed: Option<u64>,
    /// Timestamped debug messages logged during the step.
    pub debug_logs: Vec<String>,
}

/// The complete recorded state of the simulation at one timestep.
#[derive(Debug, Clone, PartialEq)]
pub struct TimestepSnapshot {
    /// Timestep index; 0 is the population before the first update.
    pub index: u64,
    pub grid: EnvironmentGrid,
    /// Every live entity, ordered by id.
    pub entities: Arc<BTreeMap<EntityId, EntityRecord>>,
    /// Next id the allocator hands out after this step.
    pub next_entity_id: u64,
    /// Entity catalog version active when the snapshot was taken.
    pub catalog_version: u64,
    /// Schema registry version active when the snapshot was taken.
    pub schema_version: u64,
    pub metadata: StepMetadata,
}

impl TimestepSnapshot {
    pub fn entity(&self, id: EntityId) -> Option<&EntityRecord> {
        self.entities.get(&id)
    }

    /// Entities of one kind, in id order.
    pub fn entities_of_kind(&self, kind: KindId) -> impl Iterator<Item = &EntityRecord> {
        self.entities.values().filter(move |e| e.kind == kind)
    }

    /// Number of entities per kind.
    pub fn kind_counts(&self) -> BTreeMap<KindId, usize> {
        let mut counts = BTreeMap::new();
        for record in self.entities.values() {
            *counts.entry(record.kind).or_insert(0) += 1;
        }
        counts
    }

    /// BLAKE3 hex digest of the observable simulation state.
    ///
    /// Covers the index, grid, entities and allocator position. Metadata
    /// (wall clock, debug logs) and the catalog/schema versions are excluded,
    /// so two visits of the same recorded step hash identically.
    pub fn content_hash(&self) -> String {
        #[derive(Serialize)]
        struct HashableState<'a> {
            index: u64,
            width: u32,
            height: u32,
            cells: &'a [f32],
            entities: Vec<&'a EntityRecord>,
            next_entity_id: u64,
        }

        let hashable = HashableState {
            index: self.index,
            width: self.grid.width(),
            height: self.grid.height(),
            cells: self.grid.cells(),
            entities: self.entities.values().collect(),
            next_entity_id: self.next_entity_id,
        };

        let mut hasher = blake3::Hasher::new();
        // Writing into a hasher cannot fail; serialization of these plain
        // types cannot either.
        if let Err(e) = serde_json::to_writer(&mut hasher, &hashable) {
            tracing::error!(error = %e, "failed to serialize snapshot for hashing");
        }
        hasher.finalize().to_hex().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot_with(entities: Vec<EntityRecord>) -> TimestepSnapshot {
        TimestepSnapshot {
            index: 3,
            grid: EnvironmentGrid::filled(3, 3, 1.0),
            entities: Arc::new(entities.into_iter().map(|e| (e.id, e)).collect()),
            next_entity_id: 10,
            catalog_version: 2,
            schema_version: 1,
            metadata: StepMetadata::default(),
        }
    }

    #[test]
    fn counts_and_filters_by_kind() {
        let snap = snapshot_with(vec![
            EntityRecord::new(EntityId::from_raw(1), KindId(0), 0, 0),
            EntityRecord::new(EntityId::from_raw(2), KindId(0), 1, 0),
            EntityRecord::new(EntityId::from_raw(3), KindId(1), 2, 2),
        ]);
        assert_eq!(snap.kind_counts()[&KindId(0)], 2);
        assert_eq!(snap.entities_of_kind(KindId(1)).count(), 1);
    }

    #[test]
    fn hash_ignores_metadata_but_not_state() {
        let a = snapshot_with(vec![EntityRecord::new(
            EntityId::from_raw(1),
            KindId(0),
            0,
            0,
        )]);
        let mut b = a.clone();
        b.metadata.debug_logs.push("noise".to_owned());
        b.metadata.wall_clock_ms = 42;
        assert_eq!(a.content_hash(), b.content_hash());
        assert_eq!(a.content_hash().len(), 64);

        let mut c = a.clone();
        c.grid.set(0, 0, 2.0).unwrap();
        assert_ne!(a.content_hash(), c.content_hash());
    }
}

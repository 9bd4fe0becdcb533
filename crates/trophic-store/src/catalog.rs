//! Kind name <-> integer id mapping for compact storage.
//!
//! Records store their kind as a [`KindId`]; the [`EntityCatalog`] keeps the
//! reverse mapping so recordings stay legible. The catalog is append-only: an
//! id, once allocated, is never reassigned or removed, which keeps every old
//! snapshot decodable after new kinds appear.
//!
//! The catalog version equals the number of allocated kinds, so the kind with
//! id `k` is introduced by catalog version `k + 1`.

use std::collections::HashMap;
use std::fmt;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::StoreError;

// ---------------------------------------------------------------------------
// KindId
// ---------------------------------------------------------------------------

/// Compact identifier of an entity kind (producer, herbivore, ...).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KindId(pub u32);

impl KindId {
    /// The catalog version that introduced this id.
    pub fn introduced_at(self) -> u64 {
        u64::from(self.0) + 1
    }
}

impl fmt::Debug for KindId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KindId({})", self.0)
    }
}

// ---------------------------------------------------------------------------
// EntityCatalog
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct CatalogInner {
    by_name: HashMap<String, KindId>,
    /// Indexed by `KindId.0`.
    names: Vec<String>,
}

/// Append-only, versioned mapping between kind names and [`KindId`]s.
///
/// Allocation is serialized behind a write lock and double-checked, so two
/// threads asking for the same new name always receive the same id.
#[derive(Debug, Default)]
pub struct EntityCatalog {
    inner: RwLock<CatalogInner>,
}

impl EntityCatalog {
    /// Create an empty catalog at version 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a catalog whose ids are the positions of `names`.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self, StoreError> {
        let catalog = Self::new();
        catalog.extend_from(names)?;
        Ok(catalog)
    }

    /// Merge a persisted mapping into this catalog.
    ///
    /// `names` must agree with every id already allocated here; names beyond
    /// the current length are allocated in order.
    ///
    /// # Errors
    ///
    /// [`StoreError::CatalogMismatch`] if an existing id maps to another name,
    /// or if a name in `names` is already allocated under a different id.
    pub fn extend_from<S: AsRef<str>>(&self, names: &[S]) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        for (i, name) in names.iter().enumerate() {
            let name = name.as_ref();
            let id = KindId(i as u32);
            match inner.names.get(i) {
                Some(existing) if existing == name => {}
                Some(existing) => {
                    return Err(StoreError::CatalogMismatch {
                        id: id.0,
                        expected: name.to_owned(),
                        found: existing.clone(),
                    });
                }
                None => {
                    if let Some(other) = inner.by_name.get(name) {
                        return Err(StoreError::CatalogMismatch {
                            id: id.0,
                            expected: name.to_owned(),
                            found: format!("id {}", other.0),
                        });
                    }
                    inner.names.push(name.to_owned());
                    inner.by_name.insert(name.to_owned(), id);
                }
            }
        }
        Ok(())
    }

    /// Return the id for `kind_name`, allocating the next unused id (and a new
    /// catalog version) if the name is new.
    pub fn id_for(&self, kind_name: &str) -> KindId {
        if let Some(&id) = self.inner.read().by_name.get(kind_name) {
            return id;
        }

        let mut inner = self.inner.write();
        // Another thread may have allocated between the two locks.
        if let Some(&id) = inner.by_name.get(kind_name) {
            return id;
        }
        let id = KindId(inner.names.len() as u32);
        inner.names.push(kind_name.to_owned());
        inner.by_name.insert(kind_name.to_owned(), id);
        tracing::debug!(kind = kind_name, id = id.0, "allocated kind id");
        id
    }

    /// Existing id for `kind_name`, without allocating.
    pub fn lookup(&self, kind_name: &str) -> Option<KindId> {
        self.inner.read().by_name.get(kind_name).copied()
    }

    /// Resolve `id` using the mapping valid at `catalog_version`.
    ///
    /// Returns `None` if the id was introduced after that version (or never).
    pub fn name_for(&self, id: KindId, catalog_version: u64) -> Option<String> {
        if id.introduced_at() > catalog_version {
            return None;
        }
        self.inner.read().names.get(id.0 as usize).cloned()
    }

    /// Whether `id` resolves at `catalog_version`.
    pub fn resolves(&self, id: KindId, catalog_version: u64) -> bool {
        id.introduced_at() <= catalog_version && (id.0 as usize) < self.inner.read().names.len()
    }

    /// Current catalog version (number of kinds allocated).
    pub fn version(&self) -> u64 {
        self.inner.read().names.len() as u64
    }

    /// All kind names, indexed by id.
    pub fn names(&self) -> Vec<String> {
        self.inner.read().names.clone()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn allocates_sequential_ids() {
        let catalog = EntityCatalog::new();
        assert_eq!(catalog.id_for("producer"), KindId(0));
        assert_eq!(catalog.id_for("herbivore"), KindId(1));
        assert_eq!(catalog.id_for("producer"), KindId(0));
        assert_eq!(catalog.version(), 2);
    }

    #[test]
    fn name_for_respects_version() {
        let catalog = EntityCatalog::new();
        let producer = catalog.id_for("producer");
        let v1 = catalog.version();
        let omnivore = catalog.id_for("omnivore");

        assert_eq!(catalog.name_for(producer, v1).as_deref(), Some("producer"));
        assert_eq!(catalog.name_for(omnivore, v1), None);
        assert_eq!(
            catalog.name_for(omnivore, catalog.version()).as_deref(),
            Some("omnivore")
        );
        assert_eq!(catalog.name_for(KindId(99), catalog.version()), None);
    }

    #[test]
    fn lookup_does_not_allocate() {
        let catalog = EntityCatalog::new();
        assert_eq!(catalog.lookup("carnivore"), None);
        assert_eq!(catalog.version(), 0);
    }

    #[test]
    fn concurrent_allocation_yields_one_id() {
        let catalog = Arc::new(EntityCatalog::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let catalog = Arc::clone(&catalog);
                std::thread::spawn(move || catalog.id_for("omnivore"))
            })
            .collect();
        let ids: Vec<KindId> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(ids.iter().all(|&id| id == ids[0]));
        assert_eq!(catalog.version(), 1);
    }

    #[test]
    fn extend_from_checks_prefix() {
        let catalog = EntityCatalog::new();
        catalog.id_for("producer");
        catalog.extend_from(&["producer", "herbivore"]).unwrap();
        assert_eq!(catalog.lookup("herbivore"), Some(KindId(1)));

        let err = catalog.extend_from(&["carnivore"]).unwrap_err();
        assert!(matches!(err, StoreError::CatalogMismatch { id: 0, .. }));
    }

    #[test]
    fn from_names_roundtrip() {
        let catalog = EntityCatalog::from_names(&["producer", "herbivore", "carnivore"]).unwrap();
        assert_eq!(catalog.names(), vec!["producer", "herbivore", "carnivore"]);
        assert_eq!(catalog.id_for("carnivore"), KindId(2));
    }
}

//! Entity identifiers, allocation and records.
//!
//! An [`EntityId`] is a plain 64-bit counter. Ids are never recycled within a
//! run: the [`EntityAllocator`] only moves forward, and its position is part of
//! every snapshot, so a store restored from history continues allocating
//! exactly where the recorded run did.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::catalog::KindId;
use crate::value::Value;

// ---------------------------------------------------------------------------
// EntityId
// ---------------------------------------------------------------------------

/// Identifier of one simulation actor.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(u64);

impl EntityId {
    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub fn to_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({})", self.0)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// EntityAllocator
// ---------------------------------------------------------------------------

/// Forward-only [`EntityId`] allocator.
#[derive(Debug, Clone, Default)]
pub struct EntityAllocator {
    next: u64,
}

impl EntityAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume allocation at `next`.
    pub fn starting_at(next: u64) -> Self {
        Self { next }
    }

    pub fn allocate(&mut self) -> EntityId {
        let id = EntityId(self.next);
        self.next += 1;
        id
    }

    /// The id the `offset`-th next allocation will return, without allocating.
    pub fn peek(&self, offset: u64) -> EntityId {
        EntityId(self.next + offset)
    }

    /// Raw value of the next id to be handed out.
    pub fn next_raw(&self) -> u64 {
        self.next
    }
}

// ---------------------------------------------------------------------------
// EntityRecord
// ---------------------------------------------------------------------------

/// One simulation actor: a producer or a consumer of some kind.
///
/// `fields` holds the kind-specific attributes declared in the
/// [`SchemaRegistry`](crate::schema::SchemaRegistry) (energy, speed,
/// generation, ...). A `BTreeMap` keeps iteration and hashing deterministic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: EntityId,
    pub kind: KindId,
    pub x: i32,
    pub y: i32,
    pub fields: BTreeMap<String, Value>,
}

impl EntityRecord {
    pub fn new(id: EntityId, kind: KindId, x: i32, y: i32) -> Self {
        Self {
            id,
            kind,
            x,
            y,
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style field setter.
    pub fn with_field(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(name.to_owned(), value.into());
        self
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

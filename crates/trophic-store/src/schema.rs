//! Per-kind field declarations with versioned registration.
//!
//! Every kind-specific attribute an entity may carry must be declared in a
//! [`SchemaRegistry`] before it is written. Each new declaration bumps the
//! registry version, and the version is recorded with every snapshot, so a
//! reader can tell exactly which fields were expected when a snapshot was
//! written and default the rest.
//!
//! Registration is append-only: a field can never be removed or retyped.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::value::{Value, ValueType};
use crate::StoreError;

/// Column names every kind carries implicitly.
pub const RESERVED_FIELDS: [&str; 3] = ["id", "x", "y"];

// ---------------------------------------------------------------------------
// FieldDecl
// ---------------------------------------------------------------------------

/// A single declared field of a kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDecl {
    /// Field name, unique within its kind.
    pub name: String,
    /// Type every value of this field must have.
    pub value_type: ValueType,
    /// Value used when a record (or an older snapshot) lacks the field.
    pub default: Value,
    /// Registry version that introduced this field.
    pub declared_at: u64,
}

/// One entry of the registry's declaration history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDeclaration {
    pub kind: String,
    pub field: FieldDecl,
}

// ---------------------------------------------------------------------------
// SchemaRegistry
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct SchemaInner {
    version: u64,
    /// Kind name -> fields in declaration order.
    kinds: HashMap<String, Vec<FieldDecl>>,
    /// Every declaration in version order.
    history: Vec<FieldDeclaration>,
}

/// Declarative, append-only field catalog keyed by kind name.
///
/// All methods take `&self`; the registry is shared between the live store and
/// the durable log behind an `Arc`.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    inner: RwLock<SchemaInner>,
}

impl SchemaRegistry {
    /// Create an empty registry at version 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a registry by replaying a declaration history in order.
    ///
    /// The resulting registry has the same version and field set as the one
    /// that produced `history`.
    pub fn from_history(history: &[FieldDeclaration]) -> Result<Self, StoreError> {
        let registry = Self::new();
        for decl in history {
            registry.declare_field(
                &decl.kind,
                &decl.field.name,
                decl.field.value_type,
                decl.field.default.clone(),
            )?;
        }
        Ok(registry)
    }

    /// Register a field for `kind`.
    ///
    /// Returns the registry version that introduced the field. Declaring a
    /// field that already exists with the same type is a no-op and returns
    /// the original version.
    ///
    /// # Errors
    ///
    /// - [`StoreError::SchemaConflict`] if the field exists with another type.
    /// - [`StoreError::DefaultTypeMismatch`] if `default` is not a `value_type`.
    /// - [`StoreError::ReservedField`] for `id`, `x` and `y`.
    pub fn declare_field(
        &self,
        kind: &str,
        field_name: &str,
        value_type: ValueType,
        default: Value,
    ) -> Result<u64, StoreError> {
        if RESERVED_FIELDS.contains(&field_name) {
            return Err(StoreError::ReservedField {
                field: field_name.to_owned(),
            });
        }
        if default.value_type() != value_type {
            return Err(StoreError::DefaultTypeMismatch {
                kind: kind.to_owned(),
                field: field_name.to_owned(),
                expected: value_type,
            });
        }

        let mut inner = self.inner.write();
        if let Some(existing) = inner
            .kinds
            .get(kind)
            .and_then(|fields| fields.iter().find(|f| f.name == field_name))
        {
            if existing.value_type != value_type {
                return Err(StoreError::SchemaConflict {
                    kind: kind.to_owned(),
                    field: field_name.to_owned(),
                    existing: existing.value_type,
                    requested: value_type,
                });
            }
            return Ok(existing.declared_at);
        }

        inner.version += 1;
        let decl = FieldDecl {
            name: field_name.to_owned(),
            value_type,
            default,
            declared_at: inner.version,
        };
        inner
            .kinds
            .entry(kind.to_owned())
            .or_default()
            .push(decl.clone());
        inner.history.push(FieldDeclaration {
            kind: kind.to_owned(),
            field: decl,
        });

        tracing::debug!(
            kind,
            field = field_name,
            ?value_type,
            version = inner.version,
            "declared field"
        );
        Ok(inner.version)
    }

    /// Fields declared for `kind` as of now, in declaration order.
    pub fn fields_for(&self, kind: &str) -> Vec<FieldDecl> {
        self.inner
            .read()
            .kinds
            .get(kind)
            .cloned()
            .unwrap_or_default()
    }

    /// Fields declared for `kind` at or before registry `version`.
    pub fn fields_at(&self, kind: &str, version: u64) -> Vec<FieldDecl> {
        self.inner
            .read()
            .kinds
            .get(kind)
            .map(|fields| {
                fields
                    .iter()
                    .filter(|f| f.declared_at <= version)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Look up a single field declaration.
    pub fn field(&self, kind: &str, field_name: &str) -> Option<FieldDecl> {
        self.inner
            .read()
            .kinds
            .get(kind)
            .and_then(|fields| fields.iter().find(|f| f.name == field_name).cloned())
    }

    /// Current registry version (0 before any declaration).
    pub fn version(&self) -> u64 {
        self.inner.read().version
    }

    /// Names of all kinds with at least one declared field, sorted.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.inner.read().kinds.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Full declaration history in version order.
    pub fn history(&self) -> Vec<FieldDeclaration> {
        self.inner.read().history.clone()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! On-disk layout of a timestep log.
//!
//! ```text
//! header   : b"TROPHLOG" | u32 LE format version
//! frame    : u8 tag | u32 LE payload length | 32-byte BLAKE3 of tag, length and payload | payload
//! tags     : 1 = metadata (JSON), 2 = group, 3 = commit (u64 LE index)
//! group    : u64 LE index | u32 LE manifest length | manifest JSON | column blobs
//! ```
//!
//! A group holds one timestep. Its manifest describes the grid and, per kind,
//! the `id`, `x`, `y` columns followed by one column per declared field; the
//! blobs follow in manifest order, each zstd-compressed on its own.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use trophic_store::catalog::{EntityCatalog, KindId};
use trophic_store::entity::{EntityId, EntityRecord};
use trophic_store::grid::EnvironmentGrid;
use trophic_store::schema::{FieldDeclaration, SchemaRegistry};
use trophic_store::snapshot::{StepMetadata, TimestepSnapshot};
use trophic_store::value::ValueType;
use trophic_store::StoreError;

use crate::column::{self, ByteReader, Column, ColumnType, FieldColumn};
use crate::LogError;

pub const MAGIC: &[u8; 8] = b"TROPHLOG";
pub const FORMAT_VERSION: u32 = 1;
pub const HEADER_LEN: u64 = 12;
/// Tag, length and checksum.
pub const FRAME_HEADER_LEN: u64 = 1 + 4 + 32;

// ---------------------------------------------------------------------------
// Header and frames
// ---------------------------------------------------------------------------

pub fn encode_header() -> [u8; HEADER_LEN as usize] {
    let mut header = [0u8; HEADER_LEN as usize];
    header[..8].copy_from_slice(MAGIC);
    header[8..].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
    header
}

pub fn check_header(bytes: &[u8]) -> Result<(), LogError> {
    if bytes.len() < HEADER_LEN as usize || &bytes[..8] != MAGIC {
        return Err(LogError::BadHeader);
    }
    let mut version = [0u8; 4];
    version.copy_from_slice(&bytes[8..12]);
    if u32::from_le_bytes(version) != FORMAT_VERSION {
        return Err(LogError::BadHeader);
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameTag {
    Metadata = 1,
    Group = 2,
    Commit = 3,
}

impl FrameTag {
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(FrameTag::Metadata),
            2 => Some(FrameTag::Group),
            3 => Some(FrameTag::Commit),
            _ => None,
        }
    }
}

/// A frame ready to be written.
pub fn encode_frame(tag: FrameTag, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN as usize + payload.len());
    frame.push(tag as u8);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(frame_checksum(tag as u8, payload.len() as u32, payload).as_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// BLAKE3 over the tag, the length field and the payload.
fn frame_checksum(tag: u8, len: u32, payload: &[u8]) -> blake3::Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[tag]);
    hasher.update(&len.to_le_bytes());
    hasher.update(payload);
    hasher.finalize()
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    pub tag: u8,
    pub len: u32,
    pub checksum: [u8; 32],
}

impl FrameHeader {
    pub fn parse(bytes: &[u8; FRAME_HEADER_LEN as usize]) -> Self {
        let mut len = [0u8; 4];
        len.copy_from_slice(&bytes[1..5]);
        let mut checksum = [0u8; 32];
        checksum.copy_from_slice(&bytes[5..]);
        Self {
            tag: bytes[0],
            len: u32::from_le_bytes(len),
            checksum,
        }
    }

    pub fn verifies(&self, payload: &[u8]) -> bool {
        payload.len() == self.len as usize
            && frame_checksum(self.tag, self.len, payload) == blake3::Hash::from(self.checksum)
    }
}

pub fn commit_payload(index: u64) -> [u8; 8] {
    index.to_le_bytes()
}

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

/// Run-level metadata recorded once per log.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    /// Creation time, milliseconds since the Unix epoch.
    pub created_at_ms: u64,
    pub seed: Option<u64>,
    /// Free-form run configuration.
    #[serde(default)]
    pub config: serde_json::Value,
}

/// Contents of a metadata frame: everything needed to decode later groups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataBlock {
    pub run: RunMetadata,
    pub schema: Vec<FieldDeclaration>,
    pub catalog: Vec<String>,
}

impl MetadataBlock {
    pub fn capture(run: &RunMetadata, schema: &SchemaRegistry, catalog: &EntityCatalog) -> Self {
        Self {
            run: run.clone(),
            schema: schema.history(),
            catalog: catalog.names(),
        }
    }

    pub fn schema_version(&self) -> u64 {
        self.schema.len() as u64
    }

    pub fn catalog_version(&self) -> u64 {
        self.catalog.len() as u64
    }
}

// ---------------------------------------------------------------------------
// Group manifest
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GroupManifest {
    width: u32,
    height: u32,
    grid_bytes: u64,
    next_entity_id: u64,
    catalog_version: u64,
    schema_version: u64,
    metadata: StepMetadata,
    kinds: Vec<KindEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct KindEntry {
    kind: KindId,
    rows: u32,
    columns: Vec<ColumnEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ColumnEntry {
    name: String,
    column_type: ColumnType,
    /// Rows carrying a value; only set for field columns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    present: Option<u32>,
    bytes: u64,
}

fn value_type_of(column_type: ColumnType) -> Option<ValueType> {
    match column_type {
        ColumnType::Int => Some(ValueType::Int),
        ColumnType::Float => Some(ValueType::Float),
        ColumnType::Bool => Some(ValueType::Bool),
        ColumnType::Text => Some(ValueType::Text),
        ColumnType::U64 | ColumnType::I32 | ColumnType::F32 => None,
    }
}

// ---------------------------------------------------------------------------
// Group encoding
// ---------------------------------------------------------------------------

/// Encode `snapshot` as a group payload.
///
/// Field columns follow the schema as of the snapshot's schema version.
///
/// # Errors
///
/// [`StoreError::UnknownKind`] if a record's kind does not resolve at the
/// snapshot's catalog version, [`StoreError::UndeclaredField`] or
/// [`StoreError::FieldTypeMismatch`] for fields outside that schema.
pub fn encode_group(
    snapshot: &TimestepSnapshot,
    schema: &SchemaRegistry,
    catalog: &EntityCatalog,
    level: i32,
) -> Result<Vec<u8>, LogError> {
    let mut by_kind: BTreeMap<KindId, Vec<&EntityRecord>> = BTreeMap::new();
    for record in snapshot.entities.values() {
        by_kind.entry(record.kind).or_default().push(record);
    }

    let mut blobs: Vec<Vec<u8>> = Vec::new();
    let push_blob = |raw: Vec<u8>, blobs: &mut Vec<Vec<u8>>| -> Result<u64, LogError> {
        let blob = column::compress(&raw, level)?;
        let len = blob.len() as u64;
        blobs.push(blob);
        Ok(len)
    };

    let mut raw = Vec::new();
    Column::F32(snapshot.grid.cells().to_vec()).encode_into(&mut raw);
    let grid_bytes = push_blob(raw, &mut blobs)?;

    let mut kinds = Vec::with_capacity(by_kind.len());
    for (kind, records) in by_kind {
        let kind_name = catalog
            .name_for(kind, snapshot.catalog_version)
            .ok_or(StoreError::UnknownKind {
                kind,
                catalog_version: snapshot.catalog_version,
            })?;
        let decls = schema.fields_at(&kind_name, snapshot.schema_version);

        for record in &records {
            if let Some(name) = record
                .fields
                .keys()
                .find(|name| !decls.iter().any(|d| &d.name == *name))
            {
                return Err(StoreError::UndeclaredField {
                    kind: kind_name,
                    field: name.clone(),
                }
                .into());
            }
        }

        let mut columns = Vec::with_capacity(3 + decls.len());
        let builtin = [
            ("id", Column::U64(records.iter().map(|r| r.id.to_raw()).collect())),
            ("x", Column::I32(records.iter().map(|r| r.x).collect())),
            ("y", Column::I32(records.iter().map(|r| r.y).collect())),
        ];
        for (name, col) in builtin {
            let mut raw = Vec::new();
            col.encode_into(&mut raw);
            columns.push(ColumnEntry {
                name: name.to_owned(),
                column_type: col.column_type(),
                present: None,
                bytes: push_blob(raw, &mut blobs)?,
            });
        }

        for decl in &decls {
            let mut col = FieldColumn::new(decl.value_type);
            for (row, record) in records.iter().enumerate() {
                let value = record.field(&decl.name);
                if !col.push(row, value) {
                    return Err(StoreError::FieldTypeMismatch {
                        kind: kind_name,
                        field: decl.name.clone(),
                        expected: decl.value_type,
                        actual: value.map_or(decl.value_type, |v| v.value_type()),
                    }
                    .into());
                }
            }
            let mut raw = Vec::new();
            col.encode_into(&mut raw);
            columns.push(ColumnEntry {
                name: decl.name.clone(),
                column_type: decl.value_type.into(),
                present: Some(col.present_count() as u32),
                bytes: push_blob(raw, &mut blobs)?,
            });
        }

        kinds.push(KindEntry {
            kind,
            rows: records.len() as u32,
            columns,
        });
    }

    let manifest = GroupManifest {
        width: snapshot.grid.width(),
        height: snapshot.grid.height(),
        grid_bytes,
        next_entity_id: snapshot.next_entity_id,
        catalog_version: snapshot.catalog_version,
        schema_version: snapshot.schema_version,
        metadata: snapshot.metadata.clone(),
        kinds,
    };
    let manifest_json = serde_json::to_vec(&manifest)?;

    let blob_total: usize = blobs.iter().map(Vec::len).sum();
    let mut payload = Vec::with_capacity(12 + manifest_json.len() + blob_total);
    payload.extend_from_slice(&snapshot.index.to_le_bytes());
    payload.extend_from_slice(&(manifest_json.len() as u32).to_le_bytes());
    payload.extend_from_slice(&manifest_json);
    for blob in blobs {
        payload.extend_from_slice(&blob);
    }
    Ok(payload)
}

/// The index stored at the start of a group payload.
pub fn group_index(payload: &[u8]) -> Option<u64> {
    ByteReader::new(payload).u64()
}

fn corrupt(offset: u64, reason: &str) -> LogError {
    LogError::Corrupt {
        offset,
        reason: reason.to_owned(),
    }
}

/// Parse the fixed prefix and manifest of a group, leaving `reader` at the
/// first column blob.
fn open_group<'a>(
    payload: &'a [u8],
    offset: u64,
) -> Result<(u64, GroupManifest, ByteReader<'a>), LogError> {
    let mut reader = ByteReader::new(payload);
    let index = reader
        .u64()
        .ok_or_else(|| corrupt(offset, "truncated group index"))?;
    let manifest_len = reader
        .u32()
        .ok_or_else(|| corrupt(offset, "truncated manifest length"))?;
    let manifest_bytes = reader
        .take(manifest_len as usize)
        .ok_or_else(|| corrupt(offset, "truncated manifest"))?;
    let manifest: GroupManifest = serde_json::from_slice(manifest_bytes)?;
    Ok((index, manifest, reader))
}

/// Decompress the next blob.
fn next_blob(reader: &mut ByteReader<'_>, len: u64, offset: u64) -> Result<Vec<u8>, LogError> {
    let at = offset + reader.position() as u64;
    let blob = reader
        .take(len as usize)
        .ok_or_else(|| corrupt(offset, "truncated column blob"))?;
    column::decompress(blob, at)
}

/// Decode a group payload into the snapshot exactly as it was written.
///
/// `offset` is the payload's position in the file, used in error reports.
pub fn decode_group(payload: &[u8], offset: u64) -> Result<TimestepSnapshot, LogError> {
    let (index, manifest, mut reader) = open_group(payload, offset)?;

    let cells_raw = next_blob(&mut reader, manifest.grid_bytes, offset)?;
    let rows = manifest.width as usize * manifest.height as usize;
    let cells = match Column::decode(ColumnType::F32, &mut ByteReader::new(&cells_raw), rows) {
        Some(Column::F32(cells)) => cells,
        _ => return Err(corrupt(offset, "malformed grid column")),
    };
    let grid = EnvironmentGrid::from_cells(manifest.width, manifest.height, cells)?;
    let entities = decode_entities(&manifest, &mut reader, offset)?;

    Ok(TimestepSnapshot {
        index,
        grid,
        entities: Arc::new(entities),
        next_entity_id: manifest.next_entity_id,
        catalog_version: manifest.catalog_version,
        schema_version: manifest.schema_version,
        metadata: manifest.metadata,
    })
}

/// Decode only the step metadata of a group.
/// No column blob is decompressed.
pub fn decode_step_metadata(payload: &[u8], offset: u64) -> Result<StepMetadata, LogError> {
    let (_, manifest, _) = open_group(payload, offset)?;
    Ok(manifest.metadata)
}

/// Decode only the entities of a group, skipping the grid.
pub fn decode_population(
    payload: &[u8],
    offset: u64,
) -> Result<BTreeMap<EntityId, EntityRecord>, LogError> {
    let (_, manifest, mut reader) = open_group(payload, offset)?;
    reader
        .take(manifest.grid_bytes as usize)
        .ok_or_else(|| corrupt(offset, "truncated column blob"))?;
    decode_entities(&manifest, &mut reader, offset)
}

fn decode_entities(
    manifest: &GroupManifest,
    reader: &mut ByteReader<'_>,
    offset: u64,
) -> Result<BTreeMap<EntityId, EntityRecord>, LogError> {
    let mut entities = BTreeMap::new();
    for kind_entry in &manifest.kinds {
        let rows = kind_entry.rows as usize;
        let mut ids = Vec::new();
        let mut xs = Vec::new();
        let mut ys = Vec::new();
        let mut fields: Vec<(&str, Vec<Option<trophic_store::value::Value>>)> = Vec::new();

        for entry in &kind_entry.columns {
            let raw = next_blob(reader, entry.bytes, offset)?;
            let mut col_reader = ByteReader::new(&raw);
            match (entry.name.as_str(), entry.column_type) {
                ("id", ColumnType::U64) => match Column::decode(ColumnType::U64, &mut col_reader, rows) {
                    Some(Column::U64(v)) => ids = v,
                    _ => return Err(corrupt(offset, "malformed id column")),
                },
                ("x" | "y", ColumnType::I32) => {
                    let target = if entry.name == "x" { &mut xs } else { &mut ys };
                    match Column::decode(ColumnType::I32, &mut col_reader, rows) {
                        Some(Column::I32(v)) => *target = v,
                        _ => return Err(corrupt(offset, "malformed position column")),
                    }
                }
                (name, column_type) => {
                    let value_type = value_type_of(column_type)
                        .ok_or_else(|| corrupt(offset, "unexpected column type"))?;
                    let present = entry.present.unwrap_or(kind_entry.rows) as usize;
                    let col = FieldColumn::decode(value_type, &mut col_reader, rows, present)
                        .ok_or_else(|| corrupt(offset, "malformed field column"))?;
                    fields.push((name, col.rows(rows)));
                }
            }
            if !col_reader.is_exhausted() {
                return Err(corrupt(offset, "trailing bytes in column"));
            }
        }

        if ids.len() != rows || xs.len() != rows || ys.len() != rows {
            return Err(corrupt(offset, "missing builtin column"));
        }
        for row in 0..rows {
            let id = EntityId::from_raw(ids[row]);
            let mut record = EntityRecord::new(id, kind_entry.kind, xs[row], ys[row]);
            for (name, values) in &fields {
                if let Some(value) = &values[row] {
                    record.fields.insert((*name).to_owned(), value.clone());
                }
            }
            entities.insert(id, record);
        }
    }
    Ok(entities)
}

//! Concurrent read access to committed snapshots.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use trophic_store::catalog::{EntityCatalog, KindId};
use trophic_store::entity::{EntityId, EntityRecord};
use trophic_store::schema::{FieldDecl, SchemaRegistry};
use trophic_store::snapshot::{StepMetadata, TimestepSnapshot};

use crate::format;
use crate::LogError;

// ---------------------------------------------------------------------------
// LogIndex
// ---------------------------------------------------------------------------

/// Where a committed group lives in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct GroupLocation {
    pub frame_start: u64,
    pub payload_offset: u64,
    pub payload_len: u32,
}

/// Committed groups, indexed by timestep. Shared between the writer and its
/// readers; an index appears here only after its commit frame is on disk.
#[derive(Debug, Default)]
pub(crate) struct LogIndex {
    pub groups: Vec<GroupLocation>,
}

impl LogIndex {
    pub fn highest(&self) -> Option<u64> {
        (self.groups.len() as u64).checked_sub(1)
    }
}

// ---------------------------------------------------------------------------
// LogReader
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct ReaderShared {
    path: PathBuf,
    file: Mutex<File>,
    index: Arc<RwLock<LogIndex>>,
    schema: Arc<SchemaRegistry>,
    catalog: Arc<EntityCatalog>,
}

/// A cheap, cloneable read handle on a [`TimestepLog`](crate::log::TimestepLog).
///
/// Readers see exactly the committed indices, including ones committed after
/// the reader was created, and never an index whose commit is still pending.
#[derive(Debug, Clone)]
pub struct LogReader {
    shared: Arc<ReaderShared>,
}

impl LogReader {
    pub(crate) fn new(
        path: &Path,
        index: Arc<RwLock<LogIndex>>,
        schema: Arc<SchemaRegistry>,
        catalog: Arc<EntityCatalog>,
    ) -> Result<Self, LogError> {
        let file = File::open(path)?;
        Ok(Self {
            shared: Arc::new(ReaderShared {
                path: path.to_path_buf(),
                file: Mutex::new(file),
                index,
                schema,
                catalog,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// Highest committed index, `None` for an empty log.
    pub fn highest_index(&self) -> Option<u64> {
        self.shared.index.read().highest()
    }

    /// Number of committed snapshots.
    pub fn len(&self) -> u64 {
        self.shared.index.read().groups.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read the snapshot at `index`, filling fields it lacks with the defaults
    /// of the current schema.
    ///
    /// # Errors
    ///
    /// [`LogError::IndexNotFound`] if `index` was never committed.
    pub fn read(&self, index: u64) -> Result<TimestepSnapshot, LogError> {
        let mut snapshot = self.read_as_written(index)?;
        self.fill_defaults(Arc::make_mut(&mut snapshot.entities));
        Ok(snapshot)
    }

    /// Read the snapshot at `index` exactly as it was appended.
    pub fn read_as_written(&self, index: u64) -> Result<TimestepSnapshot, LogError> {
        let (payload, offset) = self.load_group(index)?;
        format::decode_group(&payload, offset)
    }

    /// Read only the step metadata at `index`. Column blobs are not
    /// decompressed.
    pub fn read_metadata(&self, index: u64) -> Result<StepMetadata, LogError> {
        let (payload, offset) = self.load_group(index)?;
        format::decode_step_metadata(&payload, offset)
    }

    /// The debug log lines recorded for the step at `index`.
    pub fn read_logs(&self, index: u64) -> Result<Vec<String>, LogError> {
        Ok(self.read_metadata(index)?.debug_logs)
    }

    /// Read only the entities at `index`, with defaults filled as in
    /// [`read`](Self::read). The grid is skipped.
    pub fn read_population(
        &self,
        index: u64,
    ) -> Result<BTreeMap<EntityId, EntityRecord>, LogError> {
        let (payload, offset) = self.load_group(index)?;
        let mut entities = format::decode_population(&payload, offset)?;
        self.fill_defaults(&mut entities);
        Ok(entities)
    }

    fn load_group(&self, index: u64) -> Result<(Vec<u8>, u64), LogError> {
        let log_index = self.shared.index.read();
        let location = usize::try_from(index)
            .ok()
            .and_then(|i| log_index.groups.get(i).copied())
            .ok_or(LogError::IndexNotFound { index })?;

        // The index lock stays held so a concurrent truncation cannot cut
        // the file under this read.
        let mut payload = vec![0u8; location.payload_len as usize];
        let mut file = self.shared.file.lock();
        file.seek(SeekFrom::Start(location.payload_offset))?;
        file.read_exact(&mut payload)?;
        Ok((payload, location.payload_offset))
    }

    fn fill_defaults(&self, entities: &mut BTreeMap<EntityId, EntityRecord>) {
        let version = self.shared.catalog.version();
        let mut decls: HashMap<KindId, Vec<FieldDecl>> = HashMap::new();
        for record in entities.values_mut() {
            let fields = decls.entry(record.kind).or_insert_with(|| {
                self.shared
                    .catalog
                    .name_for(record.kind, version)
                    .map(|name| self.shared.schema.fields_for(&name))
                    .unwrap_or_default()
            });
            for decl in fields.iter() {
                record
                    .fields
                    .entry(decl.name.clone())
                    .or_insert_with(|| decl.default.clone());
            }
        }
    }
}

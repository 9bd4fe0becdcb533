//! The single-writer timestep log.
//!
//! Appends follow write-then-commit: an optional metadata frame, then the
//! group frame, then a commit frame, with a sync after each stage. An index
//! becomes visible to readers only after its commit frame is durable. On
//! [`open`](TimestepLog::open), anything after the last commit is a staged
//! fragment and is discarded (or reported, see [`LogOptions`]).

use std::fs::{File, OpenOptions, TryLockError};
use std::io::{BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use trophic_store::catalog::EntityCatalog;
use trophic_store::schema::SchemaRegistry;
use trophic_store::snapshot::TimestepSnapshot;

use crate::format::{
    self, FrameHeader, FrameTag, MetadataBlock, RunMetadata, FRAME_HEADER_LEN, HEADER_LEN,
};
use crate::reader::{GroupLocation, LogIndex, LogReader};
use crate::LogError;

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Tunables for opening and writing a log.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LogOptions {
    /// Cut a trailing staged fragment back to the last commit on open. When
    /// `false`, such a file fails to open with
    /// [`LogError::PartialWriteDetected`].
    pub recover_partial_writes: bool,
    /// `fsync` between the stages of every append.
    pub sync_writes: bool,
    /// zstd level for column blobs.
    pub compression_level: i32,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            recover_partial_writes: true,
            sync_writes: true,
            compression_level: 3,
        }
    }
}

/// What [`TimestepLog::open`] discarded while recovering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub discarded_bytes: u64,
    /// Highest index that survived, `None` if none did.
    pub last_good: Option<u64>,
    pub reason: String,
}

#[derive(Debug, Clone, Copy)]
struct MetaFrame {
    offset: u64,
    schema_version: u64,
    catalog_version: u64,
}

// ---------------------------------------------------------------------------
// Scan
// ---------------------------------------------------------------------------

/// Result of verifying a log file front to back.
struct Scan {
    groups: Vec<GroupLocation>,
    meta_frames: Vec<MetaFrame>,
    latest_meta: Option<MetadataBlock>,
    /// End of the last committed (or complete metadata) frame.
    good_end: u64,
    /// Why scanning stopped before the end of the file, if it did.
    torn: Option<&'static str>,
}

fn scan(file: &File, file_len: u64) -> Result<Scan, LogError> {
    let mut input = BufReader::new(file);
    let mut header = [0u8; HEADER_LEN as usize];
    if let Err(e) = input.read_exact(&mut header) {
        return Err(if e.kind() == ErrorKind::UnexpectedEof {
            LogError::BadHeader
        } else {
            e.into()
        });
    }
    format::check_header(&header)?;

    let mut out = Scan {
        groups: Vec::new(),
        meta_frames: Vec::new(),
        latest_meta: None,
        good_end: HEADER_LEN,
        torn: None,
    };
    let mut pending: Option<GroupLocation> = None;
    let mut pos = HEADER_LEN;
    let mut payload = Vec::new();

    while pos < file_len {
        if file_len - pos < FRAME_HEADER_LEN {
            out.torn = Some("truncated frame header");
            break;
        }
        let mut head = [0u8; FRAME_HEADER_LEN as usize];
        input.read_exact(&mut head)?;
        let frame = FrameHeader::parse(&head);
        let payload_offset = pos + FRAME_HEADER_LEN;
        if file_len - payload_offset < u64::from(frame.len) {
            out.torn = Some("truncated frame payload");
            break;
        }
        payload.resize(frame.len as usize, 0);
        input.read_exact(&mut payload)?;
        if !frame.verifies(&payload) {
            out.torn = Some("checksum mismatch");
            break;
        }
        let frame_end = payload_offset + u64::from(frame.len);

        match FrameTag::from_u8(frame.tag) {
            Some(FrameTag::Metadata) => {
                if pending.is_some() {
                    out.torn = Some("group without commit");
                    break;
                }
                let Ok(block) = serde_json::from_slice::<MetadataBlock>(&payload) else {
                    out.torn = Some("unreadable metadata frame");
                    break;
                };
                out.meta_frames.push(MetaFrame {
                    offset: pos,
                    schema_version: block.schema_version(),
                    catalog_version: block.catalog_version(),
                });
                out.latest_meta = Some(block);
                out.good_end = frame_end;
            }
            Some(FrameTag::Group) => {
                if pending.is_some() {
                    out.torn = Some("group without commit");
                    break;
                }
                if format::group_index(&payload) != Some(out.groups.len() as u64) {
                    out.torn = Some("group index out of sequence");
                    break;
                }
                pending = Some(GroupLocation {
                    frame_start: pos,
                    payload_offset,
                    payload_len: frame.len,
                });
            }
            Some(FrameTag::Commit) => {
                let committed = <[u8; 8]>::try_from(payload.as_slice())
                    .map(u64::from_le_bytes)
                    .ok();
                let Some(location) = pending.take() else {
                    out.torn = Some("commit without a group");
                    break;
                };
                if committed != Some(out.groups.len() as u64) {
                    out.torn = Some("commit does not match its group");
                    break;
                }
                out.groups.push(location);
                out.good_end = frame_end;
            }
            None => {
                out.torn = Some("unknown frame tag");
                break;
            }
        }
        pos = frame_end;
    }

    if pending.is_some() && out.torn.is_none() {
        out.torn = Some("group without commit");
    }
    Ok(out)
}

fn lock_exclusive(file: &File, path: &Path) -> Result<(), LogError> {
    match file.try_lock() {
        Ok(()) => Ok(()),
        Err(TryLockError::WouldBlock) => Err(LogError::AlreadyOpen {
            path: path.to_path_buf(),
        }),
        Err(TryLockError::Error(e)) => Err(e.into()),
    }
}

// ---------------------------------------------------------------------------
// TimestepLog
// ---------------------------------------------------------------------------

/// Append-only, crash-safe history of timestep snapshots.
///
/// Exactly one `TimestepLog` may hold a file at a time; it takes an exclusive
/// OS lock that is released when the log is dropped.
#[derive(Debug)]
pub struct TimestepLog {
    path: PathBuf,
    file: File,
    options: LogOptions,
    run: RunMetadata,
    schema: Arc<SchemaRegistry>,
    catalog: Arc<EntityCatalog>,
    index: Arc<RwLock<LogIndex>>,
    reader: LogReader,
    /// End of committed data; the next frame is written here.
    end: u64,
    meta_frames: Vec<MetaFrame>,
    recovery: Option<RecoveryReport>,
}

impl TimestepLog {
    /// Create a new log file. Fails if `path` already exists.
    ///
    /// `schema` and `catalog` are shared with the store that produces the
    /// snapshots; declarations made later are persisted before the first
    /// group that may use them.
    pub fn create(
        path: impl AsRef<Path>,
        run: RunMetadata,
        schema: Arc<SchemaRegistry>,
        catalog: Arc<EntityCatalog>,
        options: LogOptions,
    ) -> Result<Self, LogError> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        lock_exclusive(&file, &path)?;
        file.write_all(&format::encode_header())?;

        let index = Arc::new(RwLock::new(LogIndex::default()));
        let reader = LogReader::new(
            &path,
            Arc::clone(&index),
            Arc::clone(&schema),
            Arc::clone(&catalog),
        )?;
        let mut log = Self {
            path,
            file,
            options,
            run,
            schema,
            catalog,
            index,
            reader,
            end: HEADER_LEN,
            meta_frames: Vec::new(),
            recovery: None,
        };
        log.write_metadata()?;
        tracing::info!(path = %log.path.display(), "created timestep log");
        Ok(log)
    }

    /// Open an existing log, verifying every frame.
    ///
    /// The schema registry and catalog are rebuilt from the latest metadata
    /// frame; share them with the store that continues the run.
    ///
    /// # Errors
    ///
    /// [`LogError::AlreadyOpen`] if another writer holds the file,
    /// [`LogError::BadHeader`], [`LogError::Corrupt`], or
    /// [`LogError::PartialWriteDetected`] when recovery is disabled and the
    /// file ends in a staged fragment.
    pub fn open(path: impl AsRef<Path>, options: LogOptions) -> Result<Self, LogError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        lock_exclusive(&file, &path)?;

        let file_len = file.metadata()?.len();
        let scan = scan(&file, file_len)?;
        let staged = file_len - scan.good_end;
        let last_good = (scan.groups.len() as u64).checked_sub(1);

        let recovery = if staged > 0 {
            let reason = scan.torn.unwrap_or("trailing bytes");
            if !options.recover_partial_writes {
                return Err(LogError::PartialWriteDetected {
                    last_good,
                    staged_bytes: staged,
                });
            }
            file.set_len(scan.good_end)?;
            file.sync_all()?;
            tracing::warn!(
                path = %path.display(),
                discarded_bytes = staged,
                last_good = ?last_good,
                reason,
                "discarded staged fragment from log"
            );
            Some(RecoveryReport {
                discarded_bytes: staged,
                last_good,
                reason: reason.to_owned(),
            })
        } else {
            None
        };

        let block = scan.latest_meta.ok_or_else(|| LogError::Corrupt {
            offset: HEADER_LEN,
            reason: "no metadata frame".to_owned(),
        })?;
        let schema = Arc::new(SchemaRegistry::from_history(&block.schema)?);
        let catalog = Arc::new(EntityCatalog::from_names(&block.catalog)?);

        let index = Arc::new(RwLock::new(LogIndex {
            groups: scan.groups,
        }));
        let reader = LogReader::new(
            &path,
            Arc::clone(&index),
            Arc::clone(&schema),
            Arc::clone(&catalog),
        )?;
        tracing::info!(
            path = %path.display(),
            snapshots = last_good.map_or(0, |i| i + 1),
            "opened timestep log"
        );

        Ok(Self {
            path,
            file,
            options,
            run: block.run,
            schema,
            catalog,
            index,
            reader,
            end: scan.good_end,
            meta_frames: scan.meta_frames,
            recovery,
        })
    }

    // -- accessors --------------------------------------------------------------

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn options(&self) -> &LogOptions {
        &self.options
    }

    pub fn run_metadata(&self) -> &RunMetadata {
        &self.run
    }

    pub fn schema(&self) -> &Arc<SchemaRegistry> {
        &self.schema
    }

    pub fn catalog(&self) -> &Arc<EntityCatalog> {
        &self.catalog
    }

    /// What the last [`open`](Self::open) discarded, if anything.
    pub fn recovery(&self) -> Option<&RecoveryReport> {
        self.recovery.as_ref()
    }

    /// A read handle that stays valid (and current) while this log appends.
    pub fn reader(&self) -> LogReader {
        self.reader.clone()
    }

    pub fn highest_index(&self) -> Option<u64> {
        self.index.read().highest()
    }

    pub fn len(&self) -> u64 {
        self.reader.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// See [`LogReader::read`].
    pub fn read(&self, index: u64) -> Result<TimestepSnapshot, LogError> {
        self.reader.read(index)
    }

    /// See [`LogReader::read_as_written`].
    pub fn read_as_written(&self, index: u64) -> Result<TimestepSnapshot, LogError> {
        self.reader.read_as_written(index)
    }

    pub fn read_logs(&self, index: u64) -> Result<Vec<String>, LogError> {
        self.reader.read_logs(index)
    }

    // -- writes -------------------------------------------------------------------

    /// Append the next snapshot.
    ///
    /// # Errors
    ///
    /// [`LogError::OutOfOrderWrite`] unless `snapshot.index` is exactly one
    /// past [`highest_index`](Self::highest_index) (0 for an empty log);
    /// [`LogError::Store`] for kinds or fields the snapshot's catalog and
    /// schema versions do not know. Nothing is written on error.
    pub fn append(&mut self, snapshot: &TimestepSnapshot) -> Result<(), LogError> {
        let expected = self.index.read().groups.len() as u64;
        if snapshot.index != expected {
            return Err(LogError::OutOfOrderWrite {
                expected,
                got: snapshot.index,
            });
        }
        let payload = format::encode_group(
            snapshot,
            &self.schema,
            &self.catalog,
            self.options.compression_level,
        )?;

        let start = self.end;
        if let Err(e) = self.write_group(snapshot.index, &payload) {
            tracing::error!(index = snapshot.index, error = %e, "append failed, rolling back");
            self.meta_frames.retain(|m| m.offset < start);
            self.end = start;
            if let Err(rollback) = self.file.set_len(start) {
                tracing::error!(error = %rollback, "could not discard staged bytes");
            }
            return Err(e);
        }
        tracing::trace!(index = snapshot.index, bytes = payload.len(), "appended snapshot");
        Ok(())
    }

    /// Discard every snapshot after `index`. Returns how many were discarded.
    ///
    /// This is the only destructive operation on a log.
    pub fn truncate_after(&mut self, index: u64) -> Result<u64, LogError> {
        let mut log_index = self.index.write();
        let len = log_index.groups.len() as u64;
        let keep = index.saturating_add(1);
        if keep >= len {
            return Ok(0);
        }
        let cut = log_index.groups[keep as usize].frame_start;
        log_index.groups.truncate(keep as usize);

        self.end = cut;
        self.meta_frames.retain(|m| m.offset < cut);
        self.file.set_len(cut)?;
        self.file.sync_all()?;
        drop(log_index);

        let discarded = len - keep;
        tracing::warn!(
            path = %self.path.display(),
            kept_through = index,
            discarded,
            "truncated timestep log"
        );
        Ok(discarded)
    }

    /// Force all written data to disk.
    pub fn sync(&self) -> Result<(), LogError> {
        self.file.sync_all()?;
        Ok(())
    }

    fn sync_stage(&self) -> Result<(), LogError> {
        if self.options.sync_writes {
            self.file.sync_data()?;
        }
        Ok(())
    }

    fn metadata_stale(&self) -> bool {
        self.meta_frames.last().is_none_or(|m| {
            m.schema_version < self.schema.version() || m.catalog_version < self.catalog.version()
        })
    }

    fn write_metadata(&mut self) -> Result<(), LogError> {
        let block = MetadataBlock::capture(&self.run, &self.schema, &self.catalog);
        let frame = format::encode_frame(FrameTag::Metadata, &serde_json::to_vec(&block)?);
        self.file.seek(SeekFrom::Start(self.end))?;
        self.file.write_all(&frame)?;
        self.sync_stage()?;

        self.meta_frames.push(MetaFrame {
            offset: self.end,
            schema_version: block.schema_version(),
            catalog_version: block.catalog_version(),
        });
        self.end += frame.len() as u64;
        tracing::debug!(
            schema_version = block.schema_version(),
            catalog_version = block.catalog_version(),
            "persisted log metadata"
        );
        Ok(())
    }

    fn write_group(&mut self, index: u64, payload: &[u8]) -> Result<(), LogError> {
        if self.metadata_stale() {
            self.write_metadata()?;
        }
        let group_start = self.end;
        let group = format::encode_frame(FrameTag::Group, payload);
        let commit = format::encode_frame(FrameTag::Commit, &format::commit_payload(index));

        self.file.seek(SeekFrom::Start(group_start))?;
        self.file.write_all(&group)?;
        self.sync_stage()?;
        self.file.write_all(&commit)?;
        self.sync_stage()?;

        self.end = group_start + (group.len() + commit.len()) as u64;
        self.index.write().groups.push(GroupLocation {
            frame_start: group_start,
            payload_offset: group_start + FRAME_HEADER_LEN,
            payload_len: payload.len() as u32,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trophic_store::prelude::*;

    fn new_log(dir: &tempfile::TempDir) -> (TimestepLog, SimulationStore, KindId) {
        let schema = Arc::new(SchemaRegistry::new());
        schema
            .declare_field("producer", "energy", ValueType::Float, Value::Float(10.0))
            .unwrap();
        let catalog = Arc::new(EntityCatalog::new());
        let producer = catalog.id_for("producer");
        let store = SimulationStore::new(
            Arc::clone(&schema),
            Arc::clone(&catalog),
            EnvironmentGrid::filled(4, 4, 1.0),
        );
        let log = TimestepLog::create(
            dir.path().join("t.trophlog"),
            RunMetadata::default(),
            schema,
            catalog,
            LogOptions {
                sync_writes: false,
                ..LogOptions::default()
            },
        )
        .unwrap();
        (log, store, producer)
    }

    #[test]
    fn metadata_is_rewritten_only_when_stale() {
        let dir = tempfile::tempdir().unwrap();
        let (mut log, store, producer) = new_log(&dir);
        assert_eq!(log.meta_frames.len(), 1);

        log.append(&store.snapshot()).unwrap();
        assert_eq!(log.meta_frames.len(), 1);

        store.catalog().id_for("herbivore");
        store.commit_tick(DeltaBuffer::new());
        log.append(&store.snapshot()).unwrap();
        assert_eq!(log.meta_frames.len(), 2);

        store.apply_delta(&[Delta::spawn(producer, 0, 0)]).unwrap();
        store.commit_tick(DeltaBuffer::new());
        log.append(&store.snapshot()).unwrap();
        assert_eq!(log.meta_frames.len(), 2);
    }

    #[test]
    fn truncate_past_the_end_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let (mut log, store, _) = new_log(&dir);
        log.append(&store.snapshot()).unwrap();
        assert_eq!(log.truncate_after(0).unwrap(), 0);
        assert_eq!(log.truncate_after(9).unwrap(), 0);
        assert_eq!(log.highest_index(), Some(0));
    }

    #[test]
    fn append_after_truncate_reuses_the_space() {
        let dir = tempfile::tempdir().unwrap();
        let (mut log, store, _) = new_log(&dir);
        for _ in 0..3 {
            log.append(&store.snapshot()).unwrap();
            store.commit_tick(DeltaBuffer::new());
        }
        let end_after_one = log.index.read().groups[1].frame_start;
        assert_eq!(log.truncate_after(0).unwrap(), 2);
        assert_eq!(log.end, end_after_one);

        store.replace_state(1, store.grid(), Vec::new(), 0).unwrap();
        log.append(&store.snapshot()).unwrap();
        assert_eq!(log.highest_index(), Some(1));
    }
}

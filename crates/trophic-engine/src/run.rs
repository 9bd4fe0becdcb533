//! The simulation run: live store, systems and background persistence.
//!
//! Every timestep the run visits while live is appended to the log exactly
//! once, in order. Snapshots are captured at the start of the tick that leaves
//! them (O(1), copy-on-write) and handed to the writer in batches of
//! `flush_interval`; [`flush`](SimulationRun::flush) captures the current step
//! too and waits until everything is committed.

use std::path::Path;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use trophic_log::format::RunMetadata;
use trophic_log::log::{LogOptions, TimestepLog};
use trophic_log::reader::LogReader;
use trophic_log::LogError;
use trophic_store::catalog::{EntityCatalog, KindId};
use trophic_store::delta::{Delta, DeltaBuffer, DeltaOutcome, TickReport};
use trophic_store::entity::{EntityId, EntityRecord};
use trophic_store::grid::EnvironmentGrid;
use trophic_store::schema::SchemaRegistry;
use trophic_store::snapshot::TimestepSnapshot;
use trophic_store::store::SimulationStore;

use crate::config::RunConfig;
use crate::replay::ReplayState;
use crate::stats::PopulationStats;
use crate::tick::{RegisteredSystem, SystemFn, TickContext, TickDiagnostics};
use crate::writer::BackgroundWriter;
use crate::RunError;

// ---------------------------------------------------------------------------
// SimulationRun
// ---------------------------------------------------------------------------

/// One recorded simulation run.
pub struct SimulationRun {
    pub(crate) store: Arc<SimulationStore>,
    pub(crate) writer: BackgroundWriter,
    pub(crate) state: ReplayState,
    config: RunConfig,
    systems: Vec<RegisteredSystem>,
    /// Snapshots captured but not yet handed to the writer.
    pending: Vec<TimestepSnapshot>,
    /// The next index to be captured for the log.
    pub(crate) next_to_record: u64,
    last_diagnostics: TickDiagnostics,
}

impl SimulationRun {
    /// Start a new run recorded at `path`.
    ///
    /// The store starts at index 0 with a `grid_width x grid_height` grid
    /// filled with `initial_nutrient` and no entities; populate it with
    /// [`apply_delta`](Self::apply_delta) before the first tick. The run
    /// starts live.
    pub fn create(
        path: impl AsRef<Path>,
        config: &RunConfig,
        schema: Arc<SchemaRegistry>,
        catalog: Arc<EntityCatalog>,
    ) -> Result<Self, RunError> {
        let config = config.clone().clamped();
        let run_metadata = RunMetadata {
            created_at_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(0, |d| d.as_millis() as u64),
            seed: Some(config.seed),
            config: serde_json::to_value(&config).map_err(LogError::Metadata)?,
        };
        let log = TimestepLog::create(
            path,
            run_metadata,
            Arc::clone(&schema),
            Arc::clone(&catalog),
            log_options(&config),
        )?;

        let grid = EnvironmentGrid::filled(
            config.grid_width,
            config.grid_height,
            config.initial_nutrient,
        );
        let store = SimulationStore::new(schema, catalog, grid);
        store.set_seed(Some(config.seed));

        tracing::info!(
            path = %log.path().display(),
            seed = config.seed,
            width = config.grid_width,
            height = config.grid_height,
            "created simulation run"
        );
        Self::assemble(log, store, config, ReplayState::Live, 0)
    }

    /// Open a recorded run for replay.
    ///
    /// A non-empty log opens paused at index 0; an empty one opens live at
    /// index 0. The configuration and seed come from the run metadata.
    pub fn open(path: impl AsRef<Path>, options: LogOptions) -> Result<Self, RunError> {
        let log = TimestepLog::open(path, options)?;
        let mut config = RunConfig::from_value(&log.run_metadata().config);
        if let Some(seed) = log.run_metadata().seed {
            config.seed = seed;
        }

        let grid = EnvironmentGrid::filled(
            config.grid_width,
            config.grid_height,
            config.initial_nutrient,
        );
        let store = SimulationStore::new(Arc::clone(log.schema()), Arc::clone(log.catalog()), grid);
        store.set_seed(Some(config.seed));

        let recorded = log.len();
        let state = if recorded > 0 {
            store.restore(&log.read(0)?)?;
            ReplayState::PausedAt(0)
        } else {
            ReplayState::Live
        };
        tracing::info!(
            path = %log.path().display(),
            snapshots = recorded,
            state = ?state,
            "opened simulation run"
        );
        Self::assemble(log, store, config, state, recorded)
    }

    /// Open a recorded run and continue it live from its last step.
    pub fn reopen_for_append(
        path: impl AsRef<Path>,
        options: LogOptions,
    ) -> Result<Self, RunError> {
        let mut run = Self::open(path, options)?;
        if let Some(highest) = run.highest_index() {
            run.jump_to(highest)?;
            run.resume(crate::replay::ForkPolicy::Refuse)?;
        }
        Ok(run)
    }

    fn assemble(
        log: TimestepLog,
        store: SimulationStore,
        config: RunConfig,
        state: ReplayState,
        next_to_record: u64,
    ) -> Result<Self, RunError> {
        Ok(Self {
            store: Arc::new(store),
            writer: BackgroundWriter::spawn(log)?,
            state,
            config,
            systems: Vec::new(),
            pending: Vec::new(),
            next_to_record,
            last_diagnostics: TickDiagnostics::default(),
        })
    }

    // -- systems ----------------------------------------------------------------

    /// Register a system. Systems run in registration order.
    ///
    /// # Panics
    ///
    /// Panics if a system with the same name is already registered.
    pub fn add_system(&mut self, name: &str, func: SystemFn) {
        assert!(
            !self.systems.iter().any(|s| s.name == name),
            "duplicate system name: {name:?}"
        );
        self.systems.push(RegisteredSystem {
            name: name.to_owned(),
            func,
        });
    }

    pub fn system_names(&self) -> Vec<&str> {
        self.systems.iter().map(|s| s.name.as_str()).collect()
    }

    // -- ticking ------------------------------------------------------------------

    /// Run every system once and advance the store by one index.
    ///
    /// # Errors
    ///
    /// [`RunError::NotLive`] while paused or scrubbing;
    /// [`RunError::WriterStopped`] if persistence has failed.
    pub fn tick(&mut self) -> Result<TickReport, RunError> {
        self.require_live()?;
        let tick_start = Instant::now();
        let snapshot = self.capture_current();

        let mut buffer = DeltaBuffer::new();
        let mut ctx = TickContext::new(self.config.seed, snapshot.index + 1);
        let mut system_times = Vec::with_capacity(self.systems.len());
        for system in &self.systems {
            let started = Instant::now();
            (system.func)(&snapshot, &mut buffer, &mut ctx);
            system_times.push((system.name.clone(), started.elapsed()));
        }

        let commit_start = Instant::now();
        let report = self.store.commit_tick(buffer);
        let commit_time = commit_start.elapsed();

        self.last_diagnostics = TickDiagnostics {
            system_times,
            commit_time,
            total_time: tick_start.elapsed(),
            deltas_applied: report.applied,
            deltas_rejected: report.rejected.len(),
        };

        if self.pending.len() as u64 >= self.config.flush_interval {
            self.submit_pending()?;
        }
        Ok(report)
    }

    /// Run `count` ticks. Returns the total number of applied deltas.
    pub fn run_ticks(&mut self, count: u64) -> Result<usize, RunError> {
        let mut applied = 0;
        for _ in 0..count {
            applied += self.tick()?.applied;
        }
        Ok(applied)
    }

    /// Capture the current step if it has not been recorded yet.
    fn capture_current(&mut self) -> TimestepSnapshot {
        let snapshot = self.store.snapshot();
        if snapshot.index == self.next_to_record {
            self.pending.push(snapshot.clone());
            self.next_to_record += 1;
        }
        snapshot
    }

    fn submit_pending(&mut self) -> Result<(), RunError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.pending);
        tracing::trace!(
            first = batch[0].index,
            snapshots = batch.len(),
            "handing batch to writer"
        );
        self.writer.submit(batch)
    }

    // -- direct edits -------------------------------------------------------------

    /// Apply a batch of deltas to the current step, all or nothing (e.g. to
    /// seed the initial population before the first tick).
    ///
    /// # Errors
    ///
    /// [`RunError::NotLive`] while paused or scrubbing, since a recorded step
    /// is never edited; [`RunError::StepAlreadyRecorded`] if the current step
    /// was already captured for the log (after a [`flush`](Self::flush));
    /// [`RunError::Store`] if the batch fails validation.
    pub fn apply_delta(&mut self, changes: &[Delta]) -> Result<DeltaOutcome, RunError> {
        self.require_editable()?;
        Ok(self.store.apply_delta(changes)?)
    }

    /// Append a debug message to the current step. Same rules as
    /// [`apply_delta`](Self::apply_delta).
    pub fn log_event(&mut self, message: &str) -> Result<(), RunError> {
        self.require_editable()?;
        self.store.log_event(message);
        Ok(())
    }

    /// The current step may change only while live and not yet captured.
    fn require_editable(&self) -> Result<(), RunError> {
        self.require_live()?;
        let index = self.store.current_index();
        if index < self.next_to_record {
            return Err(RunError::StepAlreadyRecorded { index });
        }
        Ok(())
    }

    // -- persistence --------------------------------------------------------------

    /// Persist every visited step, including the current one when live, and
    /// wait until it is committed.
    pub fn flush(&mut self) -> Result<(), RunError> {
        if self.state == ReplayState::Live {
            self.capture_current();
        }
        self.submit_pending()?;
        self.writer.drain()
    }

    /// [`flush`](Self::flush), then force the log to disk.
    pub fn sync(&mut self) -> Result<(), RunError> {
        self.flush()?;
        self.writer.sync()
    }

    /// Flush and close the log.
    pub fn close(mut self) -> Result<(), RunError> {
        self.flush()?;
        let log = self.writer.close()?;
        log.sync()?;
        tracing::info!(snapshots = log.len(), "closed simulation run");
        Ok(())
    }

    /// Stop without persisting anything not yet committed.
    pub fn discard(self) {
        tracing::info!(
            dropped = self.pending.len(),
            "discarding simulation run"
        );
        self.writer.discard();
    }

    // -- accessors --------------------------------------------------------------

    /// An immutable view of the current step.
    pub fn snapshot(&self) -> TimestepSnapshot {
        self.store.snapshot()
    }

    pub fn entity(&self, id: EntityId) -> Option<EntityRecord> {
        self.store.entity(id)
    }

    pub fn entity_count(&self) -> usize {
        self.store.entity_count()
    }

    pub fn entities_of_kind(&self, kind: KindId) -> Vec<EntityRecord> {
        self.store.entities_of_kind(kind)
    }

    pub fn grid(&self) -> EnvironmentGrid {
        self.store.grid()
    }

    pub fn schema(&self) -> &Arc<SchemaRegistry> {
        self.store.schema()
    }

    pub fn catalog(&self) -> &Arc<EntityCatalog> {
        self.store.catalog()
    }

    /// A read handle on the log; sees every committed index.
    pub fn reader(&self) -> LogReader {
        self.writer.reader().clone()
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn current_index(&self) -> u64 {
        self.store.current_index()
    }

    /// Highest committed index. Snapshots still queued for the writer are not
    /// included until [`flush`](Self::flush).
    pub fn highest_index(&self) -> Option<u64> {
        self.writer.reader().highest_index()
    }

    pub fn replay_state(&self) -> ReplayState {
        self.state
    }

    pub fn last_diagnostics(&self) -> &TickDiagnostics {
        &self.last_diagnostics
    }

    /// Population statistics of the current step.
    pub fn stats(&self) -> PopulationStats {
        PopulationStats::from_snapshot(&self.store.snapshot(), self.store.catalog())
    }

    pub(crate) fn require_live(&self) -> Result<(), RunError> {
        match self.state {
            ReplayState::Live => Ok(()),
            state => Err(RunError::NotLive { state }),
        }
    }
}

fn log_options(config: &RunConfig) -> LogOptions {
    LogOptions {
        recover_partial_writes: true,
        sync_writes: config.sync_writes,
        compression_level: config.zstd_level,
    }
}

//! Time travel over a recorded run.
//!
//! A run is always in one of three states:
//!
//! - [`ReplayState::Live`]: the tick loop may advance the store.
//! - [`ReplayState::PausedAt`]: the store shows a recorded step; stepping
//!   moves one index at a time.
//! - [`ReplayState::Scrubbing`]: a burst of random-access reads (a slider
//!   drag); ending the scrub leaves the run paused at the last step loaded.
//!
//! Every transition substitutes the store's whole state with one committed
//! snapshot, so the store never mixes the grid of one step with the entities
//! of another. Resuming from a step behind the end of the log forks the
//! timeline; [`ForkPolicy`] makes discarding the old future an explicit
//! decision.

use trophic_log::LogError;

use crate::run::SimulationRun;
use crate::RunError;

/// Where a run currently is on its timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayState {
    Live,
    PausedAt(u64),
    Scrubbing {
        /// Step the scrub started from.
        origin: u64,
        /// Step currently loaded.
        at: u64,
    },
}

/// What [`SimulationRun::resume`] does when the paused step is not the last
/// recorded one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkPolicy {
    /// Discard every recorded step after the paused one and continue live.
    Truncate,
    /// Fail with [`RunError::WouldDiscardHistory`] and stay paused.
    Refuse,
}

impl SimulationRun {
    /// Stop ticking and hold the current step.
    ///
    /// Everything visited so far, including the current step, is committed
    /// before the run is paused.
    pub fn pause(&mut self) -> Result<u64, RunError> {
        self.require_live()?;
        self.flush()?;
        let index = self.store.current_index();
        self.state = ReplayState::PausedAt(index);
        tracing::debug!(index, "paused");
        Ok(index)
    }

    /// Load the next recorded step.
    ///
    /// # Errors
    ///
    /// [`LogError::IndexNotFound`] at the end of the log; the run stays where
    /// it was.
    pub fn step_forward(&mut self) -> Result<u64, RunError> {
        let at = self.paused_index()?;
        let next = at + 1;
        self.load(next)?;
        self.state = ReplayState::PausedAt(next);
        Ok(next)
    }

    /// Load the previous recorded step.
    ///
    /// # Errors
    ///
    /// [`LogError::IndexNotFound`] at index 0; the run stays where it was.
    pub fn step_back(&mut self) -> Result<u64, RunError> {
        let at = self.paused_index()?;
        let prev = at
            .checked_sub(1)
            .ok_or(LogError::IndexNotFound { index: at })?;
        self.load(prev)?;
        self.state = ReplayState::PausedAt(prev);
        Ok(prev)
    }

    /// Enter scrubbing. A live run is paused first.
    pub fn begin_scrub(&mut self) -> Result<(), RunError> {
        let origin = match self.state {
            ReplayState::Scrubbing { .. } => return Ok(()),
            ReplayState::Live => self.pause()?,
            ReplayState::PausedAt(index) => index,
        };
        self.state = ReplayState::Scrubbing { origin, at: origin };
        Ok(())
    }

    /// Load any recorded step while scrubbing.
    pub fn scrub_to(&mut self, index: u64) -> Result<(), RunError> {
        let ReplayState::Scrubbing { origin, .. } = self.state else {
            return Err(RunError::NotPaused { state: self.state });
        };
        self.load(index)?;
        self.state = ReplayState::Scrubbing { origin, at: index };
        Ok(())
    }

    /// Leave scrubbing, paused at the last step loaded.
    pub fn end_scrub(&mut self) -> Result<u64, RunError> {
        let ReplayState::Scrubbing { at, .. } = self.state else {
            return Err(RunError::NotPaused { state: self.state });
        };
        self.state = ReplayState::PausedAt(at);
        Ok(at)
    }

    /// Jump straight to a recorded step from any state; the run ends up
    /// paused there. On error the run is paused at the step it was on.
    pub fn jump_to(&mut self, index: u64) -> Result<(), RunError> {
        self.begin_scrub()?;
        let loaded = self.scrub_to(index);
        self.end_scrub()?;
        loaded
    }

    /// Continue live from the paused step.
    ///
    /// If steps beyond it are recorded, `policy` decides: `Truncate` discards
    /// them (after every queued write has landed), `Refuse` returns
    /// [`RunError::WouldDiscardHistory`] and leaves the run paused.
    pub fn resume(&mut self, policy: ForkPolicy) -> Result<(), RunError> {
        let at = self.paused_index()?;
        self.writer.drain()?;

        if let Some(highest) = self.writer.reader().highest_index() {
            if at < highest {
                match policy {
                    ForkPolicy::Refuse => {
                        return Err(RunError::WouldDiscardHistory { at, highest });
                    }
                    ForkPolicy::Truncate => {
                        let discarded = self.writer.truncate_after(at)?;
                        tracing::warn!(
                            at,
                            discarded_from = at + 1,
                            discarded_through = highest,
                            discarded,
                            "forked timeline, discarded recorded future"
                        );
                    }
                }
            }
        }

        self.next_to_record = at + 1;
        self.state = ReplayState::Live;
        tracing::debug!(index = at, "resumed live");
        Ok(())
    }

    fn paused_index(&self) -> Result<u64, RunError> {
        match self.state {
            ReplayState::PausedAt(index) => Ok(index),
            state => Err(RunError::NotPaused { state }),
        }
    }

    /// Substitute the store's state with recorded step `index`.
    fn load(&mut self, index: u64) -> Result<(), RunError> {
        let snapshot = self.writer.reader().read(index)?;
        self.store.restore(&snapshot)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use trophic_store::prelude::*;

    use super::*;
    use crate::config::RunConfig;

    fn run_with(dir: &tempfile::TempDir, ticks: u64) -> SimulationRun {
        let config = RunConfig {
            flush_interval: 3,
            sync_writes: false,
            ..RunConfig::default()
        };
        let mut run = SimulationRun::create(
            dir.path().join("r.trophlog"),
            &config,
            Arc::new(SchemaRegistry::new()),
            Arc::new(EntityCatalog::new()),
        )
        .unwrap();
        run.add_system("drain", |snap, deltas, _| {
            let v = snap.grid.get(1, 1).unwrap_or(0.0);
            deltas.set_cell(1, 1, v - 0.01);
        });
        run.run_ticks(ticks).unwrap();
        run
    }

    #[test]
    fn tick_requires_live() {
        let dir = tempfile::tempdir().unwrap();
        let mut run = run_with(&dir, 2);
        run.pause().unwrap();
        assert!(matches!(
            run.tick(),
            Err(RunError::NotLive {
                state: ReplayState::PausedAt(2)
            })
        ));
    }

    #[test]
    fn stepping_off_either_end_keeps_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut run = run_with(&dir, 2);
        run.pause().unwrap();

        assert!(matches!(
            run.step_forward(),
            Err(RunError::Log(LogError::IndexNotFound { index: 3 }))
        ));
        assert_eq!(run.replay_state(), ReplayState::PausedAt(2));

        run.jump_to(0).unwrap();
        assert!(matches!(
            run.step_back(),
            Err(RunError::Log(LogError::IndexNotFound { .. }))
        ));
        assert_eq!(run.replay_state(), ReplayState::PausedAt(0));
        assert_eq!(run.current_index(), 0);
    }

    #[test]
    fn scrub_ends_where_it_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let mut run = run_with(&dir, 8);
        run.begin_scrub().unwrap();
        assert_eq!(
            run.replay_state(),
            ReplayState::Scrubbing { origin: 8, at: 8 }
        );
        for i in [5, 1, 7, 3] {
            run.scrub_to(i).unwrap();
        }
        assert!(run.scrub_to(42).is_err());
        assert_eq!(run.end_scrub().unwrap(), 3);
        assert_eq!(run.current_index(), 3);
    }

    #[test]
    fn failed_jump_stays_put() {
        let dir = tempfile::tempdir().unwrap();
        let mut run = run_with(&dir, 4);
        run.pause().unwrap();
        run.step_back().unwrap();
        assert!(run.jump_to(99).is_err());
        assert_eq!(run.replay_state(), ReplayState::PausedAt(3));
        assert_eq!(run.current_index(), 3);
    }

    #[test]
    fn resume_at_the_end_needs_no_fork() {
        let dir = tempfile::tempdir().unwrap();
        let mut run = run_with(&dir, 4);
        run.pause().unwrap();
        run.resume(ForkPolicy::Refuse).unwrap();
        run.tick().unwrap();
        run.flush().unwrap();
        assert_eq!(run.highest_index(), Some(5));
    }

    #[test]
    fn resume_requires_pause() {
        let dir = tempfile::tempdir().unwrap();
        let mut run = run_with(&dir, 1);
        assert!(matches!(
            run.resume(ForkPolicy::Truncate),
            Err(RunError::NotPaused {
                state: ReplayState::Live
            })
        ));
        assert!(matches!(run.end_scrub(), Err(RunError::NotPaused { .. })));
    }
}

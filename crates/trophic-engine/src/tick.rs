//! Per-tick system execution.
//!
//! Every tick, the registered systems run in registration order. Each one
//! receives the immutable snapshot of the current step, the shared
//! [`DeltaBuffer`] where it queues changes, and a [`TickContext`]. The run
//! then commits the buffer (FIFO) and the store advances one index.
//!
//! Randomness comes only from [`TickContext::rng`], which is seeded from the
//! run seed and the index being produced, so re-simulating a step after a
//! time-travel jump yields the same random draws.

use std::time::Duration;

use rand::SeedableRng;
use rand_pcg::Pcg64;
use trophic_store::delta::DeltaBuffer;
use trophic_store::snapshot::TimestepSnapshot;

// ---------------------------------------------------------------------------
// TickContext
// ---------------------------------------------------------------------------

/// Per-tick services handed to every system.
#[derive(Debug)]
pub struct TickContext {
    index: u64,
    rng: Pcg64,
}

impl TickContext {
    /// Context for the tick that produces step `index`.
    pub fn new(seed: u64, index: u64) -> Self {
        Self {
            index,
            rng: Pcg64::seed_from_u64(tick_seed(seed, index)),
        }
    }

    /// The index the current tick produces.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Deterministic generator for this tick.
    pub fn rng(&mut self) -> &mut Pcg64 {
        &mut self.rng
    }
}

/// Mix the run seed with a step index (splitmix64 finalizer).
fn tick_seed(seed: u64, index: u64) -> u64 {
    let mut z = seed ^ index.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

// ---------------------------------------------------------------------------
// Systems
// ---------------------------------------------------------------------------

/// A system reads the current step and queues deltas for the next one.
pub type SystemFn = fn(&TimestepSnapshot, &mut DeltaBuffer, &mut TickContext);

#[derive(Debug)]
pub(crate) struct RegisteredSystem {
    pub name: String,
    pub func: SystemFn,
}

// ---------------------------------------------------------------------------
// TickDiagnostics
// ---------------------------------------------------------------------------

/// Timing diagnostics for the last tick.
#[derive(Debug, Clone, Default)]
pub struct TickDiagnostics {
    /// Wall-clock time per system, in execution order.
    pub system_times: Vec<(String, Duration)>,
    /// Time spent committing the delta buffer.
    pub commit_time: Duration,
    /// Total time for the tick.
    pub total_time: Duration,
    pub deltas_applied: usize,
    pub deltas_rejected: usize,
}

#[cfg(test)]
mod tests {
    use rand::Rng;

    use super::*;

    #[test]
    fn same_seed_and_index_repeat() {
        let a: Vec<u32> = {
            let mut ctx = TickContext::new(7, 12);
            (0..4).map(|_| ctx.rng().gen()).collect()
        };
        let b: Vec<u32> = {
            let mut ctx = TickContext::new(7, 12);
            (0..4).map(|_| ctx.rng().gen()).collect()
        };
        assert_eq!(a, b);
    }

    #[test]
    fn neighbouring_indices_differ() {
        let mut first = TickContext::new(7, 1);
        let mut second = TickContext::new(7, 2);
        assert_ne!(first.rng().gen::<u64>(), second.rng().gen::<u64>());
        assert_eq!(second.index(), 2);
    }
}

//! Counter-based history substreams
//!
//! A sequential generator would have to replay every prior history to
//! position itself at history N, which rules out restart-from-N. Instead
//! each history gets a counter-based substream: the substream key is a
//! splitmix64 mix of (master seed, history index), and each draw finalizes
//! (key + counter). The mapping is a pure function of its inputs.
//!
//! # Determinism
//!
//! Same (seed, index) → same substream, on any worker, on any restart.
//! This is CRITICAL for:
//! - Exactly-once semantics (reissuing a failed batch is idempotent)
//! - Resuming at an arbitrary history offset
//! - Debugging (replay one history in isolation)

use serde::{Deserialize, Serialize};

use crate::core::HistoryIndex;
use thiserror::Error;

/// Errors raised by substream allocation
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RngError {
    /// A history index at or beyond the configured total was requested.
    /// This is a scheduler bug, not an operator error.
    #[error("history index {index} is out of range (total histories: {total})")]
    OutOfRange { index: u64, total: u64 },
}

/// Allocates one independent substream per history index
///
/// The allocator itself is stateless apart from its configuration: it holds
/// no counter, so there is nothing to replay or checkpoint beyond the
/// master seed.
///
/// # Example
/// ```
/// use particle_simulator_core_rs::SubstreamAllocator;
///
/// let allocator = SubstreamAllocator::new(12345, 1000);
/// let mut a = allocator.substream_for(7).unwrap();
/// let mut b = allocator.substream_for(7).unwrap();
/// assert_eq!(a.next_u64(), b.next_u64());
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SubstreamAllocator {
    master_seed: u64,
    total_histories: u64,
}

impl SubstreamAllocator {
    pub fn new(master_seed: u64, total_histories: u64) -> Self {
        Self {
            master_seed,
            total_histories,
        }
    }

    /// Derive the substream for one history
    ///
    /// Pure function of (master seed, index). Indices at or beyond the
    /// total are rejected with [`RngError::OutOfRange`].
    pub fn substream_for(&self, history: HistoryIndex) -> Result<HistorySubstream, RngError> {
        if history >= self.total_histories {
            return Err(RngError::OutOfRange {
                index: history,
                total: self.total_histories,
            });
        }
        Ok(HistorySubstream::new(derive_key(self.master_seed, history)))
    }

    pub fn master_seed(&self) -> u64 {
        self.master_seed
    }

    pub fn total_histories(&self) -> u64 {
        self.total_histories
    }
}

/// Mix the master seed and history index into a substream key
///
/// splitmix64 finalizer over `seed ^ (index * GOLDEN_GAMMA)`. The multiply
/// spreads adjacent indices across the key space before finalization, so
/// neighbouring histories do not share low-bit structure.
fn derive_key(master_seed: u64, history: u64) -> u64 {
    let mut z = master_seed ^ history.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Independent random stream owned by exactly one in-flight history
///
/// Counter-based: draw i is a finalization of (key + i), never a function
/// of hidden shared state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistorySubstream {
    key: u64,
    counter: u64,
}

impl HistorySubstream {
    fn new(key: u64) -> Self {
        Self { key, counter: 0 }
    }

    /// Next raw 64-bit draw
    pub fn next_u64(&mut self) -> u64 {
        self.counter = self.counter.wrapping_add(1);
        let mut z = self.key.wrapping_add(self.counter);
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }

    /// Uniform f64 in `[0.0, 1.0)` using the top 53 bits
    pub fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 * (1.0 / ((1u64 << 53) as f64))
    }

    /// Uniform f64 in `(0.0, 1.0]`, safe as a `ln()` argument
    pub fn next_f64_open(&mut self) -> f64 {
        1.0 - self.next_f64()
    }
}

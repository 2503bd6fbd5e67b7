//! Run state
//!
//! Process-wide progress record for one simulation run. Exclusively owned
//! by the simulation manager; every other component receives either a
//! read-only view or a narrow mutation right (the event handler, for
//! example, only ever appends to bins — it never touches this struct).
//!
//! # Critical Invariants
//!
//! 1. `completed_histories` only ever increases, and only via
//!    `record_completed` when the scheduler confirms a batch
//! 2. `completed_histories <= total_histories` at all times
//! 3. `durability_degraded` is sticky: once set it stays set for the run

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Progress record for one simulation run
///
/// # Example
/// ```
/// use particle_simulator_core_rs::RunState;
///
/// let mut run = RunState::new(1000);
/// assert_eq!(run.completed_histories(), 0);
///
/// run.record_completed(250);
/// assert_eq!(run.remaining_histories(), 750);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    /// Unique identifier for this run (preserved across restarts)
    run_id: Uuid,

    /// Total number of histories the run must process
    total_histories: u64,

    /// Histories confirmed complete by the scheduler
    completed_histories: u64,

    /// Path of the most recently published checkpoint, if any
    latest_checkpoint: Option<PathBuf>,

    /// True when a checkpoint write was abandoned after bounded retries.
    /// The run keeps going, but a crash would resume from an older
    /// checkpoint.
    durability_degraded: bool,
}

impl RunState {
    /// Create the state for a fresh run starting at history 0
    pub fn new(total_histories: u64) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            total_histories,
            completed_histories: 0,
            latest_checkpoint: None,
            durability_degraded: false,
        }
    }

    /// Reconstruct the state recorded in a checkpoint
    ///
    /// The run id is carried over so that rendezvous files written after a
    /// restart remain attributable to the original run.
    pub fn resume(run_id: Uuid, total_histories: u64, completed_histories: u64) -> Self {
        Self {
            run_id,
            total_histories,
            completed_histories,
            latest_checkpoint: None,
            durability_degraded: false,
        }
    }

    /// Record `count` newly completed histories
    pub fn record_completed(&mut self, count: u64) {
        self.completed_histories = (self.completed_histories + count).min(self.total_histories);
    }

    /// Record a successfully published checkpoint
    pub fn record_checkpoint(&mut self, path: &Path) {
        self.latest_checkpoint = Some(path.to_path_buf());
    }

    /// Flag the run as having no recent durable checkpoint
    pub fn mark_durability_degraded(&mut self) {
        self.durability_degraded = true;
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn total_histories(&self) -> u64 {
        self.total_histories
    }

    pub fn completed_histories(&self) -> u64 {
        self.completed_histories
    }

    pub fn remaining_histories(&self) -> u64 {
        self.total_histories - self.completed_histories
    }

    pub fn latest_checkpoint(&self) -> Option<&Path> {
        self.latest_checkpoint.as_deref()
    }

    pub fn durability_degraded(&self) -> bool {
        self.durability_degraded
    }
}

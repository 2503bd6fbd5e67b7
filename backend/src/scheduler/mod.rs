//! History scheduler
//!
//! Partitions the global history range `[0, total_histories)` into batches,
//! tracks which batches are in flight, and accounts for completed
//! histories. Exactly-once guarantees live here:
//!
//! 1. Two batches never overlap — `next_history_index` only moves forward
//! 2. `completed_histories` advances only when an outstanding batch id is
//!    confirmed, so a stale report from a failed worker cannot double-count
//! 3. A failed batch is returned to the reissue queue untouched; reissue is
//!    idempotent because RNG substreams derive from history indices, not
//!    from workers
//!
//! # State machine
//!
//! ```text
//! Idle --start()--> Dispatching --exhausted, batches in flight--> Draining
//!                        |                                            |
//!                        +---exhausted, nothing in flight---> Complete <-- last batch reports
//! ```

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::HistoryIndex;

/// Errors raised by the scheduler
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    /// Resume offset beyond the configured total. Programming-error class:
    /// a checkpoint can only record offsets the scheduler itself produced.
    #[error("resume offset {offset} is out of range (total histories: {total})")]
    OutOfRange { offset: u64, total: u64 },

    /// Completion or failure reported for a batch that is not outstanding
    #[error("batch {0} is not outstanding (already completed or reissued)")]
    UnknownBatch(u64),

    /// Operation not permitted in the current state
    #[error("operation not valid in scheduler state {state:?}")]
    InvalidState { state: SchedulerState },

    #[error("max_batch_size must be positive")]
    InvalidBatchSize,
}

/// Scheduler lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulerState {
    /// Constructed, not yet started
    Idle,
    /// Histories remain to be issued
    Dispatching,
    /// Every history issued; waiting on in-flight batches
    Draining,
    /// All histories confirmed complete
    Complete,
}

/// Half-open range of history indices `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRange {
    pub start: HistoryIndex,
    pub end: HistoryIndex,
}

impl HistoryRange {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// A batch handed to a worker, tracked until it reports back
#[derive(Debug, Clone)]
pub struct IssuedBatch {
    pub batch_id: u64,
    pub worker_id: usize,
    pub range: HistoryRange,
    /// Wall-clock issue time, used for deadline checks
    pub issued_at: Instant,
    /// How many times this range has been reissued after a failure
    pub reissues: u32,
}

/// Scheduler for the global history range
///
/// # Example
/// ```
/// use particle_simulator_core_rs::scheduler::HistoryScheduler;
///
/// let mut scheduler = HistoryScheduler::new(100, 0).unwrap();
/// scheduler.start().unwrap();
///
/// let batch = scheduler.next_batch(0, 10).unwrap().unwrap();
/// assert_eq!((batch.range.start, batch.range.end), (0, 10));
///
/// scheduler.complete_batch(batch.batch_id).unwrap();
/// assert_eq!(scheduler.completed_histories(), 10);
/// ```
#[derive(Debug)]
pub struct HistoryScheduler {
    total_histories: u64,
    next_history_index: u64,
    completed_histories: u64,
    state: SchedulerState,
    outstanding: HashMap<u64, IssuedBatch>,
    /// Failed batches awaiting reissue, with their reissue counts
    returned: VecDeque<(HistoryRange, u32)>,
    next_batch_id: u64,
}

impl HistoryScheduler {
    /// Create a scheduler resuming at `resume_offset` (0 for a fresh run)
    pub fn new(total_histories: u64, resume_offset: u64) -> Result<Self, SchedulerError> {
        if resume_offset > total_histories {
            return Err(SchedulerError::OutOfRange {
                offset: resume_offset,
                total: total_histories,
            });
        }
        Ok(Self {
            total_histories,
            next_history_index: resume_offset,
            completed_histories: resume_offset,
            state: SchedulerState::Idle,
            outstanding: HashMap::new(),
            returned: VecDeque::new(),
            next_batch_id: 0,
        })
    }

    /// Idle → Dispatching
    pub fn start(&mut self) -> Result<(), SchedulerError> {
        if self.state != SchedulerState::Idle {
            return Err(SchedulerError::InvalidState { state: self.state });
        }
        self.state = SchedulerState::Dispatching;
        Ok(())
    }

    /// Hand the next unclaimed batch to `worker_id`
    ///
    /// Failed batches awaiting reissue take precedence over fresh ranges.
    /// Returns `None` once there is nothing left to issue; at that point
    /// the state has advanced to Draining (batches in flight) or Complete.
    pub fn next_batch(
        &mut self,
        worker_id: usize,
        max_batch_size: u64,
    ) -> Result<Option<IssuedBatch>, SchedulerError> {
        if max_batch_size == 0 {
            return Err(SchedulerError::InvalidBatchSize);
        }
        match self.state {
            SchedulerState::Dispatching | SchedulerState::Draining => {}
            // An exhausted scheduler keeps answering "nothing left"
            SchedulerState::Complete => return Ok(None),
            state => return Err(SchedulerError::InvalidState { state }),
        }

        if let Some((range, reissues)) = self.returned.pop_front() {
            let batch = self.issue(range, worker_id, reissues);
            self.settle_dispatch_state();
            return Ok(Some(batch));
        }

        if self.next_history_index < self.total_histories {
            let end = (self.next_history_index + max_batch_size).min(self.total_histories);
            let range = HistoryRange {
                start: self.next_history_index,
                end,
            };
            self.next_history_index = end;
            let batch = self.issue(range, worker_id, 0);
            self.settle_dispatch_state();
            return Ok(Some(batch));
        }

        self.state = if self.outstanding.is_empty() {
            SchedulerState::Complete
        } else {
            SchedulerState::Draining
        };
        Ok(None)
    }

    fn issue(&mut self, range: HistoryRange, worker_id: usize, reissues: u32) -> IssuedBatch {
        let batch = IssuedBatch {
            batch_id: self.next_batch_id,
            worker_id,
            range,
            issued_at: Instant::now(),
            reissues,
        };
        self.next_batch_id += 1;
        self.outstanding.insert(batch.batch_id, batch.clone());
        batch
    }

    /// Move to Draining as soon as every history has been issued
    fn settle_dispatch_state(&mut self) {
        if self.exhausted() && !self.outstanding.is_empty() {
            self.state = SchedulerState::Draining;
        }
    }

    fn exhausted(&self) -> bool {
        self.next_history_index == self.total_histories && self.returned.is_empty()
    }

    /// Confirm a batch complete; returns the histories it covered
    ///
    /// Unknown ids are rejected — this is how stale reports from workers
    /// declared failed are kept out of the completed count.
    pub fn complete_batch(&mut self, batch_id: u64) -> Result<u64, SchedulerError> {
        let batch = self
            .outstanding
            .remove(&batch_id)
            .ok_or(SchedulerError::UnknownBatch(batch_id))?;
        let histories = batch.range.len();
        self.completed_histories += histories;

        if self.exhausted() && self.outstanding.is_empty() {
            self.state = SchedulerState::Complete;
        }
        Ok(histories)
    }

    /// Return a batch to the reissue queue after its worker was declared
    /// failed; returns the new reissue count for escalation decisions
    pub fn fail_batch(&mut self, batch_id: u64) -> Result<u32, SchedulerError> {
        let batch = self
            .outstanding
            .remove(&batch_id)
            .ok_or(SchedulerError::UnknownBatch(batch_id))?;
        let reissues = batch.reissues + 1;
        self.returned.push_back((batch.range, reissues));
        if self.state == SchedulerState::Draining {
            self.state = SchedulerState::Dispatching;
        }
        Ok(reissues)
    }

    /// Batch ids that have been in flight longer than `deadline`
    pub fn overdue_batches(&self, deadline: Duration) -> Vec<u64> {
        self.outstanding
            .values()
            .filter(|batch| batch.issued_at.elapsed() >= deadline)
            .map(|batch| batch.batch_id)
            .collect()
    }

    /// Worker that currently holds an outstanding batch
    pub fn batch_worker(&self, batch_id: u64) -> Option<usize> {
        self.outstanding.get(&batch_id).map(|b| b.worker_id)
    }

    /// Range covered by an outstanding batch
    pub fn batch_range(&self, batch_id: u64) -> Option<HistoryRange> {
        self.outstanding.get(&batch_id).map(|b| b.range)
    }

    /// True while failed batches are waiting to be reissued
    pub fn reissue_pending(&self) -> bool {
        !self.returned.is_empty()
    }

    /// No batch in flight and nothing awaiting reissue — the state a
    /// checkpoint must be taken in, so that `next_history_index` is a
    /// clean resume frontier
    pub fn is_quiescent(&self) -> bool {
        self.outstanding.is_empty() && self.returned.is_empty()
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn is_complete(&self) -> bool {
        self.state == SchedulerState::Complete
    }

    pub fn total_histories(&self) -> u64 {
        self.total_histories
    }

    pub fn next_history_index(&self) -> u64 {
        self.next_history_index
    }

    pub fn completed_histories(&self) -> u64 {
        self.completed_histories
    }

    pub fn outstanding_count(&self) -> usize {
        self.outstanding.len()
    }
}

/// Deterministic contiguous near-even partition of `[offset, total)`
///
/// Used when the worker count is fixed and known up front: every worker
/// gets a deterministically assigned contiguous range, which keeps the
/// index-derived substream property directly testable. Workers beyond the
/// remaining history count receive empty ranges.
pub fn plan_static_partition(
    total_histories: u64,
    resume_offset: u64,
    workers: usize,
) -> Vec<HistoryRange> {
    let remaining = total_histories.saturating_sub(resume_offset);
    let workers_u64 = workers as u64;
    let base = if workers == 0 { 0 } else { remaining / workers_u64 };
    let extra = if workers == 0 { 0 } else { remaining % workers_u64 };

    let mut ranges = Vec::with_capacity(workers);
    let mut cursor = resume_offset;
    for worker in 0..workers_u64 {
        let len = base + if worker < extra { 1 } else { 0 };
        ranges.push(HistoryRange {
            start: cursor,
            end: cursor + len,
        });
        cursor += len;
    }
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resume_offset_beyond_total_rejected() {
        assert_eq!(
            HistoryScheduler::new(100, 101).unwrap_err(),
            SchedulerError::OutOfRange {
                offset: 101,
                total: 100
            }
        );
    }

    #[test]
    fn test_next_batch_before_start_rejected() {
        let mut scheduler = HistoryScheduler::new(100, 0).unwrap();
        assert!(matches!(
            scheduler.next_batch(0, 10),
            Err(SchedulerError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_batches_are_contiguous_and_disjoint() {
        let mut scheduler = HistoryScheduler::new(25, 0).unwrap();
        scheduler.start().unwrap();

        let mut covered = Vec::new();
        while let Some(batch) = scheduler.next_batch(0, 10).unwrap() {
            covered.push(batch.range);
            scheduler.complete_batch(batch.batch_id).unwrap();
        }

        assert_eq!(
            covered,
            vec![
                HistoryRange { start: 0, end: 10 },
                HistoryRange { start: 10, end: 20 },
                HistoryRange { start: 20, end: 25 },
            ]
        );
        assert!(scheduler.is_complete());
        assert_eq!(scheduler.completed_histories(), 25);
    }

    #[test]
    fn test_draining_until_last_batch_reports() {
        let mut scheduler = HistoryScheduler::new(10, 0).unwrap();
        scheduler.start().unwrap();

        let a = scheduler.next_batch(0, 5).unwrap().unwrap();
        let b = scheduler.next_batch(1, 5).unwrap().unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Draining);

        scheduler.complete_batch(a.batch_id).unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Draining);
        scheduler.complete_batch(b.batch_id).unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Complete);
    }

    #[test]
    fn test_failed_batch_is_reissued_first() {
        let mut scheduler = HistoryScheduler::new(20, 0).unwrap();
        scheduler.start().unwrap();

        let lost = scheduler.next_batch(0, 5).unwrap().unwrap();
        assert_eq!(scheduler.fail_batch(lost.batch_id).unwrap(), 1);

        let reissued = scheduler.next_batch(1, 5).unwrap().unwrap();
        assert_eq!(reissued.range, lost.range);
        assert_eq!(reissued.reissues, 1);
        assert_ne!(reissued.batch_id, lost.batch_id);
    }

    #[test]
    fn test_stale_completion_rejected_after_reissue() {
        let mut scheduler = HistoryScheduler::new(20, 0).unwrap();
        scheduler.start().unwrap();

        let lost = scheduler.next_batch(0, 5).unwrap().unwrap();
        scheduler.fail_batch(lost.batch_id).unwrap();
        let reissued = scheduler.next_batch(1, 5).unwrap().unwrap();

        // The original worker reports late: its batch id is gone
        assert_eq!(
            scheduler.complete_batch(lost.batch_id).unwrap_err(),
            SchedulerError::UnknownBatch(lost.batch_id)
        );

        scheduler.complete_batch(reissued.batch_id).unwrap();
        assert_eq!(scheduler.completed_histories(), 5);
    }

    #[test]
    fn test_fail_during_draining_returns_to_dispatching() {
        let mut scheduler = HistoryScheduler::new(10, 0).unwrap();
        scheduler.start().unwrap();

        let batch = scheduler.next_batch(0, 10).unwrap().unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Draining);

        scheduler.fail_batch(batch.batch_id).unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Dispatching);

        let reissued = scheduler.next_batch(1, 10).unwrap().unwrap();
        scheduler.complete_batch(reissued.batch_id).unwrap();
        assert!(scheduler.is_complete());
    }

    #[test]
    fn test_resume_offset_counts_as_completed() {
        let mut scheduler = HistoryScheduler::new(100, 40).unwrap();
        scheduler.start().unwrap();
        assert_eq!(scheduler.completed_histories(), 40);

        let batch = scheduler.next_batch(0, 100).unwrap().unwrap();
        assert_eq!(batch.range, HistoryRange { start: 40, end: 100 });
        scheduler.complete_batch(batch.batch_id).unwrap();
        assert_eq!(scheduler.completed_histories(), 100);
    }

    #[test]
    fn test_exhausted_on_construction_completes_immediately() {
        let mut scheduler = HistoryScheduler::new(50, 50).unwrap();
        scheduler.start().unwrap();
        assert!(scheduler.next_batch(0, 10).unwrap().is_none());
        assert!(scheduler.is_complete());
    }

    #[test]
    fn test_static_partition_covers_range_evenly() {
        let ranges = plan_static_partition(103, 3, 4);
        assert_eq!(ranges.len(), 4);
        assert_eq!(ranges[0].start, 3);
        assert_eq!(ranges[3].end, 103);
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
        let lens: Vec<u64> = ranges.iter().map(|r| r.len()).collect();
        assert_eq!(lens, vec![25, 25, 25, 25]);
    }
}

//! Simulation manager
//!
//! Main driver loop integrating all components:
//! - History scheduling (batch dispatch, exactly-once accounting)
//! - Worker coordination (message passing, deadlines, reissue)
//! - Tally merging (worker replicas → canonical event handler)
//! - Rendezvous (barrier, checkpoint write, restart)
//!
//! # Architecture
//!
//! One driver state machine with a pluggable dispatch strategy:
//!
//! ```text
//! loop:
//! 1. Pull the next batch from the scheduler
//! 2. Dispatch to a worker (thread pool) or process inline (single worker)
//! 3. On batch completion, merge the worker's replica into the canonical
//!    event handler and confirm the batch with the scheduler
//! 4. When a rendezvous is due: stop issuing fresh work, drain everything
//!    in flight, write a checkpoint, resume
//! 5. On normal completion or interrupt, force a terminal rendezvous
//! ```
//!
//! Checkpoints are only written at quiescent points (nothing in flight,
//! nothing awaiting reissue), so a checkpoint's `next_history_index` is
//! always a clean resume frontier and never represents a torn mid-batch
//! state.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::core::RunState;
use crate::events::diagnostics::{DiagnosticsLog, SimulationEvent};
use crate::events::{EventError, EventHandler};
use crate::rendezvous::{
    compute_fingerprint, Checkpoint, FingerprintInputs, RendezvousConfig, RendezvousError,
    RendezvousManager, RendezvousPolicy, CHECKPOINT_FORMAT_VERSION,
};
use crate::rng::{RngError, SubstreamAllocator};
use crate::scheduler::{HistoryRange, HistoryScheduler, SchedulerError, SchedulerState};
use crate::tally::{EstimatorConfig, TallyError};
use crate::transport::TransportKernel;

/// How often the dispatch loop wakes to check worker deadlines
const RESULT_POLL_INTERVAL: Duration = Duration::from_millis(25);

// ============================================================================
// Configuration
// ============================================================================

/// Complete simulation configuration
///
/// Everything needed to initialize (or resume) a run. The estimator set,
/// history total and geometry/material identifiers together form the
/// configuration fingerprint that checkpoints are validated against.
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    /// Total number of particle histories to process
    pub total_histories: u64,

    /// Histories per dispatched batch
    pub max_batch_size: u64,

    /// Run-level master seed; every history substream derives from it
    pub master_seed: u64,

    /// Estimator setup, fixed for the lifetime of the run
    pub estimators: Vec<EstimatorConfig>,

    /// Geometry model identifier (fingerprint input only — the model
    /// itself is owned by the transport kernel)
    pub geometry_model_id: String,

    /// Material identifiers (fingerprint input only)
    pub material_ids: Vec<String>,

    /// Checkpoint store and cadence
    pub rendezvous: RendezvousConfig,

    /// When set, the rendezvous stride is derived as
    /// `total_histories / min_number_of_rendezvous` instead of taken from
    /// the explicit policy
    pub min_number_of_rendezvous: Option<u64>,

    /// Upper bound on the derived rendezvous stride
    pub max_rendezvous_batch_size: Option<u64>,

    /// A batch unreported for this long marks its worker failed
    pub worker_deadline: Duration,

    /// Reissues of one batch tolerated before the run aborts
    pub max_batch_reissues: u32,
}

impl SimulationConfig {
    /// Validate the configuration
    ///
    /// Fatal-at-startup class: a run is never started with a malformed
    /// configuration, and nothing here is retried.
    pub fn validate(&self) -> Result<(), SimulationError> {
        if self.total_histories == 0 {
            return Err(SimulationError::InvalidConfiguration(
                "total_histories must be > 0".to_string(),
            ));
        }
        if self.max_batch_size == 0 {
            return Err(SimulationError::InvalidConfiguration(
                "max_batch_size must be > 0".to_string(),
            ));
        }
        if self.estimators.is_empty() {
            return Err(SimulationError::InvalidConfiguration(
                "at least one estimator is required".to_string(),
            ));
        }
        let mut ids = HashSet::new();
        for estimator in &self.estimators {
            estimator.validate()?;
            if !ids.insert(estimator.id) {
                return Err(SimulationError::InvalidConfiguration(format!(
                    "duplicate estimator id: {}",
                    estimator.id
                )));
            }
        }
        if self.rendezvous.max_write_attempts == 0 {
            return Err(SimulationError::InvalidConfiguration(
                "max_write_attempts must be > 0".to_string(),
            ));
        }
        if let RendezvousPolicy::HistoryStride { stride } = self.rendezvous.policy {
            if stride == 0 {
                return Err(SimulationError::InvalidConfiguration(
                    "rendezvous stride must be > 0".to_string(),
                ));
            }
        }
        if self.min_number_of_rendezvous == Some(0) {
            return Err(SimulationError::InvalidConfiguration(
                "min_number_of_rendezvous must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Fingerprint of the restart-relevant configuration facets
    pub fn fingerprint(&self) -> Result<String, SimulationError> {
        let inputs = FingerprintInputs {
            total_histories: self.total_histories,
            estimators: &self.estimators,
            geometry_model_id: &self.geometry_model_id,
            material_ids: &self.material_ids,
        };
        compute_fingerprint(&inputs)
            .map_err(|err| SimulationError::Rendezvous(RendezvousError::Serialization(err)))
    }

    /// The rendezvous policy actually applied to this run
    ///
    /// `min_number_of_rendezvous` / `max_rendezvous_batch_size` override
    /// the explicit policy when set.
    fn effective_rendezvous_policy(&self) -> RendezvousPolicy {
        match self.min_number_of_rendezvous {
            Some(min_rendezvous) => {
                let mut stride = (self.total_histories / min_rendezvous).max(1);
                if let Some(cap) = self.max_rendezvous_batch_size {
                    stride = stride.min(cap.max(1));
                }
                RendezvousPolicy::HistoryStride { stride }
            }
            None => self.rendezvous.policy.clone(),
        }
    }
}

// ============================================================================
// Errors and reports
// ============================================================================

/// Errors raised while driving a simulation
#[derive(Debug, Error)]
pub enum SimulationError {
    /// Malformed run setup (zero histories, bad estimator bins, ...)
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A batch kept failing its deadline past the reissue budget —
    /// suspected systemic failure, not a transient
    #[error(
        "batch [{start}, {end}) exceeded {reissues} reissue(s); last worker: {worker_id}"
    )]
    WorkerTimeout {
        worker_id: usize,
        start: u64,
        end: u64,
        reissues: u32,
    },

    /// Every worker exited while histories were still unprocessed
    #[error("worker pool disconnected before the run completed")]
    WorkerPoolLost,

    #[error(transparent)]
    Tally(#[from] TallyError),

    #[error(transparent)]
    Event(#[from] EventError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Rng(#[from] RngError),

    #[error(transparent)]
    Rendezvous(#[from] RendezvousError),
}

/// Summary of a completed (or interrupted) run
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub run_id: Uuid,
    pub total_histories: u64,
    pub completed_histories: u64,
    pub checkpoints_written: u64,
    pub batches_reissued: u64,
    /// True when the run stopped on an interrupt request rather than
    /// exhausting the history range
    pub interrupted: bool,
    /// True when any checkpoint write was abandoned during the run
    pub durability_degraded: bool,
}

// ============================================================================
// Worker messages
// ============================================================================

struct WorkItem {
    batch_id: u64,
    range: HistoryRange,
}

struct WorkerReport {
    worker_id: usize,
    batch_id: u64,
    outcome: Result<EventHandler, SimulationError>,
}

/// Transport a batch of histories into a fresh event-handler replica
///
/// Free function so worker threads can run it without borrowing the
/// manager. Pure: identical inputs produce an identical replica.
fn process_batch<K: TransportKernel>(
    kernel: &K,
    allocator: &SubstreamAllocator,
    configs: &[EstimatorConfig],
    range: HistoryRange,
) -> Result<EventHandler, SimulationError> {
    let mut replica = EventHandler::new(configs)?;
    for history in range.start..range.end {
        let mut rng = allocator.substream_for(history)?;
        let contributions = kernel.advance_history(history, &mut rng);
        replica.record_contributions(&contributions)?;
    }
    Ok(replica)
}

// ============================================================================
// Simulation manager
// ============================================================================

/// Top-level driver owning the run state and all coordination
pub struct SimulationManager {
    config: SimulationConfig,
    run_state: RunState,
    scheduler: HistoryScheduler,
    allocator: SubstreamAllocator,
    /// Canonical tally state; worker replicas merge into this
    event_handler: EventHandler,
    rendezvous: RendezvousManager,
    diagnostics: DiagnosticsLog,
}

impl SimulationManager {
    /// Initialize a fresh run starting at history 0
    pub fn new(config: SimulationConfig) -> Result<Self, SimulationError> {
        config.validate()?;
        let run_state = RunState::new(config.total_histories);
        Self::build(config, run_state, 0, None)
    }

    /// Initialize a run starting at an arbitrary history offset
    ///
    /// Histories in `[0, offset)` are treated as already accounted for;
    /// statistics start empty. Used to continue a campaign whose earlier
    /// portion ran elsewhere.
    pub fn with_resume_offset(
        config: SimulationConfig,
        offset: u64,
    ) -> Result<Self, SimulationError> {
        config.validate()?;
        let mut run_state = RunState::new(config.total_histories);
        run_state.record_completed(offset);
        Self::build(config, run_state, offset, None)
    }

    /// Reconstruct a run from a checkpoint
    ///
    /// The checkpoint must carry the fingerprint of `config` and the same
    /// master seed; otherwise the resumed statistics would be invalid.
    pub fn restore(
        config: SimulationConfig,
        checkpoint: Checkpoint,
    ) -> Result<Self, SimulationError> {
        config.validate()?;
        let fingerprint = config.fingerprint()?;
        checkpoint.validate_fingerprint(&fingerprint)?;
        if checkpoint.master_seed != config.master_seed {
            return Err(SimulationError::InvalidConfiguration(format!(
                "master seed {} differs from checkpointed seed {}",
                config.master_seed, checkpoint.master_seed
            )));
        }

        let run_state = RunState::resume(
            checkpoint.run_id,
            config.total_histories,
            checkpoint.completed_histories,
        );
        let offset = checkpoint.next_history_index;
        Self::build(config, run_state, offset, Some(checkpoint))
    }

    /// Resume from the latest checkpoint if one exists, else start fresh
    ///
    /// `NoCheckpointFound` is the only recoverable load error; a
    /// fingerprint mismatch aborts before any history is processed.
    pub fn resume_or_new(config: SimulationConfig) -> Result<Self, SimulationError> {
        config.validate()?;
        let fingerprint = config.fingerprint()?;
        match RendezvousManager::load_latest(&config.rendezvous, &fingerprint) {
            Ok(checkpoint) => Self::restore(config, checkpoint),
            Err(RendezvousError::NoCheckpointFound(_)) => Self::new(config),
            Err(err) => Err(err.into()),
        }
    }

    fn build(
        config: SimulationConfig,
        run_state: RunState,
        resume_offset: u64,
        checkpoint: Option<Checkpoint>,
    ) -> Result<Self, SimulationError> {
        let fingerprint = config.fingerprint()?;
        let scheduler = HistoryScheduler::new(config.total_histories, resume_offset)?;
        let allocator = SubstreamAllocator::new(config.master_seed, config.total_histories);

        let event_handler = match &checkpoint {
            Some(checkpoint) => EventHandler::restore(checkpoint.event_handler.clone()),
            None => EventHandler::new(&config.estimators)?,
        };

        let mut rendezvous_config = config.rendezvous.clone();
        rendezvous_config.policy = config.effective_rendezvous_policy();
        let mut rendezvous = RendezvousManager::new(rendezvous_config, fingerprint);
        if let Some(checkpoint) = &checkpoint {
            rendezvous.resume_from(checkpoint);
        }

        Ok(Self {
            config,
            run_state,
            scheduler,
            allocator,
            event_handler,
            rendezvous,
            diagnostics: DiagnosticsLog::new(),
        })
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn run_state(&self) -> &RunState {
        &self.run_state
    }

    /// Read-only view of the canonical (merged) tally state
    pub fn event_handler(&self) -> &EventHandler {
        &self.event_handler
    }

    pub fn diagnostics(&self) -> &DiagnosticsLog {
        &self.diagnostics
    }

    pub fn scheduler_state(&self) -> SchedulerState {
        self.scheduler.state()
    }

    // ========================================================================
    // Run modes
    // ========================================================================

    /// Cooperative multi-worker run to completion
    ///
    /// Spawns a fixed pool of `workers` threads; each pulls batches,
    /// transports them against the kernel into a private replica, and
    /// reports over a channel. The pool size is fixed for the run —
    /// membership does not change except by failure.
    pub fn run_simulation<K: TransportKernel>(
        &mut self,
        kernel: &K,
        workers: usize,
    ) -> Result<SimulationReport, SimulationError> {
        if workers == 0 {
            return Err(SimulationError::InvalidConfiguration(
                "worker count must be > 0".to_string(),
            ));
        }
        self.scheduler.start()?;

        let allocator = self.allocator;
        let estimator_configs = self.config.estimators.clone();

        let driven: Result<(), SimulationError> = std::thread::scope(|scope| {
            let (report_tx, report_rx) = mpsc::channel::<WorkerReport>();
            let mut work_channels: Vec<mpsc::Sender<WorkItem>> = Vec::with_capacity(workers);

            for worker_id in 0..workers {
                let (work_tx, work_rx) = mpsc::channel::<WorkItem>();
                work_channels.push(work_tx);
                let report_tx = report_tx.clone();
                let configs = estimator_configs.clone();
                scope.spawn(move || {
                    while let Ok(item) = work_rx.recv() {
                        let outcome = process_batch(kernel, &allocator, &configs, item.range);
                        let report = WorkerReport {
                            worker_id,
                            batch_id: item.batch_id,
                            outcome,
                        };
                        if report_tx.send(report).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(report_tx);

            let result = self.drive_worker_pool(&work_channels, &report_rx, workers);
            drop(work_channels);
            result
        });
        driven?;

        // Forced terminal rendezvous: the last checkpoint matches the
        // reported totals exactly
        self.write_rendezvous()?;
        Ok(self.report(false))
    }

    /// Single-worker run that honors an external interrupt request
    ///
    /// The interrupt flag is checked between batches. On interrupt the
    /// in-flight batch finishes, a rendezvous is forced, and the run exits
    /// — a batch is never abandoned mid-flight, so `completed_histories`
    /// always matches the tallied contributions.
    pub fn run_interruptible_simulation<K: TransportKernel>(
        &mut self,
        kernel: &K,
        interrupt: &AtomicBool,
    ) -> Result<SimulationReport, SimulationError> {
        self.scheduler.start()?;

        let allocator = self.allocator;
        let estimator_configs = self.config.estimators.clone();
        let mut interrupted = false;

        loop {
            if interrupt.load(Ordering::Relaxed) {
                interrupted = true;
                self.diagnostics.log(SimulationEvent::InterruptReceived {
                    completed_histories: self.scheduler.completed_histories(),
                });
                break;
            }
            let batch = match self.scheduler.next_batch(0, self.config.max_batch_size)? {
                Some(batch) => batch,
                None => break,
            };
            self.diagnostics.log(SimulationEvent::BatchDispatched {
                batch_id: batch.batch_id,
                worker_id: 0,
                start: batch.range.start,
                end: batch.range.end,
            });
            let replica = process_batch(kernel, &allocator, &estimator_configs, batch.range)?;
            self.record_batch(batch.batch_id, 0, &replica)?;

            if self
                .rendezvous
                .should_rendezvous(self.scheduler.completed_histories())
            {
                self.write_rendezvous()?;
            }
        }

        self.write_rendezvous()?;
        Ok(self.report(interrupted))
    }

    // ========================================================================
    // Dispatch loop (parallel mode)
    // ========================================================================

    fn drive_worker_pool(
        &mut self,
        work_channels: &[mpsc::Sender<WorkItem>],
        reports: &mpsc::Receiver<WorkerReport>,
        workers: usize,
    ) -> Result<(), SimulationError> {
        let mut idle: VecDeque<usize> = (0..workers).collect();
        let mut failed: HashSet<usize> = HashSet::new();
        // Set while issuance is paused to drain in-flight batches ahead of
        // a checkpoint
        let mut rendezvous_pending = false;

        loop {
            // STEP 1: DISPATCH
            // Hand batches to idle workers. While a rendezvous is pending
            // only reissued batches go out — fresh ranges wait behind the
            // barrier.
            while let Some(&worker_id) = idle.front() {
                if rendezvous_pending && !self.scheduler.reissue_pending() {
                    break;
                }
                let batch = match self
                    .scheduler
                    .next_batch(worker_id, self.config.max_batch_size)?
                {
                    Some(batch) => batch,
                    None => break,
                };
                idle.pop_front();
                self.diagnostics.log(SimulationEvent::BatchDispatched {
                    batch_id: batch.batch_id,
                    worker_id,
                    start: batch.range.start,
                    end: batch.range.end,
                });
                let item = WorkItem {
                    batch_id: batch.batch_id,
                    range: batch.range,
                };
                if work_channels[worker_id].send(item).is_err() {
                    // The worker exited; treat it like a deadline failure
                    self.declare_worker_failed(worker_id, batch.batch_id, &mut failed)?;
                }
            }

            // STEP 2: RENDEZVOUS BARRIER
            // Runs ahead of the completion check so a stride rendezvous
            // due on the final batch is still written before the forced
            // terminal one.
            if rendezvous_pending && self.scheduler.is_quiescent() {
                self.write_rendezvous()?;
                rendezvous_pending = false;
                continue;
            }

            if self.scheduler.is_complete() {
                return Ok(());
            }

            // STEP 3: SYSTEMIC FAILURE GUARD
            // Work remains but nobody is left to run it.
            if failed.len() == workers {
                return Err(SimulationError::WorkerPoolLost);
            }

            // STEP 4: COLLECT REPORTS
            match reports.recv_timeout(RESULT_POLL_INTERVAL) {
                Ok(report) => {
                    let replica = report.outcome?;
                    self.record_batch(report.batch_id, report.worker_id, &replica)?;
                    if !failed.contains(&report.worker_id) {
                        idle.push_back(report.worker_id);
                    }
                    if !rendezvous_pending
                        && self
                            .rendezvous
                            .should_rendezvous(self.scheduler.completed_histories())
                    {
                        rendezvous_pending = true;
                    }
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    for batch_id in self.scheduler.overdue_batches(self.config.worker_deadline) {
                        let worker_id = self.scheduler.batch_worker(batch_id).unwrap_or(0);
                        self.declare_worker_failed(worker_id, batch_id, &mut failed)?;
                    }
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    return Err(SimulationError::WorkerPoolLost);
                }
            }
        }
    }

    /// Remove a worker from the pool and return its batch for reissue
    ///
    /// Reissue-after-declared-failure is always safe: substreams are
    /// index-derived, so reprocessing the same indices yields identical
    /// results. Escalates to fatal once one batch exhausts the reissue
    /// budget.
    fn declare_worker_failed(
        &mut self,
        worker_id: usize,
        batch_id: u64,
        failed: &mut HashSet<usize>,
    ) -> Result<(), SimulationError> {
        let range = self.scheduler.batch_range(batch_id).unwrap_or(HistoryRange {
            start: 0,
            end: 0,
        });
        let reissues = self.scheduler.fail_batch(batch_id)?;
        failed.insert(worker_id);
        self.diagnostics
            .log(SimulationEvent::WorkerDeclaredFailed { worker_id, batch_id });
        self.diagnostics.log(SimulationEvent::BatchReissued {
            batch_id,
            worker_id,
            reissues,
        });
        if reissues > self.config.max_batch_reissues {
            return Err(SimulationError::WorkerTimeout {
                worker_id,
                start: range.start,
                end: range.end,
                reissues,
            });
        }
        Ok(())
    }

    // ========================================================================
    // Shared bookkeeping (both run modes)
    // ========================================================================

    /// Confirm a batch and merge its replica into the canonical handler
    ///
    /// Stale reports — batch ids the scheduler no longer tracks because
    /// the batch was reissued — are dropped without touching any tally.
    fn record_batch(
        &mut self,
        batch_id: u64,
        worker_id: usize,
        replica: &EventHandler,
    ) -> Result<bool, SimulationError> {
        match self.scheduler.complete_batch(batch_id) {
            Ok(histories) => {
                self.event_handler.merge_from(replica)?;
                self.run_state.record_completed(histories);
                self.diagnostics.log(SimulationEvent::BatchCompleted {
                    batch_id,
                    worker_id,
                    histories,
                });
                Ok(true)
            }
            Err(SchedulerError::UnknownBatch(_)) => {
                self.diagnostics
                    .log(SimulationEvent::StaleReportDropped { batch_id, worker_id });
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Snapshot the run and publish a checkpoint
    ///
    /// A write that exhausts its retry budget degrades durability but does
    /// not abort the run — the in-memory tallies are intact and a later
    /// rendezvous may still succeed.
    fn write_rendezvous(&mut self) -> Result<(), SimulationError> {
        debug_assert!(self.scheduler.is_quiescent());

        let checkpoint = Checkpoint {
            format_version: CHECKPOINT_FORMAT_VERSION,
            run_id: self.run_state.run_id(),
            sequence: self.rendezvous.sequence(),
            written_at: Utc::now(),
            config_fingerprint: self.rendezvous.fingerprint().to_string(),
            next_history_index: self.scheduler.next_history_index(),
            completed_histories: self.scheduler.completed_histories(),
            master_seed: self.config.master_seed,
            event_handler: self.event_handler.snapshot(),
        };

        match self.rendezvous.write_checkpoint(&checkpoint) {
            Ok(path) => {
                self.run_state.record_checkpoint(&path);
                self.diagnostics.log(SimulationEvent::RendezvousWritten {
                    sequence: checkpoint.sequence,
                    path,
                    completed_histories: checkpoint.completed_histories,
                });
                Ok(())
            }
            Err(RendezvousError::WriteFailure { attempts, .. }) => {
                self.run_state.mark_durability_degraded();
                self.diagnostics.log(SimulationEvent::RendezvousAbandoned {
                    attempts,
                    completed_histories: checkpoint.completed_histories,
                });
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn report(&self, interrupted: bool) -> SimulationReport {
        SimulationReport {
            run_id: self.run_state.run_id(),
            total_histories: self.run_state.total_histories(),
            completed_histories: self.run_state.completed_histories(),
            checkpoints_written: self.diagnostics.rendezvous_written() as u64,
            batches_reissued: self.diagnostics.batches_reissued() as u64,
            interrupted,
            durability_degraded: self.run_state.durability_degraded(),
        }
    }
}

//! Particle Simulator Core - Rust Engine
//!
//! Distributed Monte Carlo particle-transport execution engine:
//! history scheduling, checkpoint/restart and tally aggregation with
//! deterministic execution.
//!
//! # Architecture
//!
//! - **core**: Run state and history index types
//! - **rng**: Deterministic per-history random substreams
//! - **tally**: Energy bins and estimators (running statistics)
//! - **events**: Event handler (contribution routing, merge, snapshot)
//!   and the diagnostics log
//! - **scheduler**: History batch scheduling and exactly-once accounting
//! - **rendezvous**: Checkpoint store (atomic publish, fingerprints)
//! - **manager**: Main simulation loop and worker coordination
//! - **transport**: Kernel interface to the external transport physics
//!
//! # Critical Invariants
//!
//! 1. Every history index in `[0, total_histories)` is accounted exactly
//!    once, across workers and across restarts
//! 2. All randomness is derived from (master seed, history index) — no
//!    hidden counter state anywhere
//! 3. A published checkpoint is always complete: write-to-temp plus
//!    atomic rename, never a torn file

// Module declarations
pub mod core;
pub mod events;
pub mod manager;
pub mod rendezvous;
pub mod rng;
pub mod scheduler;
pub mod tally;
pub mod transport;

// Re-exports for convenience
pub use crate::core::{HistoryIndex, RunState};
pub use events::{
    diagnostics::{DiagnosticsLog, SimulationEvent},
    handler::{EventError, EventHandler, EventHandlerSnapshot},
};
pub use manager::{SimulationConfig, SimulationError, SimulationManager, SimulationReport};
pub use rendezvous::{
    compute_fingerprint, Checkpoint, FingerprintInputs, RendezvousConfig, RendezvousError,
    RendezvousFileMode, RendezvousManager, RendezvousPolicy, CHECKPOINT_FORMAT_VERSION,
};
pub use rng::{HistorySubstream, RngError, SubstreamAllocator};
pub use scheduler::{
    plan_static_partition, HistoryRange, HistoryScheduler, SchedulerError, SchedulerState,
};
pub use tally::{
    Bin, EntityId, Estimator, EstimatorConfig, EstimatorId, EstimatorKind, TallyContribution,
    TallyError,
};
pub use transport::{SphereLeakageKernel, TransportKernel};

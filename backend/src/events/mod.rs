//! Event handling
//!
//! The event handler owns the full set of estimators and routes per-history
//! tally contributions to them. Workers hold private replicas; the manager
//! merges replicas into the canonical handler at batch completion and
//! snapshots the canonical handler for rendezvous.
//!
//! `diagnostics` is the run's structured log: batch dispatch/completion,
//! reissues, rendezvous outcomes. It is in-memory and append-only.

pub mod diagnostics;
pub mod handler;

pub use diagnostics::{DiagnosticsLog, SimulationEvent};
pub use handler::{EventHandler, EventHandlerSnapshot, EventError};

//! Simulation manager - top-level driver
//!
//! Implements the batch dispatch loop integrating scheduler, workers,
//! event handler and rendezvous.
//!
//! See `engine.rs` for the full implementation.

pub mod engine;

pub use engine::{SimulationConfig, SimulationError, SimulationManager, SimulationReport};

//! Core run-level types
//!
//! Holds the process-wide [`RunState`] value and the `HistoryIndex` alias
//! used throughout the engine. There are no ambient singletons: the
//! simulation manager owns the `RunState` and hands out read-only views.

pub mod run_state;

pub use run_state::RunState;

/// Global index of a particle history, unique in `[0, total_histories)`.
pub type HistoryIndex = u64;

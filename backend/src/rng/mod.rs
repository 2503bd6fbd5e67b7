//! Deterministic random number substreams
//!
//! Every particle history draws from its own substream, derived purely from
//! the run-level master seed and the global history index. CRITICAL: all
//! randomness consumed while transporting a history MUST come from that
//! history's substream — this is what makes restart-from-N bit-reproducible.

mod substream;

pub use substream::{HistorySubstream, RngError, SubstreamAllocator};

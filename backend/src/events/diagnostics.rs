//! Diagnostic event log
//!
//! Captures the scheduling and durability decisions the manager makes while
//! driving a run. The log is the diagnostic surface for behavior the end
//! user never sees directly: reissued batches, stale reports, abandoned
//! checkpoint writes.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// One scheduling or durability event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SimulationEvent {
    /// A batch of histories was handed to a worker
    BatchDispatched {
        batch_id: u64,
        worker_id: usize,
        start: u64,
        end: u64,
    },

    /// A worker reported a batch complete and its replica was merged
    BatchCompleted {
        batch_id: u64,
        worker_id: usize,
        histories: u64,
    },

    /// A batch missed its deadline and was returned for reissue
    BatchReissued {
        batch_id: u64,
        worker_id: usize,
        reissues: u32,
    },

    /// A worker was declared failed and removed from the pool
    WorkerDeclaredFailed { worker_id: usize, batch_id: u64 },

    /// A report arrived for a batch no longer outstanding and was dropped
    /// (the batch was reissued after the worker was declared failed)
    StaleReportDropped { batch_id: u64, worker_id: usize },

    /// A checkpoint was published
    RendezvousWritten {
        sequence: u64,
        path: PathBuf,
        completed_histories: u64,
    },

    /// A checkpoint write was abandoned after bounded retries; the run
    /// continues with degraded durability
    RendezvousAbandoned {
        attempts: u32,
        completed_histories: u64,
    },

    /// An interrupt request stopped batch issuance
    InterruptReceived { completed_histories: u64 },
}

/// Append-only in-memory log of [`SimulationEvent`]s
#[derive(Debug, Clone, Default)]
pub struct DiagnosticsLog {
    events: Vec<SimulationEvent>,
}

impl DiagnosticsLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&mut self, event: SimulationEvent) {
        self.events.push(event);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn events(&self) -> &[SimulationEvent] {
        &self.events
    }

    /// Count of published checkpoints
    pub fn rendezvous_written(&self) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, SimulationEvent::RendezvousWritten { .. }))
            .count()
    }

    /// Count of batch reissues
    pub fn batches_reissued(&self) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, SimulationEvent::BatchReissued { .. }))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_by_event_kind() {
        let mut log = DiagnosticsLog::new();
        log.log(SimulationEvent::BatchDispatched {
            batch_id: 0,
            worker_id: 0,
            start: 0,
            end: 10,
        });
        log.log(SimulationEvent::RendezvousWritten {
            sequence: 0,
            path: PathBuf::from("rendezvous_00000.json"),
            completed_histories: 10,
        });
        log.log(SimulationEvent::BatchReissued {
            batch_id: 0,
            worker_id: 0,
            reissues: 1,
        });

        assert_eq!(log.len(), 3);
        assert_eq!(log.rendezvous_written(), 1);
        assert_eq!(log.batches_reissued(), 1);
    }
}

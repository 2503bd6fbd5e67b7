//! Event handler - estimator ownership and contribution routing
//!
//! This module handles:
//! - Routing tally contributions to the matching estimator by id
//! - Merging worker-replica handlers into the canonical handler
//! - Snapshot/restore for checkpointing

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tally::{Estimator, EstimatorConfig, EstimatorId, TallyContribution, TallyError};

/// Errors raised by the event handler
#[derive(Debug, Error, PartialEq)]
pub enum EventError {
    /// Lookup or contribution routed to an estimator id nobody owns
    #[error("estimator not found: {0}")]
    EstimatorNotFound(EstimatorId),

    /// Two handlers with differing estimator sets cannot be merged
    #[error("event handlers are not mergeable: {0}")]
    NotMergeable(String),

    #[error(transparent)]
    Tally(#[from] TallyError),
}

/// Owns the set of estimators and routes contributions to them
///
/// Estimators are stored in configuration order so that snapshots, merges
/// and reports are deterministic; ids must be unique.
///
/// # Example
/// ```
/// use particle_simulator_core_rs::{EstimatorConfig, EstimatorKind, EventHandler};
///
/// let handler = EventHandler::new(&[EstimatorConfig {
///     id: 1,
///     kind: EstimatorKind::SurfaceCurrent,
///     energy_bin_boundaries: vec![0.0, 0.5, 1.0],
///     entity_ids: vec![1],
/// }])
/// .unwrap();
/// assert!(handler.get_estimator(1).is_ok());
/// assert!(handler.get_estimator(9).is_err());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct EventHandler {
    estimators: Vec<Estimator>,
}

impl EventHandler {
    /// Construct a handler from estimator configurations
    ///
    /// Validates every configuration and rejects duplicate ids.
    pub fn new(configs: &[EstimatorConfig]) -> Result<Self, EventError> {
        let mut seen = std::collections::HashSet::new();
        for config in configs {
            if !seen.insert(config.id) {
                return Err(EventError::Tally(TallyError::InvalidConfiguration(
                    format!("duplicate estimator id: {}", config.id),
                )));
            }
        }
        let estimators = configs
            .iter()
            .map(|config| Estimator::new(config.clone()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { estimators })
    }

    pub fn num_estimators(&self) -> usize {
        self.estimators.len()
    }

    pub fn estimators(&self) -> &[Estimator] {
        &self.estimators
    }

    /// Look up an estimator by id
    pub fn get_estimator(&self, id: EstimatorId) -> Result<&Estimator, EventError> {
        self.estimators
            .iter()
            .find(|e| e.id() == id)
            .ok_or(EventError::EstimatorNotFound(id))
    }

    fn get_estimator_mut(&mut self, id: EstimatorId) -> Result<&mut Estimator, EventError> {
        self.estimators
            .iter_mut()
            .find(|e| e.id() == id)
            .ok_or(EventError::EstimatorNotFound(id))
    }

    /// Route a batch of contributions to their estimators
    ///
    /// A contribution addressed to an unknown estimator is a kernel/wiring
    /// bug and fails the whole batch; out-of-range energies are absorbed by
    /// the estimator's overflow counters instead.
    pub fn record_contributions(
        &mut self,
        batch: &[TallyContribution],
    ) -> Result<(), EventError> {
        for contribution in batch {
            self.get_estimator_mut(contribution.estimator_id)?
                .accumulate(contribution)?;
        }
        Ok(())
    }

    /// Merge every estimator of `other` pairwise into this handler
    ///
    /// Both handlers must own exactly the same estimator ids with the same
    /// structure (the replica case: same configuration, different samples).
    pub fn merge_from(&mut self, other: &EventHandler) -> Result<(), EventError> {
        if self.estimators.len() != other.estimators.len() {
            return Err(EventError::NotMergeable(format!(
                "estimator count differs: {} vs {}",
                self.estimators.len(),
                other.estimators.len()
            )));
        }
        for theirs in &other.estimators {
            self.get_estimator_mut(theirs.id())
                .map_err(|_| {
                    EventError::NotMergeable(format!("estimator {} missing on merge target", theirs.id()))
                })?
                .merge(theirs)?;
        }
        Ok(())
    }

    /// Immutable copy of the full tally state, suitable for checkpointing
    pub fn snapshot(&self) -> EventHandlerSnapshot {
        EventHandlerSnapshot {
            estimators: self.estimators.clone(),
        }
    }

    /// Rebuild a handler from a snapshot
    ///
    /// Used only at restart, before any history is processed.
    pub fn restore(snapshot: EventHandlerSnapshot) -> Self {
        Self {
            estimators: snapshot.estimators,
        }
    }
}

/// Serialized form of an event handler's complete tally state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventHandlerSnapshot {
    pub estimators: Vec<Estimator>,
}

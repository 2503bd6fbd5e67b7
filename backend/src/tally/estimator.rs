//! Estimators
//!
//! An estimator owns one grid of energy bins per tallied entity and routes
//! kind-specific responses into them. Structure (id, kind, boundaries,
//! entities) is fixed at configuration time; only the statistics mutate.
//!
//! Kinds share one contract — configure, accumulate, merge, mean,
//! relative_error — and differ only in how a contribution is turned into a
//! scored sample.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tally::bins::{Bin, EnergyDiscretization};

/// Estimator identifier, unique within one event handler
pub type EstimatorId = u32;

/// Geometry entity identifier (surface or cell) tallied by an estimator
pub type EntityId = u32;

/// Errors raised by estimator configuration and accumulation
#[derive(Debug, Error, PartialEq)]
pub enum TallyError {
    /// Malformed estimator setup. Fatal at startup, never retried.
    #[error("invalid estimator configuration: {0}")]
    InvalidConfiguration(String),

    /// Attempt to merge estimators with differing structure
    #[error("estimator configurations do not match: {0}")]
    ConfigurationMismatch(String),

    /// Contribution routed to an entity this estimator does not tally
    #[error("estimator {estimator} does not tally entity {entity}")]
    UnknownEntity { estimator: EstimatorId, entity: EntityId },

    /// Read access to a bin index past the discretization
    #[error("bin index {bin} out of range for estimator {estimator} ({bins} bins)")]
    BinOutOfRange {
        estimator: EstimatorId,
        bin: usize,
        bins: usize,
    },
}

/// One tally contribution produced by the transport kernel
///
/// Ephemeral: consumed by the event handler as soon as the producing batch
/// is recorded, never stored.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TallyContribution {
    pub estimator_id: EstimatorId,
    pub entity_id: EntityId,
    /// Energy of the particle at the scoring event (MeV)
    pub energy: f64,
    /// Statistical weight of the particle
    pub weight: f64,
    /// Kernel-supplied score (crossing sense, 1/|cos θ|, track length, ...)
    pub score: f64,
}

/// Estimator kind: what physical quantity the bins accumulate
///
/// Kind-specific scoring lives entirely behind [`EstimatorKind::response`];
/// everything else about an estimator is kind-agnostic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EstimatorKind {
    /// Surface current: weighted crossing count, scored as-is
    SurfaceCurrent,

    /// Surface flux: crossing scored with the kernel-supplied 1/|cos θ|
    /// factor and normalized by the surface area
    SurfaceFlux { surface_area: f64 },
}

impl EstimatorKind {
    /// Turn a contribution into the sample value this kind accumulates
    pub fn response(&self, contribution: &TallyContribution) -> f64 {
        match self {
            EstimatorKind::SurfaceCurrent => contribution.weight * contribution.score,
            EstimatorKind::SurfaceFlux { surface_area } => {
                contribution.weight * contribution.score / surface_area
            }
        }
    }

    /// Short label used in reports
    pub fn label(&self) -> &'static str {
        match self {
            EstimatorKind::SurfaceCurrent => "current",
            EstimatorKind::SurfaceFlux { .. } => "flux",
        }
    }

    fn validate(&self) -> Result<(), TallyError> {
        if let EstimatorKind::SurfaceFlux { surface_area } = self {
            if !surface_area.is_finite() || *surface_area <= 0.0 {
                return Err(TallyError::InvalidConfiguration(format!(
                    "surface area must be positive and finite, got {}",
                    surface_area
                )));
            }
        }
        Ok(())
    }
}

/// Immutable estimator structure, fixed at configuration time
///
/// # Example
/// ```
/// use particle_simulator_core_rs::{EstimatorConfig, EstimatorKind};
///
/// let config = EstimatorConfig {
///     id: 1,
///     kind: EstimatorKind::SurfaceCurrent,
///     energy_bin_boundaries: vec![0.0, 0.5, 1.0],
///     entity_ids: vec![1],
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimatorConfig {
    pub id: EstimatorId,
    pub kind: EstimatorKind,
    /// Strictly increasing energy bin edges (MeV), at least two
    pub energy_bin_boundaries: Vec<f64>,
    /// Entities (surfaces/cells) this estimator tallies, at least one
    pub entity_ids: Vec<EntityId>,
}

impl EstimatorConfig {
    /// Reject malformed configurations with [`TallyError::InvalidConfiguration`]
    pub fn validate(&self) -> Result<(), TallyError> {
        self.kind.validate()?;

        if self.energy_bin_boundaries.len() < 2 {
            return Err(TallyError::InvalidConfiguration(format!(
                "estimator {} needs at least 2 energy boundaries, got {}",
                self.id,
                self.energy_bin_boundaries.len()
            )));
        }
        for pair in self.energy_bin_boundaries.windows(2) {
            if !pair[0].is_finite() || !pair[1].is_finite() || pair[0] >= pair[1] {
                return Err(TallyError::InvalidConfiguration(format!(
                    "estimator {} energy boundaries must be finite and strictly increasing \
                     ({} then {})",
                    self.id, pair[0], pair[1]
                )));
            }
        }

        if self.entity_ids.is_empty() {
            return Err(TallyError::InvalidConfiguration(format!(
                "estimator {} tallies no entities",
                self.id
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for entity in &self.entity_ids {
            if !seen.insert(entity) {
                return Err(TallyError::InvalidConfiguration(format!(
                    "estimator {} lists entity {} twice",
                    self.id, entity
                )));
            }
        }

        Ok(())
    }
}

/// A configured estimator with mutable statistics
///
/// Bins are laid out as one `Vec<Bin>` per entity, in the entity order of
/// the configuration, so serialization and merging are deterministic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Estimator {
    config: EstimatorConfig,
    grid: EnergyDiscretization,
    /// bins[entity_position][bin_index]
    bins: Vec<Vec<Bin>>,
    /// Out-of-range contribution count per entity position (diagnostic —
    /// dropped energies are counted, never silently discarded)
    overflow: Vec<u64>,
}

impl Estimator {
    /// One-time configuration
    pub fn new(config: EstimatorConfig) -> Result<Self, TallyError> {
        config.validate()?;
        let grid = EnergyDiscretization::new(config.energy_bin_boundaries.clone());

        let template: Vec<Bin> = config
            .energy_bin_boundaries
            .windows(2)
            .map(|pair| Bin::new(pair[0], pair[1]))
            .collect();
        let bins = vec![template; config.entity_ids.len()];
        let overflow = vec![0; config.entity_ids.len()];

        Ok(Self {
            config,
            grid,
            bins,
            overflow,
        })
    }

    pub fn id(&self) -> EstimatorId {
        self.config.id
    }

    pub fn kind(&self) -> &EstimatorKind {
        &self.config.kind
    }

    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    pub fn num_bins(&self) -> usize {
        self.grid.num_bins()
    }

    pub fn entity_ids(&self) -> &[EntityId] {
        &self.config.entity_ids
    }

    pub fn energy_boundaries(&self) -> &[f64] {
        self.grid.boundaries()
    }

    fn entity_position(&self, entity: EntityId) -> Result<usize, TallyError> {
        self.config
            .entity_ids
            .iter()
            .position(|e| *e == entity)
            .ok_or(TallyError::UnknownEntity {
                estimator: self.config.id,
                entity,
            })
    }

    /// Accumulate one contribution
    ///
    /// Energies outside the discretization increment the entity's overflow
    /// counter and touch no bin.
    pub fn accumulate(&mut self, contribution: &TallyContribution) -> Result<(), TallyError> {
        let position = self.entity_position(contribution.entity_id)?;
        match self.grid.locate(contribution.energy) {
            Some(bin) => {
                let sample = self.config.kind.response(contribution);
                self.bins[position][bin].accumulate(sample);
            }
            None => self.overflow[position] += 1,
        }
        Ok(())
    }

    /// Read-only access to one bin
    pub fn bin(&self, entity: EntityId, bin: usize) -> Result<&Bin, TallyError> {
        let position = self.entity_position(entity)?;
        self.bins[position].get(bin).ok_or(TallyError::BinOutOfRange {
            estimator: self.config.id,
            bin,
            bins: self.grid.num_bins(),
        })
    }

    /// Mean score for one (entity, bin) pair
    pub fn mean(&self, entity: EntityId, bin: usize) -> Result<f64, TallyError> {
        Ok(self.bin(entity, bin)?.mean())
    }

    /// Relative error for one (entity, bin) pair (NaN when undefined)
    pub fn relative_error(&self, entity: EntityId, bin: usize) -> Result<f64, TallyError> {
        Ok(self.bin(entity, bin)?.relative_error())
    }

    /// Out-of-range contribution count for one entity
    pub fn overflow_count(&self, entity: EntityId) -> Result<u64, TallyError> {
        Ok(self.overflow[self.entity_position(entity)?])
    }

    /// Combine another estimator's aggregates into this one
    ///
    /// Combines raw bin aggregates pairwise — counts, running moments and
    /// overflow counters add — which is exact for batches of unequal size.
    /// Requires identical structure.
    pub fn merge(&mut self, other: &Estimator) -> Result<(), TallyError> {
        if self.config != other.config {
            return Err(TallyError::ConfigurationMismatch(format!(
                "estimator {} structure differs from estimator {}",
                self.config.id, other.config.id
            )));
        }
        for (mine, theirs) in self.bins.iter_mut().zip(other.bins.iter()) {
            for (a, b) in mine.iter_mut().zip(theirs.iter()) {
                a.merge(b);
            }
        }
        for (a, b) in self.overflow.iter_mut().zip(other.overflow.iter()) {
            *a += b;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn current_config() -> EstimatorConfig {
        EstimatorConfig {
            id: 1,
            kind: EstimatorKind::SurfaceCurrent,
            energy_bin_boundaries: vec![0.0, 0.5, 1.0],
            entity_ids: vec![1],
        }
    }

    fn contribution(energy: f64) -> TallyContribution {
        TallyContribution {
            estimator_id: 1,
            entity_id: 1,
            energy,
            weight: 1.0,
            score: 1.0,
        }
    }

    #[test]
    fn test_rejects_single_boundary() {
        let mut config = current_config();
        config.energy_bin_boundaries = vec![1.0];
        assert!(matches!(
            Estimator::new(config),
            Err(TallyError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_rejects_non_increasing_boundaries() {
        let mut config = current_config();
        config.energy_bin_boundaries = vec![0.0, 0.5, 0.5];
        assert!(matches!(
            Estimator::new(config),
            Err(TallyError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_rejects_nonpositive_flux_area() {
        let config = EstimatorConfig {
            id: 2,
            kind: EstimatorKind::SurfaceFlux { surface_area: 0.0 },
            energy_bin_boundaries: vec![0.0, 1.0],
            entity_ids: vec![1],
        };
        assert!(matches!(
            Estimator::new(config),
            Err(TallyError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_flux_response_divides_by_area() {
        let kind = EstimatorKind::SurfaceFlux { surface_area: 4.0 };
        let c = TallyContribution {
            estimator_id: 2,
            entity_id: 1,
            energy: 0.3,
            weight: 2.0,
            score: 3.0,
        };
        assert_eq!(kind.response(&c), 1.5);
    }

    #[test]
    fn test_out_of_range_energy_counts_overflow() {
        let mut estimator = Estimator::new(current_config()).unwrap();
        estimator.accumulate(&contribution(1.5)).unwrap();
        assert_eq!(estimator.overflow_count(1).unwrap(), 1);
        assert_eq!(estimator.bin(1, 0).unwrap().count(), 0);
        assert_eq!(estimator.bin(1, 1).unwrap().count(), 0);
    }

    #[test]
    fn test_unknown_entity_rejected() {
        let mut estimator = Estimator::new(current_config()).unwrap();
        let mut c = contribution(0.3);
        c.entity_id = 99;
        assert_eq!(
            estimator.accumulate(&c).unwrap_err(),
            TallyError::UnknownEntity {
                estimator: 1,
                entity: 99
            }
        );
    }

    #[test]
    fn test_merge_rejects_differing_boundaries() {
        let mut a = Estimator::new(current_config()).unwrap();
        let mut other_config = current_config();
        other_config.energy_bin_boundaries = vec![0.0, 0.25, 1.0];
        let b = Estimator::new(other_config).unwrap();
        assert!(matches!(
            a.merge(&b),
            Err(TallyError::ConfigurationMismatch(_))
        ));
    }
}

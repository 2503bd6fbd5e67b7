//! Transport kernel interface
//!
//! The physics of particle transport — cross sections, collisions,
//! ray-tracing — lives outside this engine. The core consumes it through
//! [`TransportKernel`]: an opaque, side-effect-free function from
//! (history index, substream) to a batch of tally contributions. Geometry
//! and material models are captured by the kernel implementation.
//!
//! `SphereLeakageKernel` is the reference kernel shipped with the crate:
//! a monoenergetic isotropic source at the center of a uniform sphere,
//! scoring leakage current and flux on the bounding surface. It exists so
//! the driver and the integration tests have deterministic physics to run
//! the engine against.

use crate::core::HistoryIndex;
use crate::rng::HistorySubstream;
use crate::tally::{EntityId, EstimatorId, TallyContribution};

/// Opaque "advance one history" operation
///
/// Implementations must be pure with respect to their inputs: the same
/// (history, substream) pair yields the same contributions on any worker
/// and on any restart. `Sync` because one kernel instance is shared by the
/// whole worker pool.
pub trait TransportKernel: Sync {
    fn advance_history(
        &self,
        history: HistoryIndex,
        rng: &mut HistorySubstream,
    ) -> Vec<TallyContribution>;
}

/// Reference kernel: leakage through the surface of a uniform sphere
///
/// Each history random-walks a particle from a monoenergetic source:
/// per flight it either escapes through the surface, is absorbed, or
/// scatters to a lower energy. An escaping particle scores one surface
/// current contribution (crossing count) and one surface flux contribution
/// (1/|cos θ| of the sampled crossing angle).
#[derive(Debug, Clone)]
pub struct SphereLeakageKernel {
    /// Source energy (MeV)
    pub source_energy: f64,
    /// Per-flight escape probability
    pub escape_probability: f64,
    /// Per-flight absorption probability
    pub absorption_probability: f64,
    /// Particles below this energy are terminated (MeV)
    pub energy_cutoff: f64,
    pub current_estimator: EstimatorId,
    pub flux_estimator: EstimatorId,
    pub surface_entity: EntityId,
}

impl SphereLeakageKernel {
    pub fn new(
        source_energy: f64,
        current_estimator: EstimatorId,
        flux_estimator: EstimatorId,
        surface_entity: EntityId,
    ) -> Self {
        Self {
            source_energy,
            escape_probability: 0.3,
            absorption_probability: 0.1,
            energy_cutoff: 1e-3,
            current_estimator,
            flux_estimator,
            surface_entity,
        }
    }
}

impl TransportKernel for SphereLeakageKernel {
    fn advance_history(
        &self,
        _history: HistoryIndex,
        rng: &mut HistorySubstream,
    ) -> Vec<TallyContribution> {
        let mut energy = self.source_energy;
        let mut contributions = Vec::new();

        while energy > self.energy_cutoff {
            let event = rng.next_f64();
            if event < self.escape_probability {
                // Leakage: score the surface crossing
                let cosine = rng.next_f64_open();
                contributions.push(TallyContribution {
                    estimator_id: self.current_estimator,
                    entity_id: self.surface_entity,
                    energy,
                    weight: 1.0,
                    score: 1.0,
                });
                contributions.push(TallyContribution {
                    estimator_id: self.flux_estimator,
                    entity_id: self.surface_entity,
                    energy,
                    weight: 1.0,
                    score: 1.0 / cosine,
                });
                break;
            }
            if event < self.escape_probability + self.absorption_probability {
                break;
            }
            // Scatter: degrade the energy by a uniform fraction
            energy *= rng.next_f64_open();
        }

        contributions
    }
}

//! Tally accumulation
//!
//! Estimators accumulate weighted per-history contributions into
//! energy/entity bins with numerically stable running statistics.
//!
//! # Critical Invariants
//!
//! 1. A bin is only ever mutated by its owning estimator, never shared
//! 2. Bin aggregates are Welford running moments — variance is never
//!    recovered by subtracting large near-equal sums
//! 3. Merging two estimators combines raw aggregates, not derived means,
//!    so batches of unequal size stay statistically correct

pub mod bins;
pub mod estimator;

pub use bins::{Bin, EnergyDiscretization};
pub use estimator::{
    EntityId, Estimator, EstimatorConfig, EstimatorId, EstimatorKind, TallyContribution,
    TallyError,
};

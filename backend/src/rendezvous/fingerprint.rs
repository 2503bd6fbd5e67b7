//! Configuration fingerprinting
//!
//! A checkpoint may only be resumed under the configuration that produced
//! it: a different estimator setup, history total, or geometry/material
//! set would silently corrupt the merged statistics. The fingerprint is a
//! SHA-256 hash over the canonical JSON form of those inputs.
//!
//! Uses canonical JSON serialization with sorted keys to ensure
//! deterministic hashing regardless of map iteration order.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::tally::EstimatorConfig;

/// The configuration facets a restart must agree on
#[derive(Debug, Serialize)]
pub struct FingerprintInputs<'a> {
    pub total_histories: u64,
    pub estimators: &'a [EstimatorConfig],
    pub geometry_model_id: &'a str,
    pub material_ids: &'a [String],
}

/// Compute the deterministic SHA-256 fingerprint of a configuration
pub fn compute_fingerprint(inputs: &FingerprintInputs<'_>) -> Result<String, serde_json::Error> {
    use serde_json::Value;
    use std::collections::BTreeMap;

    let value = serde_json::to_value(inputs)?;

    // Recursively sort all object keys for a canonical representation
    fn canonicalize(value: Value) -> Value {
        match value {
            Value::Object(map) => {
                let sorted: BTreeMap<String, Value> =
                    map.into_iter().map(|(k, v)| (k, canonicalize(v))).collect();
                Value::Object(sorted.into_iter().collect())
            }
            Value::Array(arr) => Value::Array(arr.into_iter().map(canonicalize).collect()),
            other => other,
        }
    }

    let json = serde_json::to_string(&canonicalize(value))?;

    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

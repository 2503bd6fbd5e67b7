//! Event handler tests
//!
//! Routing, lookup failures, replica merging, and the snapshot/restore
//! round trip (which must be exact — checkpoints depend on it).

use particle_simulator_core_rs::{
    EventError, EventHandler, EventHandlerSnapshot, EstimatorConfig, EstimatorKind,
    TallyContribution,
};

// ============================================================================
// Test Helpers
// ============================================================================

fn estimator_configs() -> Vec<EstimatorConfig> {
    vec![
        EstimatorConfig {
            id: 1,
            kind: EstimatorKind::SurfaceCurrent,
            energy_bin_boundaries: vec![0.0, 0.5, 1.0],
            entity_ids: vec![1],
        },
        EstimatorConfig {
            id: 2,
            kind: EstimatorKind::SurfaceFlux { surface_area: 2.0 },
            energy_bin_boundaries: vec![0.0, 0.5, 1.0],
            entity_ids: vec![1],
        },
    ]
}

fn contribution(estimator_id: u32, energy: f64, score: f64) -> TallyContribution {
    TallyContribution {
        estimator_id,
        entity_id: 1,
        energy,
        weight: 1.0,
        score,
    }
}

// ============================================================================
// Lookup and routing
// ============================================================================

#[test]
fn test_get_estimator_not_found() {
    let handler = EventHandler::new(&estimator_configs()).unwrap();
    assert!(handler.get_estimator(1).is_ok());
    assert_eq!(
        handler.get_estimator(3).unwrap_err(),
        EventError::EstimatorNotFound(3)
    );
}

#[test]
fn test_batch_routes_to_both_estimators() {
    let mut handler = EventHandler::new(&estimator_configs()).unwrap();
    handler
        .record_contributions(&[
            contribution(1, 0.3, 1.0),
            contribution(2, 0.3, 2.0),
            contribution(1, 0.7, 1.0),
        ])
        .unwrap();

    let current = handler.get_estimator(1).unwrap();
    assert_eq!(current.bin(1, 0).unwrap().count(), 1);
    assert_eq!(current.bin(1, 1).unwrap().count(), 1);

    let flux = handler.get_estimator(2).unwrap();
    assert_eq!(flux.bin(1, 0).unwrap().count(), 1);
    // Flux response: weight * score / area = 1 * 2 / 2
    assert_eq!(flux.bin(1, 0).unwrap().mean(), 1.0);
}

// ============================================================================
// Merging
// ============================================================================

#[test]
fn test_merge_from_combines_replicas() {
    let configs = estimator_configs();
    let mut canonical = EventHandler::new(&configs).unwrap();
    let mut replica_a = EventHandler::new(&configs).unwrap();
    let mut replica_b = EventHandler::new(&configs).unwrap();

    replica_a
        .record_contributions(&[contribution(1, 0.3, 1.0)])
        .unwrap();
    replica_b
        .record_contributions(&[contribution(1, 0.3, 3.0), contribution(1, 0.9, 1.0)])
        .unwrap();

    canonical.merge_from(&replica_a).unwrap();
    canonical.merge_from(&replica_b).unwrap();

    let current = canonical.get_estimator(1).unwrap();
    assert_eq!(current.bin(1, 0).unwrap().count(), 2);
    assert_eq!(current.bin(1, 0).unwrap().mean(), 2.0);
    assert_eq!(current.bin(1, 1).unwrap().count(), 1);
}

#[test]
fn test_merge_from_rejects_differing_estimator_sets() {
    let mut canonical = EventHandler::new(&estimator_configs()).unwrap();
    let other = EventHandler::new(&estimator_configs()[..1]).unwrap();
    assert!(matches!(
        canonical.merge_from(&other),
        Err(EventError::NotMergeable(_))
    ));
}

// ============================================================================
// Snapshot / restore
// ============================================================================

#[test]
fn test_snapshot_restore_is_exact() {
    let mut handler = EventHandler::new(&estimator_configs()).unwrap();
    for i in 0..100 {
        let energy = (i as f64) / 100.0;
        handler
            .record_contributions(&[
                contribution(1, energy, 1.0 + energy),
                contribution(2, energy, 2.0),
            ])
            .unwrap();
    }

    let restored = EventHandler::restore(handler.snapshot());
    assert_eq!(restored, handler);
}

#[test]
fn test_snapshot_serde_round_trip_is_bit_exact() {
    // A checkpoint is a JSON document; serde_json's float formatting must
    // round-trip the running moments without losing a bit.
    let mut handler = EventHandler::new(&estimator_configs()).unwrap();
    for i in 0..1000 {
        let energy = 0.001 * (i % 999) as f64;
        handler
            .record_contributions(&[contribution(1, energy, 1.0 / (1.0 + i as f64))])
            .unwrap();
    }

    let snapshot = handler.snapshot();
    let json = serde_json::to_string(&snapshot).unwrap();
    let reloaded: EventHandlerSnapshot = serde_json::from_str(&json).unwrap();
    let restored = EventHandler::restore(reloaded);

    let before = handler.get_estimator(1).unwrap().bin(1, 0).unwrap();
    let after = restored.get_estimator(1).unwrap().bin(1, 0).unwrap();
    assert_eq!(before.count(), after.count());
    assert_eq!(before.mean().to_bits(), after.mean().to_bits());
    assert_eq!(before.sum_squares().to_bits(), after.sum_squares().to_bits());
    assert_eq!(restored, handler);
}

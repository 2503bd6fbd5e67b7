//! Rendezvous store tests
//!
//! Write/load round trips, atomic publish discipline, retention modes,
//! fingerprint validation, and the bounded-retry failure path.

use std::fs;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use particle_simulator_core_rs::{
    Checkpoint, EstimatorConfig, EstimatorKind, EventHandler, RendezvousConfig, RendezvousError,
    RendezvousFileMode, RendezvousManager, RendezvousPolicy, TallyContribution,
    CHECKPOINT_FORMAT_VERSION,
};

// ============================================================================
// Test Helpers
// ============================================================================

fn store_config(directory: &std::path::Path, file_mode: RendezvousFileMode) -> RendezvousConfig {
    RendezvousConfig {
        directory: directory.to_path_buf(),
        basename: "sphere".to_string(),
        policy: RendezvousPolicy::HistoryStride { stride: 20 },
        file_mode,
        max_write_attempts: 3,
        retry_backoff: Duration::from_millis(1),
    }
}

fn sample_handler() -> EventHandler {
    let mut handler = EventHandler::new(&[EstimatorConfig {
        id: 1,
        kind: EstimatorKind::SurfaceCurrent,
        energy_bin_boundaries: vec![0.0, 0.5, 1.0],
        entity_ids: vec![1],
    }])
    .unwrap();
    handler
        .record_contributions(&[
            TallyContribution {
                estimator_id: 1,
                entity_id: 1,
                energy: 0.3,
                weight: 1.0,
                score: 2.0,
            },
            TallyContribution {
                estimator_id: 1,
                entity_id: 1,
                energy: 0.9,
                weight: 1.0,
                score: 3.0,
            },
        ])
        .unwrap();
    handler
}

fn sample_checkpoint(sequence: u64, completed: u64, fingerprint: &str) -> Checkpoint {
    Checkpoint {
        format_version: CHECKPOINT_FORMAT_VERSION,
        run_id: Uuid::new_v4(),
        sequence,
        written_at: Utc::now(),
        config_fingerprint: fingerprint.to_string(),
        next_history_index: completed,
        completed_histories: completed,
        master_seed: 12345,
        event_handler: sample_handler().snapshot(),
    }
}

// ============================================================================
// Round trips
// ============================================================================

#[test]
fn test_write_then_load_latest_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let config = store_config(dir.path(), RendezvousFileMode::SingleLatest);
    let mut manager = RendezvousManager::new(config.clone(), "fp".to_string());

    let checkpoint = sample_checkpoint(0, 40, "fp");
    let path = manager.write_checkpoint(&checkpoint).unwrap();
    assert!(path.exists());

    let loaded = RendezvousManager::load_latest(&config, "fp").unwrap();
    assert_eq!(loaded.run_id, checkpoint.run_id);
    assert_eq!(loaded.next_history_index, 40);
    assert_eq!(loaded.completed_histories, 40);
    assert_eq!(loaded.master_seed, 12345);

    // Tally state reproduces exactly
    let restored = EventHandler::restore(loaded.event_handler);
    assert_eq!(restored, sample_handler());
}

#[test]
fn test_no_temporary_file_left_after_publish() {
    let dir = tempfile::tempdir().unwrap();
    let config = store_config(dir.path(), RendezvousFileMode::SingleLatest);
    let mut manager = RendezvousManager::new(config, "fp".to_string());
    manager
        .write_checkpoint(&sample_checkpoint(0, 20, "fp"))
        .unwrap();

    let names: Vec<String> = fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["sphere.json".to_string()]);
}

#[test]
fn test_single_latest_overwrites_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let config = store_config(dir.path(), RendezvousFileMode::SingleLatest);
    let mut manager = RendezvousManager::new(config.clone(), "fp".to_string());

    manager
        .write_checkpoint(&sample_checkpoint(0, 20, "fp"))
        .unwrap();
    manager
        .write_checkpoint(&sample_checkpoint(1, 40, "fp"))
        .unwrap();

    let loaded = RendezvousManager::load_latest(&config, "fp").unwrap();
    assert_eq!(loaded.completed_histories, 40);
    assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
}

#[test]
fn test_multiple_files_mode_retains_every_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let config = store_config(dir.path(), RendezvousFileMode::MultipleFiles);
    let mut manager = RendezvousManager::new(config.clone(), "fp".to_string());

    for (sequence, completed) in [(0, 20), (1, 40), (2, 60)] {
        manager
            .write_checkpoint(&sample_checkpoint(sequence, completed, "fp"))
            .unwrap();
    }

    for name in ["sphere_00000.json", "sphere_00001.json", "sphere_00002.json"] {
        assert!(dir.path().join(name).exists(), "missing {}", name);
    }

    // Pointer resolves the newest file
    let loaded = RendezvousManager::load_latest(&config, "fp").unwrap();
    assert_eq!(loaded.sequence, 2);
    assert_eq!(loaded.completed_histories, 60);

    // Older checkpoints stay individually loadable (audit trail)
    let older = Checkpoint::load(&dir.path().join("sphere_00001.json")).unwrap();
    assert_eq!(older.completed_histories, 40);
}

// ============================================================================
// Failure paths
// ============================================================================

#[test]
fn test_load_latest_without_store_is_no_checkpoint_found() {
    let dir = tempfile::tempdir().unwrap();
    for mode in [RendezvousFileMode::SingleLatest, RendezvousFileMode::MultipleFiles] {
        let config = store_config(dir.path(), mode);
        assert!(matches!(
            RendezvousManager::load_latest(&config, "fp"),
            Err(RendezvousError::NoCheckpointFound(_))
        ));
    }
}

#[test]
fn test_fingerprint_mismatch_reports_both_hashes() {
    let dir = tempfile::tempdir().unwrap();
    let config = store_config(dir.path(), RendezvousFileMode::SingleLatest);
    let mut manager = RendezvousManager::new(config.clone(), "aaaa".to_string());
    manager
        .write_checkpoint(&sample_checkpoint(0, 20, "aaaa"))
        .unwrap();

    match RendezvousManager::load_latest(&config, "bbbb") {
        Err(RendezvousError::ConfigurationMismatch { expected, found }) => {
            assert_eq!(expected, "bbbb");
            assert_eq!(found, "aaaa");
        }
        other => panic!("expected ConfigurationMismatch, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_unsupported_format_version_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config = store_config(dir.path(), RendezvousFileMode::SingleLatest);

    let mut checkpoint = sample_checkpoint(0, 20, "fp");
    checkpoint.format_version = 99;
    fs::write(
        dir.path().join("sphere.json"),
        serde_json::to_string(&checkpoint).unwrap(),
    )
    .unwrap();

    assert!(matches!(
        RendezvousManager::load_latest(&config, "fp"),
        Err(RendezvousError::UnsupportedVersion {
            found: 99,
            supported: CHECKPOINT_FORMAT_VERSION
        })
    ));
}

#[test]
fn test_write_failure_exhausts_retries_and_degrades() {
    let dir = tempfile::tempdir().unwrap();
    // The "directory" is an existing regular file, so every attempt fails
    let blocker = dir.path().join("store");
    fs::write(&blocker, "not a directory").unwrap();

    let mut config = store_config(&blocker, RendezvousFileMode::SingleLatest);
    config.max_write_attempts = 2;
    let mut manager = RendezvousManager::new(config, "fp".to_string());

    assert!(!manager.degraded());
    match manager.write_checkpoint(&sample_checkpoint(0, 20, "fp")) {
        Err(RendezvousError::WriteFailure { attempts, .. }) => assert_eq!(attempts, 2),
        other => panic!("expected WriteFailure, got {:?}", other.map(|_| ())),
    }
    assert!(manager.degraded());
}

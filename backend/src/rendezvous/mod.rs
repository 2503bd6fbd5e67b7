//! Rendezvous (checkpoint) management
//!
//! Serializes the full simulation state — scheduler progress, RNG seed,
//! tally aggregates — to durable storage at a configured cadence, and
//! reconstructs it on restart.
//!
//! # Critical Invariants
//!
//! - **Publish-or-discard**: a checkpoint is written to a temporary file
//!   and atomically renamed into place; a crash mid-write leaves the last
//!   good checkpoint untouched and readers never observe a torn file
//! - **Config matching**: state can only be reloaded under the
//!   configuration fingerprint that produced it
//! - **Bounded retries**: write failures are retried with backoff a
//!   configured number of times; an exhausted retry budget degrades
//!   durability but never aborts the run (the tallies are not lost)

pub mod fingerprint;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::events::EventHandlerSnapshot;

pub use fingerprint::{compute_fingerprint, FingerprintInputs};

/// Checkpoint schema version understood by this build
pub const CHECKPOINT_FORMAT_VERSION: u32 = 1;

/// Errors raised by checkpoint storage
#[derive(Debug, Error)]
pub enum RendezvousError {
    /// No checkpoint exists yet. Recoverable: callers fall back to a
    /// fresh run from history 0.
    #[error("no checkpoint found under {}", .0.display())]
    NoCheckpointFound(PathBuf),

    /// The checkpoint was produced under a different configuration.
    /// Fatal; both fingerprints are surfaced for diagnosis.
    #[error("checkpoint fingerprint {found} does not match current configuration {expected}")]
    ConfigurationMismatch { expected: String, found: String },

    #[error("unsupported checkpoint format version {found} (this build reads version {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },

    /// Durable-storage write failed even after bounded retries
    #[error("checkpoint write failed after {attempts} attempt(s): {source}")]
    WriteFailure { attempts: u32, source: io::Error },

    #[error("checkpoint serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("checkpoint read failed: {0}")]
    Io(#[from] io::Error),
}

/// Versioned snapshot of the complete simulation state
///
/// Everything a restart needs: where the scheduler left off, the master
/// seed that keys every history substream, and the full tally aggregates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub format_version: u32,

    /// Identity of the run this checkpoint belongs to
    pub run_id: Uuid,

    /// Rendezvous sequence number within the run
    pub sequence: u64,

    pub written_at: DateTime<Utc>,

    /// Fingerprint of the configuration that produced this state
    pub config_fingerprint: String,

    /// First history index the resumed scheduler should issue
    pub next_history_index: u64,

    pub completed_histories: u64,

    /// Run-level master seed; substreams re-derive from (seed, index)
    pub master_seed: u64,

    /// Complete tally state
    pub event_handler: EventHandlerSnapshot,
}

impl Checkpoint {
    /// Read and parse a checkpoint file, validating the format version
    pub fn load(path: &Path) -> Result<Self, RendezvousError> {
        let contents = fs::read_to_string(path)?;
        let checkpoint: Checkpoint = serde_json::from_str(&contents)?;
        if checkpoint.format_version != CHECKPOINT_FORMAT_VERSION {
            return Err(RendezvousError::UnsupportedVersion {
                found: checkpoint.format_version,
                supported: CHECKPOINT_FORMAT_VERSION,
            });
        }
        Ok(checkpoint)
    }

    /// Reject a checkpoint produced under a different configuration
    pub fn validate_fingerprint(&self, expected: &str) -> Result<(), RendezvousError> {
        if self.config_fingerprint != expected {
            return Err(RendezvousError::ConfigurationMismatch {
                expected: expected.to_string(),
                found: self.config_fingerprint.clone(),
            });
        }
        Ok(())
    }
}

/// When to take a rendezvous
#[derive(Debug, Clone)]
pub enum RendezvousPolicy {
    /// Every `stride` completed histories
    HistoryStride { stride: u64 },
    /// Every `interval` of wall-clock time
    WallClock { interval: Duration },
}

/// How checkpoint files are retained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RendezvousFileMode {
    /// One file, overwritten in place (by rename) on every rendezvous
    SingleLatest,
    /// Every rendezvous kept under its own sequence-numbered name, with a
    /// `latest` pointer file published after each write (audit trail)
    MultipleFiles,
}

/// Checkpoint store configuration
#[derive(Debug, Clone)]
pub struct RendezvousConfig {
    pub directory: PathBuf,
    /// File stem for checkpoint files, e.g. "sphere" → `sphere_00003.json`
    pub basename: String,
    pub policy: RendezvousPolicy,
    pub file_mode: RendezvousFileMode,
    /// Write attempts before durability is declared degraded
    pub max_write_attempts: u32,
    /// Sleep between failed write attempts
    pub retry_backoff: Duration,
}

impl RendezvousConfig {
    /// Conventional defaults for a store rooted at `directory`
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            basename: "rendezvous".to_string(),
            policy: RendezvousPolicy::HistoryStride { stride: 10_000 },
            file_mode: RendezvousFileMode::SingleLatest,
            max_write_attempts: 3,
            retry_backoff: Duration::from_millis(100),
        }
    }

    fn latest_file(&self) -> PathBuf {
        match self.file_mode {
            RendezvousFileMode::SingleLatest => {
                self.directory.join(format!("{}.json", self.basename))
            }
            RendezvousFileMode::MultipleFiles => {
                self.directory.join(format!("{}.latest", self.basename))
            }
        }
    }

    fn sequence_file(&self, sequence: u64) -> PathBuf {
        self.directory
            .join(format!("{}_{:05}.json", self.basename, sequence))
    }
}

/// Writes and reloads checkpoints with publish-by-rename discipline
pub struct RendezvousManager {
    config: RendezvousConfig,
    fingerprint: String,
    sequence: u64,
    last_rendezvous_histories: u64,
    last_rendezvous_at: Instant,
    /// True while the most recent write attempt was abandoned; cleared by
    /// the next successful write
    degraded: bool,
}

impl RendezvousManager {
    pub fn new(config: RendezvousConfig, fingerprint: String) -> Self {
        Self {
            config,
            fingerprint,
            sequence: 0,
            last_rendezvous_histories: 0,
            last_rendezvous_at: Instant::now(),
            degraded: false,
        }
    }

    /// Continue the cadence and numbering recorded in a checkpoint
    pub fn resume_from(&mut self, checkpoint: &Checkpoint) {
        self.sequence = checkpoint.sequence + 1;
        self.last_rendezvous_histories = checkpoint.completed_histories;
        self.last_rendezvous_at = Instant::now();
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// True when the most recent checkpoint write was abandoned
    pub fn degraded(&self) -> bool {
        self.degraded
    }

    /// Is a rendezvous due under the configured policy?
    pub fn should_rendezvous(&self, completed_histories: u64) -> bool {
        match self.config.policy {
            RendezvousPolicy::HistoryStride { stride } => {
                completed_histories >= self.last_rendezvous_histories + stride
            }
            RendezvousPolicy::WallClock { interval } => {
                self.last_rendezvous_at.elapsed() >= interval
            }
        }
    }

    /// Serialize and atomically publish a checkpoint
    ///
    /// The payload is written to a temporary file in the target directory
    /// and renamed into place, so the previous checkpoint stays valid until
    /// the new one is fully durable. In `MultipleFiles` mode the pointer
    /// file is republished the same way after the data file lands.
    pub fn write_checkpoint(&mut self, checkpoint: &Checkpoint) -> Result<PathBuf, RendezvousError> {
        let payload = serde_json::to_string_pretty(checkpoint)?;

        let target = match self.config.file_mode {
            RendezvousFileMode::SingleLatest => self.config.latest_file(),
            RendezvousFileMode::MultipleFiles => self.config.sequence_file(self.sequence),
        };

        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.try_publish(&target, &payload) {
                Ok(()) => break,
                Err(source) => {
                    if attempts >= self.config.max_write_attempts {
                        self.degraded = true;
                        return Err(RendezvousError::WriteFailure { attempts, source });
                    }
                    std::thread::sleep(self.config.retry_backoff);
                }
            }
        }

        self.sequence += 1;
        self.last_rendezvous_histories = checkpoint.completed_histories;
        self.last_rendezvous_at = Instant::now();
        self.degraded = false;
        Ok(target)
    }

    fn try_publish(&self, target: &Path, payload: &str) -> Result<(), io::Error> {
        fs::create_dir_all(&self.config.directory)?;

        let tmp = self
            .config
            .directory
            .join(format!("{}.tmp", self.config.basename));
        fs::write(&tmp, payload)?;
        fs::rename(&tmp, target)?;

        if self.config.file_mode == RendezvousFileMode::MultipleFiles {
            // Pointer names the data file only after the data file is durable
            let file_name = target
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            let pointer_tmp = self
                .config
                .directory
                .join(format!("{}.latest.tmp", self.config.basename));
            fs::write(&pointer_tmp, file_name)?;
            fs::rename(&pointer_tmp, self.config.latest_file())?;
        }
        Ok(())
    }

    /// Load the most recent checkpoint and validate it against the current
    /// configuration
    ///
    /// Fails with [`RendezvousError::NoCheckpointFound`] when the store is
    /// empty — the caller falls back to a fresh run — and with
    /// [`RendezvousError::ConfigurationMismatch`] when the fingerprints
    /// disagree, which aborts before any history is processed.
    pub fn load_latest(
        config: &RendezvousConfig,
        expected_fingerprint: &str,
    ) -> Result<Checkpoint, RendezvousError> {
        let path = match config.file_mode {
            RendezvousFileMode::SingleLatest => config.latest_file(),
            RendezvousFileMode::MultipleFiles => {
                let pointer = config.latest_file();
                if !pointer.exists() {
                    return Err(RendezvousError::NoCheckpointFound(config.directory.clone()));
                }
                let file_name = fs::read_to_string(&pointer)?;
                config.directory.join(file_name.trim())
            }
        };
        if !path.exists() {
            return Err(RendezvousError::NoCheckpointFound(config.directory.clone()));
        }

        let checkpoint = Checkpoint::load(&path)?;
        checkpoint.validate_fingerprint(expected_fingerprint)?;
        Ok(checkpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_stride_policy() {
        let mut config = RendezvousConfig::new("unused");
        config.policy = RendezvousPolicy::HistoryStride { stride: 20 };
        let manager = RendezvousManager::new(config, "fp".to_string());

        assert!(!manager.should_rendezvous(0));
        assert!(!manager.should_rendezvous(19));
        assert!(manager.should_rendezvous(20));
        assert!(manager.should_rendezvous(45));
    }

    #[test]
    fn test_file_naming_by_mode() {
        let mut config = RendezvousConfig::new("/ckpt");
        config.basename = "sphere".to_string();

        assert_eq!(config.latest_file(), PathBuf::from("/ckpt/sphere.json"));
        assert_eq!(
            config.sequence_file(3),
            PathBuf::from("/ckpt/sphere_00003.json")
        );

        config.file_mode = RendezvousFileMode::MultipleFiles;
        assert_eq!(config.latest_file(), PathBuf::from("/ckpt/sphere.latest"));
    }
}

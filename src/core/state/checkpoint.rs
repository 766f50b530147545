//! Durable snapshots of the queue and the held locks.
//!
//! Each checkpoint is one file, `checkpoint-<generation>.json`, written with
//! write-then-rename and sealed with a SHA-256 checksum of its payload. Only the newest
//! `retention` checkpoints are kept. Recovery reads the newest one that validates and
//! falls back to older ones; checkpoints that fail validation are set aside with a
//! `.corrupt` suffix once recovery has moved past them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::file::{SCHEMA_VERSION, read_json, sha256_hex, write_json_atomic};
use crate::core::lock::LockRecord;
use crate::core::queue::QueueState;
use crate::error::CheckpointError;

pub const CHECKPOINTS_DIR: &str = "checkpoints";

/// Default number of checkpoints kept on disk.
pub const DEFAULT_RETENTION: usize = 5;

const FILE_PREFIX: &str = "checkpoint-";
const FILE_SUFFIX: &str = ".json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointPayload {
    pub queue: QueueState,
    pub active_locks: Vec<LockRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub schema_version: u32,
    pub generation: u64,
    pub created_at: DateTime<Utc>,
    pub payload: CheckpointPayload,
    /// Hex SHA-256 of the serialized payload.
    pub checksum: String,
}

impl Checkpoint {
    pub fn seal(generation: u64, payload: CheckpointPayload) -> Self {
        let checksum = payload_checksum(&payload);
        Self {
            schema_version: SCHEMA_VERSION,
            generation,
            created_at: Utc::now(),
            payload,
            checksum,
        }
    }

    /// Checks schema, checksum and payload invariants.
    pub fn validate(&self) -> Result<(), String> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(format!(
                "unsupported schema version {} (expected {})",
                self.schema_version, SCHEMA_VERSION
            ));
        }
        let actual = payload_checksum(&self.payload);
        if actual != self.checksum {
            return Err(format!(
                "checksum mismatch (recorded {}, computed {})",
                self.checksum, actual
            ));
        }
        self.payload.queue.validate()?;

        let mut groups = HashSet::new();
        for lock in &self.payload.active_locks {
            if !groups.insert(lock.resource_group_id.as_str()) {
                return Err(format!(
                    "resource group '{}' has more than one active lock",
                    lock.resource_group_id
                ));
            }
        }
        Ok(())
    }
}

fn payload_checksum(payload: &CheckpointPayload) -> String {
    // Struct fields serialize in declaration order and the payload holds no maps,
    // so the encoding is stable across write and read.
    match serde_json::to_vec(payload) {
        Ok(bytes) => sha256_hex(&bytes),
        Err(_) => String::new(),
    }
}

/// A checkpoint recovery could not use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedCheckpoint {
    pub path: PathBuf,
    pub reason: String,
}

/// The newest usable checkpoint and the newer ones passed over to reach it.
#[derive(Debug, Clone)]
pub struct LoadedCheckpoint {
    pub checkpoint: Checkpoint,
    pub path: PathBuf,
    pub skipped: Vec<SkippedCheckpoint>,
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
    retention: usize,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>, retention: usize) -> Self {
        Self {
            dir: dir.into(),
            retention: retention.max(1),
        }
    }

    pub fn in_dir(state_dir: &Path, retention: usize) -> Self {
        Self::new(state_dir.join(CHECKPOINTS_DIR), retention)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn io(&self, path: &Path, e: impl std::fmt::Display) -> CheckpointError {
        CheckpointError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        }
    }

    fn path_for(&self, generation: u64) -> PathBuf {
        self.dir
            .join(format!("{}{:020}{}", FILE_PREFIX, generation, FILE_SUFFIX))
    }

    /// Retained checkpoints, newest first.
    pub fn list(&self) -> Result<Vec<(u64, PathBuf)>, CheckpointError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.io(&self.dir, e)),
        };

        let mut found: Vec<(u64, PathBuf)> = entries
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                let generation = name
                    .strip_prefix(FILE_PREFIX)?
                    .strip_suffix(FILE_SUFFIX)?
                    .parse::<u64>()
                    .ok()?;
                Some((generation, entry.path()))
            })
            .collect();
        found.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(found)
    }

    /// Seals and writes a new checkpoint, then prunes old ones.
    pub fn write(
        &self,
        queue: &QueueState,
        active_locks: &[LockRecord],
    ) -> Result<Checkpoint, CheckpointError> {
        let generation = self.list()?.first().map(|(g, _)| g + 1).unwrap_or(1);
        let checkpoint = Checkpoint::seal(
            generation,
            CheckpointPayload {
                queue: queue.clone(),
                active_locks: active_locks.to_vec(),
            },
        );
        let path = self.path_for(generation);
        write_json_atomic(&path, &checkpoint).map_err(|e| self.io(&path, format!("{:#}", e)))?;
        debug!(generation, path = %path.display(), "Checkpoint written");

        self.prune()?;
        Ok(checkpoint)
    }

    /// Reads and validates one checkpoint file.
    pub fn load(&self, path: &Path) -> Result<Checkpoint, CheckpointError> {
        let checkpoint: Checkpoint = read_json(path).map_err(|e| CheckpointError::Corrupt {
            path: path.to_path_buf(),
            reason: format!("{:#}", e),
        })?;
        checkpoint
            .validate()
            .map_err(|reason| CheckpointError::Corrupt {
                path: path.to_path_buf(),
                reason,
            })?;
        Ok(checkpoint)
    }

    /// Newest checkpoint that validates.
    ///
    /// Returns `Ok(None)` when no checkpoint exists yet and
    /// [`CheckpointError::NoValidCheckpoint`] when some exist but none validates.
    pub fn latest_valid(&self) -> Result<Option<LoadedCheckpoint>, CheckpointError> {
        let candidates = self.list()?;
        if candidates.is_empty() {
            return Ok(None);
        }

        let mut skipped = Vec::new();
        for (_, path) in &candidates {
            match self.load(path) {
                Ok(checkpoint) => {
                    return Ok(Some(LoadedCheckpoint {
                        checkpoint,
                        path: path.clone(),
                        skipped,
                    }));
                }
                Err(CheckpointError::Corrupt { path, reason }) => {
                    warn!(path = %path.display(), %reason, "Skipping invalid checkpoint");
                    skipped.push(SkippedCheckpoint { path, reason });
                }
                Err(e) => return Err(e),
            }
        }

        Err(CheckpointError::NoValidCheckpoint {
            examined: candidates.len(),
        })
    }

    /// Renames invalid checkpoints out of the retained set.
    pub fn quarantine(&self, skipped: &[SkippedCheckpoint]) -> Result<(), CheckpointError> {
        for entry in skipped {
            let mut target = entry.path.clone().into_os_string();
            target.push(".corrupt");
            fs::rename(&entry.path, &target).map_err(|e| self.io(&entry.path, e))?;
        }
        Ok(())
    }

    /// Deletes all but the newest `retention` checkpoints.
    pub fn prune(&self) -> Result<usize, CheckpointError> {
        let mut removed = 0;
        for (_, path) in self.list()?.into_iter().skip(self.retention) {
            fs::remove_file(&path).map_err(|e| self.io(&path, e))?;
            removed += 1;
        }
        Ok(removed)
    }
}

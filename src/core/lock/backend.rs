//! Storage behind the lock manager.
//!
//! A [`LockBackend`] stores at most one [`LockRecord`] per resource group and performs
//! every check-then-write as a single conditional operation. [`FileLockBackend`] keeps
//! one small JSON record per group and serializes access to it with an exclusive `fs2`
//! advisory lock, which makes the lock visible to every process sharing the state
//! directory.

use chrono::Utc;
use fs2::FileExt;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::warn;

use super::types::{AcquireAttempt, LockRecord, LockRequest};
use crate::core::state::short_hash;
use crate::error::LockError;

/// Conditional storage for lock records.
pub trait LockBackend: Send + Sync + fmt::Debug {
    /// Grants the request if the group is free, otherwise reports the current holder.
    fn try_acquire(&self, request: &LockRequest) -> Result<AcquireAttempt, LockError>;

    /// Waits up to `timeout` for the group to become free and grants the request.
    ///
    /// The default implementation retries [`LockBackend::try_acquire`] every
    /// `poll_interval`.
    fn acquire_blocking(
        &self,
        request: &LockRequest,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<LockRecord, LockError> {
        let started = Instant::now();
        loop {
            if let AcquireAttempt::Granted(record) = self.try_acquire(request)? {
                return Ok(record);
            }
            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return Err(LockError::Timeout {
                    resource_group_id: request.resource_group_id.clone(),
                    waited: elapsed,
                });
            }
            std::thread::sleep(poll_interval.min(timeout - elapsed));
        }
    }

    /// Clears the record if it still carries `token`. Returns whether it did.
    fn release(&self, resource_group_id: &str, token: &str) -> Result<bool, LockError> {
        Ok(self.reclaim(resource_group_id, token)?.is_some())
    }

    /// Current holder of a group.
    fn current(&self, resource_group_id: &str) -> Result<Option<LockRecord>, LockError>;

    /// Every currently held lock.
    fn records(&self) -> Result<Vec<LockRecord>, LockError>;

    /// Renews the record if it still carries `token`. Returns whether it did.
    fn heartbeat(&self, resource_group_id: &str, token: &str) -> Result<bool, LockError>;

    /// Clears the record if it still carries `token` and returns what was removed.
    fn reclaim(&self, resource_group_id: &str, token: &str)
    -> Result<Option<LockRecord>, LockError>;
}

/// How a read-modify-write leaves the record file.
enum RecordWrite {
    Keep,
    Set(LockRecord),
    Clear,
}

/// Backend storing one record file per group under a directory.
///
/// Files are never deleted: an empty file means the group is free. A record that
/// cannot be parsed (torn by a holder that crashed mid-write) also counts as free.
#[derive(Debug, Clone)]
pub struct FileLockBackend {
    dir: PathBuf,
}

impl FileLockBackend {
    /// Creates a backend rooted at `dir`, creating the directory if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, LockError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| LockError::Storage {
            path: dir.clone(),
            message: e.to_string(),
        })?;
        Ok(Self { dir })
    }

    /// Directory holding the record files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Record file for a group: `<id>-<hash>.lock`.
    ///
    /// The hash keeps ids that differ only in case apart on case-insensitive filesystems.
    pub fn path_for(&self, resource_group_id: &str) -> PathBuf {
        self.dir.join(format!(
            "{}-{}.lock",
            resource_group_id,
            short_hash(resource_group_id.as_bytes())
        ))
    }

    /// Runs `f` on the group's record while holding the file's exclusive lock.
    fn update<T>(
        &self,
        resource_group_id: &str,
        f: impl FnOnce(Option<LockRecord>) -> (RecordWrite, T),
    ) -> Result<T, LockError> {
        let path = self.path_for(resource_group_id);
        let storage = |e: std::io::Error| LockError::Storage {
            path: path.clone(),
            message: e.to_string(),
        };

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(storage)?;
        file.lock_exclusive().map_err(storage)?;

        let result = (|| {
            let current = read_record(&mut file, &path).map_err(storage)?;
            let (write, value) = f(current);
            match write {
                RecordWrite::Keep => {}
                RecordWrite::Set(record) => {
                    let json = serde_json::to_vec(&record).map_err(|e| LockError::Storage {
                        path: path.clone(),
                        message: e.to_string(),
                    })?;
                    file.set_len(0).map_err(storage)?;
                    file.seek(SeekFrom::Start(0)).map_err(storage)?;
                    file.write_all(&json).map_err(storage)?;
                    file.sync_data().map_err(storage)?;
                }
                RecordWrite::Clear => {
                    file.set_len(0).map_err(storage)?;
                    file.sync_data().map_err(storage)?;
                }
            }
            Ok(value)
        })();

        let _ = FileExt::unlock(&file);
        result
    }
}

fn read_record(file: &mut File, path: &Path) -> std::io::Result<Option<LockRecord>> {
    let mut content = String::new();
    file.seek(SeekFrom::Start(0))?;
    file.read_to_string(&mut content)?;
    if content.trim().is_empty() {
        return Ok(None);
    }
    match serde_json::from_str(&content) {
        Ok(record) => Ok(Some(record)),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Unreadable lock record, treating group as free");
            Ok(None)
        }
    }
}

impl LockBackend for FileLockBackend {
    fn try_acquire(&self, request: &LockRequest) -> Result<AcquireAttempt, LockError> {
        self.update(&request.resource_group_id, |current| match current {
            Some(holder) => (RecordWrite::Keep, AcquireAttempt::Held(holder)),
            None => {
                let record = request.grant(Utc::now());
                (
                    RecordWrite::Set(record.clone()),
                    AcquireAttempt::Granted(record),
                )
            }
        })
    }

    fn current(&self, resource_group_id: &str) -> Result<Option<LockRecord>, LockError> {
        let path = self.path_for(resource_group_id);
        if !path.exists() {
            return Ok(None);
        }
        self.update(resource_group_id, |current| (RecordWrite::Keep, current))
    }

    fn records(&self) -> Result<Vec<LockRecord>, LockError> {
        let entries = fs::read_dir(&self.dir).map_err(|e| LockError::Storage {
            path: self.dir.clone(),
            message: e.to_string(),
        })?;

        let mut records = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("lock") {
                continue;
            }
            let storage = |e: std::io::Error| LockError::Storage {
                path: path.clone(),
                message: e.to_string(),
            };
            let mut file = File::open(&path).map_err(storage)?;
            file.lock_shared().map_err(storage)?;
            let record = read_record(&mut file, &path);
            let _ = FileExt::unlock(&file);
            if let Some(record) = record.map_err(storage)? {
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.resource_group_id.cmp(&b.resource_group_id));
        Ok(records)
    }

    fn heartbeat(&self, resource_group_id: &str, token: &str) -> Result<bool, LockError> {
        self.update(resource_group_id, |current| match current {
            Some(mut record) if record.token == token => {
                record.heartbeat_at = Utc::now();
                (RecordWrite::Set(record), true)
            }
            _ => (RecordWrite::Keep, false),
        })
    }

    fn reclaim(
        &self,
        resource_group_id: &str,
        token: &str,
    ) -> Result<Option<LockRecord>, LockError> {
        self.update(resource_group_id, |current| match current {
            Some(record) if record.token == token => (RecordWrite::Clear, Some(record)),
            _ => (RecordWrite::Keep, None),
        })
    }
}

//! Persistent queue document.
//!
//! The whole queue lives in one JSON file, replaced atomically on every change. Writers
//! serialize on an exclusive `fs2` lock over a sibling `queue.lock` file, so enqueueing
//! never waits on the integration lock and never interleaves with the processor.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use super::request::{MergeRequest, RequestStatus};
use crate::core::state::{SCHEMA_VERSION, read_json, write_json_atomic};
use crate::error::QueueError;

pub const QUEUE_FILE: &str = "queue.json";
pub const QUEUE_LOCK_FILE: &str = "queue.lock";

/// Contents of the queue file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueState {
    pub schema_version: u32,
    /// Sequence number the next submission receives.
    pub next_sequence: u64,
    /// Latest `enqueued_at` handed out; positions are strictly increasing.
    #[serde(default)]
    pub last_enqueued_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub requests: Vec<MergeRequest>,
}

impl Default for QueueState {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            next_sequence: 1,
            last_enqueued_at: None,
            requests: Vec::new(),
        }
    }
}

impl QueueState {
    /// Takes the next submission sequence number.
    pub fn take_sequence(&mut self) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        sequence
    }

    /// A tail position strictly after every position handed out so far.
    pub fn next_enqueued_at(&mut self, now: DateTime<Utc>) -> DateTime<Utc> {
        let position = match self.last_enqueued_at {
            Some(last) if now <= last => last + ChronoDuration::nanoseconds(1),
            _ => now,
        };
        self.last_enqueued_at = Some(position);
        position
    }

    pub fn get(&self, id: &str) -> Option<&MergeRequest> {
        self.requests.iter().find(|r| r.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Result<&mut MergeRequest, QueueError> {
        self.requests
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| QueueError::NotFound { id: id.to_string() })
    }

    /// Waiting requests in dequeue order.
    pub fn waiting(&self) -> Vec<&MergeRequest> {
        let mut waiting: Vec<&MergeRequest> = self
            .requests
            .iter()
            .filter(|r| r.status == RequestStatus::Queued)
            .collect();
        waiting.sort_by(|a, b| {
            a.enqueued_at
                .cmp(&b.enqueued_at)
                .then(a.sequence.cmp(&b.sequence))
        });
        waiting
    }

    /// 1-based position among waiting requests.
    pub fn position_of(&self, id: &str) -> Option<usize> {
        self.waiting()
            .iter()
            .position(|r| r.id == id)
            .map(|i| i + 1)
    }

    /// Drops finished requests beyond the newest `retain`, newest by last update.
    ///
    /// Returns the removed ids. Sequence numbers are not reused, so ids stay unique.
    pub fn compact(&mut self, retain: usize) -> Vec<String> {
        let mut finished: Vec<&MergeRequest> = self
            .requests
            .iter()
            .filter(|r| r.status.is_terminal())
            .collect();
        if finished.len() <= retain {
            return Vec::new();
        }
        finished.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then(b.sequence.cmp(&a.sequence))
        });
        let dropped: HashSet<String> = finished[retain..].iter().map(|r| r.id.clone()).collect();
        let removed = self
            .requests
            .iter()
            .filter(|r| dropped.contains(&r.id))
            .map(|r| r.id.clone())
            .collect();
        self.requests.retain(|r| !dropped.contains(&r.id));
        removed
    }

    /// Structural checks shared by the live file and checkpoints.
    pub fn validate(&self) -> Result<(), String> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(format!(
                "unsupported schema version {} (expected {})",
                self.schema_version, SCHEMA_VERSION
            ));
        }
        let mut ids = HashSet::new();
        for request in &self.requests {
            if !ids.insert(request.id.as_str()) {
                return Err(format!("duplicate request id '{}'", request.id));
            }
            if request.sequence >= self.next_sequence {
                return Err(format!(
                    "request '{}' has sequence {} beyond next sequence {}",
                    request.id, request.sequence, self.next_sequence
                ));
            }
            if request.status.is_in_flight() && request.owner_pid.is_none() {
                return Err(format!(
                    "request '{}' is {} without an owner",
                    request.id, request.status
                ));
            }
        }
        let merging = self
            .requests
            .iter()
            .filter(|r| r.status == RequestStatus::Merging)
            .count();
        if merging > 1 {
            return Err(format!("{} requests are MERGING at once", merging));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct QueueStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl QueueStore {
    /// Store at its standard location inside `state_dir`.
    pub fn in_dir(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join(QUEUE_FILE),
            lock_path: state_dir.join(QUEUE_LOCK_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    fn storage(&self, path: &Path, e: impl std::fmt::Display) -> QueueError {
        QueueError::Storage {
            path: path.to_path_buf(),
            message: e.to_string(),
        }
    }

    /// Runs `f` while holding the queue's storage lock.
    fn locked<T>(&self, exclusive: bool, f: impl FnOnce() -> Result<T, QueueError>) -> Result<T, QueueError> {
        if let Some(parent) = self.lock_path.parent() {
            fs::create_dir_all(parent).map_err(|e| self.storage(parent, e))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.lock_path)
            .map_err(|e| self.storage(&self.lock_path, e))?;
        let locked = if exclusive {
            file.lock_exclusive()
        } else {
            file.lock_shared()
        };
        locked.map_err(|e| self.storage(&self.lock_path, e))?;
        let result = f();
        let _ = FileExt::unlock(&file);
        result
    }

    fn read_unlocked(&self) -> Result<QueueState, QueueError> {
        if !self.path.exists() {
            return Ok(QueueState::default());
        }
        let state: QueueState = read_json(&self.path).map_err(|e| QueueError::Corrupt {
            path: self.path.clone(),
            message: format!("{:#}", e),
        })?;
        state.validate().map_err(|message| QueueError::Corrupt {
            path: self.path.clone(),
            message,
        })?;
        Ok(state)
    }

    /// Reads a consistent snapshot. A missing file is an empty queue.
    pub fn load(&self) -> Result<QueueState, QueueError> {
        self.locked(false, || self.read_unlocked())
    }

    /// Read-modify-write under the exclusive lock. Nothing is written if `f` fails.
    pub fn update<T>(
        &self,
        f: impl FnOnce(&mut QueueState) -> Result<T, QueueError>,
    ) -> Result<T, QueueError> {
        self.locked(true, || {
            let mut state = self.read_unlocked()?;
            let value = f(&mut state)?;
            write_json_atomic(&self.path, &state).map_err(|e| self.storage(&self.path, format!("{:#}", e)))?;
            Ok(value)
        })
    }

    /// Overwrites the queue wholesale, even if the current file is unreadable.
    pub fn replace(&self, state: &QueueState) -> Result<(), QueueError> {
        self.locked(true, || {
            write_json_atomic(&self.path, state).map_err(|e| self.storage(&self.path, format!("{:#}", e)))
        })
    }
}

//! Value types shared by the lock manager, its backends and the registry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::core::process::current_pid;
use crate::error::LockError;

/// Resource group guarding the integrate-and-advance step of the merge queue.
pub const INTEGRATION_GROUP: &str = "integration";

/// Resource group held by the single active queue processor.
pub const QUEUE_PROCESSOR_GROUP: &str = "queue-processor";

/// Longest accepted resource group id.
pub const MAX_GROUP_ID_LEN: usize = 128;

static TOKEN_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Checks that a resource group id is usable as a lock name.
///
/// Ids must be non-empty, at most [`MAX_GROUP_ID_LEN`] characters and use only
/// ASCII letters, digits, `.`, `_` and `-`. Returns the rejection reason.
pub fn check_group_id(id: &str) -> Result<(), String> {
    if id.is_empty() {
        return Err("must not be empty".to_string());
    }
    if id.len() > MAX_GROUP_ID_LEN {
        return Err(format!("longer than {} characters", MAX_GROUP_ID_LEN));
    }
    if let Some(c) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
    {
        return Err(format!("contains forbidden character '{}'", c));
    }
    if id == "." || id == ".." {
        return Err("must not be a relative path component".to_string());
    }
    Ok(())
}

pub(crate) fn validate_group_id(id: &str) -> Result<(), LockError> {
    check_group_id(id).map_err(|reason| LockError::InvalidGroupId {
        id: id.to_string(),
        reason,
    })
}

/// Lifecycle state of one lock acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockState {
    /// Held by a live holder.
    Active,
    /// Released by its holder.
    Released,
    /// Reclaimed by the monitor after exceeding the age ceiling.
    TimedOut,
    /// Reclaimed because the holder process no longer exists.
    OrphanReclaimed,
}

impl LockState {
    /// Returns the upper-case name used in the registry and reports.
    pub fn as_str(self) -> &'static str {
        match self {
            LockState::Active => "ACTIVE",
            LockState::Released => "RELEASED",
            LockState::TimedOut => "TIMED_OUT",
            LockState::OrphanReclaimed => "ORPHAN_RECLAIMED",
        }
    }
}

impl std::fmt::Display for LockState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a would-be holder, passed to a backend when acquiring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRequest {
    /// Group to lock.
    pub resource_group_id: String,
    /// Unique token for this acquisition.
    pub token: String,
    /// Pid of the requesting process.
    pub holder_pid: u32,
}

impl LockRequest {
    /// Creates a request on behalf of the current process with a fresh token.
    pub fn new(resource_group_id: impl Into<String>) -> Self {
        let holder_pid = current_pid();
        Self {
            resource_group_id: resource_group_id.into(),
            token: new_token(holder_pid),
            holder_pid,
        }
    }

    /// Builds the record a backend stores when the request is granted.
    pub fn grant(&self, now: DateTime<Utc>) -> LockRecord {
        LockRecord {
            resource_group_id: self.resource_group_id.clone(),
            token: self.token.clone(),
            holder_pid: self.holder_pid,
            acquired_at: now,
            heartbeat_at: now,
        }
    }
}

/// Tokens are unique across processes (pid, clock) and within one (counter).
fn new_token(pid: u32) -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let seq = TOKEN_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{}-{:x}-{}", pid, nanos, seq)
}

/// The current holder of a resource group, as stored by a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub resource_group_id: String,
    pub token: String,
    pub holder_pid: u32,
    pub acquired_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
}

impl LockRecord {
    /// Most recent sign of life from the holder.
    pub fn last_seen(&self) -> DateTime<Utc> {
        self.acquired_at.max(self.heartbeat_at)
    }

    /// Time since the holder last acquired or renewed the lock.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_seen()).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Outcome of a single non-blocking acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireAttempt {
    /// The lock was free and is now held by the request.
    Granted(LockRecord),
    /// Someone else holds the lock.
    Held(LockRecord),
}

/// Caller-side reference to a held lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockHandle {
    pub resource_group_id: String,
    pub token: String,
    pub holder_pid: u32,
    pub acquired_at: DateTime<Utc>,
}

impl From<&LockRecord> for LockHandle {
    fn from(record: &LockRecord) -> Self {
        Self {
            resource_group_id: record.resource_group_id.clone(),
            token: record.token.clone(),
            holder_pid: record.holder_pid,
            acquired_at: record.acquired_at,
        }
    }
}

/// Current holder as reported by [`LockStatus`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockHolder {
    pub pid: u32,
    pub token: String,
    pub acquired_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
    /// Seconds since the last acquire or heartbeat.
    pub age_secs: u64,
}

/// Answer to "who holds this group, and for how long".
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockStatus {
    pub resource_group_id: String,
    /// `None` when the group is free.
    pub holder: Option<LockHolder>,
}

impl LockStatus {
    pub fn free(resource_group_id: impl Into<String>) -> Self {
        Self {
            resource_group_id: resource_group_id.into(),
            holder: None,
        }
    }

    pub fn from_record(record: &LockRecord, now: DateTime<Utc>) -> Self {
        Self {
            resource_group_id: record.resource_group_id.clone(),
            holder: Some(LockHolder {
                pid: record.holder_pid,
                token: record.token.clone(),
                acquired_at: record.acquired_at,
                heartbeat_at: record.heartbeat_at,
                age_secs: record.age(now).as_secs(),
            }),
        }
    }

    pub fn is_active(&self) -> bool {
        self.holder.is_some()
    }
}

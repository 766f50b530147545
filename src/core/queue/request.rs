//! Merge requests and the state machine that moves them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::process::current_pid;
use crate::error::{ErrorKind, QueueError};

/// Status of a merge request.
///
/// `MERGED`, `FAILED` and `REJECTED` are final. `MANUAL_REQUIRED` waits for a caller to
/// resolve it, or ages out to `FAILED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    Submitted,
    Queued,
    ConflictCheck,
    Merging,
    RebasePending,
    Merged,
    Failed,
    Rejected,
    ManualRequired,
}

impl RequestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestStatus::Submitted => "SUBMITTED",
            RequestStatus::Queued => "QUEUED",
            RequestStatus::ConflictCheck => "CONFLICT_CHECK",
            RequestStatus::Merging => "MERGING",
            RequestStatus::RebasePending => "REBASE_PENDING",
            RequestStatus::Merged => "MERGED",
            RequestStatus::Failed => "FAILED",
            RequestStatus::Rejected => "REJECTED",
            RequestStatus::ManualRequired => "MANUAL_REQUIRED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestStatus::Merged | RequestStatus::Failed | RequestStatus::Rejected
        )
    }

    /// Statuses only the queue processor holds a request in.
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            RequestStatus::ConflictCheck | RequestStatus::Merging | RequestStatus::RebasePending
        )
    }

    /// Whether the state machine has an edge from `self` to `to`.
    pub fn can_transition_to(self, to: RequestStatus) -> bool {
        use RequestStatus::*;
        matches!(
            (self, to),
            (Submitted, Queued | Rejected)
                | (Queued, ConflictCheck)
                | (
                    ConflictCheck,
                    Merging | RebasePending | ManualRequired | Merged | Failed | Queued
                )
                | (Merging, Merged | Failed | Queued)
                | (RebasePending, Queued | Failed | ManualRequired)
                | (ManualRequired, Queued | Failed)
        )
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a request is not (yet) merged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestError {
    pub kind: ErrorKind,
    pub message: String,
}

impl RequestError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// One recorded status change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: RequestStatus,
    pub to: RequestStatus,
    pub at: DateTime<Utc>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeRequest {
    pub id: String,
    /// Submission order, used to break `enqueued_at` ties.
    pub sequence: u64,
    pub source_ref: String,
    pub target_ref: String,
    pub status: RequestStatus,
    pub submitted_at: DateTime<Utc>,
    /// Queue position key; refreshed when the request goes back to the tail.
    pub enqueued_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<RequestError>,
    /// Processor pid while the request is in flight.
    #[serde(default)]
    pub owner_pid: Option<u32>,
    #[serde(default)]
    pub manual_since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub merged_commit: Option<String>,
    #[serde(default)]
    pub history: Vec<Transition>,
}

impl MergeRequest {
    pub fn new(
        sequence: u64,
        source_ref: impl Into<String>,
        target_ref: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: format!("mr-{}", sequence),
            sequence,
            source_ref: source_ref.into(),
            target_ref: target_ref.into(),
            status: RequestStatus::Submitted,
            submitted_at: now,
            enqueued_at: now,
            updated_at: now,
            attempts: 0,
            last_error: None,
            owner_pid: None,
            manual_since: None,
            merged_commit: None,
            history: Vec::new(),
        }
    }

    /// Moves the request along a state-machine edge and records it.
    ///
    /// Keeps `owner_pid` only while in flight and `manual_since` only while waiting for
    /// manual resolution.
    pub fn transition(
        &mut self,
        to: RequestStatus,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        if !self.status.can_transition_to(to) {
            return Err(QueueError::InvalidTransition {
                id: self.id.clone(),
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.history.push(Transition {
            from: self.status,
            to,
            at: now,
            reason: reason.into(),
        });
        self.status = to;
        self.updated_at = now;
        if to.is_in_flight() {
            self.owner_pid = Some(current_pid());
        } else {
            self.owner_pid = None;
        }
        self.manual_since = (to == RequestStatus::ManualRequired).then_some(now);
        Ok(())
    }

    /// Like [`MergeRequest::transition`], also recording why.
    pub fn transition_with_error(
        &mut self,
        to: RequestStatus,
        error: RequestError,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        self.transition(to, error.message.clone(), now)?;
        self.last_error = Some(error);
        Ok(())
    }

    /// Time since the request last entered the queue, for waiting requests.
    pub fn waiting_for(&self, now: DateTime<Utc>) -> Option<std::time::Duration> {
        (self.status == RequestStatus::Queued)
            .then(|| (now - self.enqueued_at).to_std().unwrap_or_default())
    }
}

//! Crash-safe FIFO merge queue.
//!
//! [`MergeQueue`] is the caller-facing side: it validates and enqueues submissions,
//! reports positions and outcomes, and hands manually resolved requests back to the
//! queue. [`QueueProcessor`] is the single writer that dequeues and integrates.
//!
//! Submitting never takes the integration lock; the queue file has its own storage lock
//! held only for the duration of one read-modify-write.

mod processor;
mod request;
mod store;

pub use processor::{
    DEFAULT_MANUAL_RESIDENCY, DEFAULT_RETRY_CEILING, ProcessorSettings, QueueProcessor,
    RunSummary, StepOutcome,
};
pub use request::{MergeRequest, RequestError, RequestStatus, Transition};
pub use store::{QUEUE_FILE, QUEUE_LOCK_FILE, QueueState, QueueStore};

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::core::repository::Repository;
use crate::error::{ErrorKind, QueueError};

/// A request with its current place in line.
#[derive(Debug, Clone, Serialize)]
pub struct QueueEntry {
    #[serde(flatten)]
    pub request: MergeRequest,
    /// 1-based position among waiting requests.
    pub position: Option<usize>,
    /// Time since the request last entered the queue.
    #[serde(rename = "waiting_secs", serialize_with = "as_secs")]
    pub waiting_for: Option<Duration>,
}

fn as_secs<S: serde::Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(d) => s.serialize_some(&d.as_secs()),
        None => s.serialize_none(),
    }
}

#[derive(Debug, Clone)]
pub struct MergeQueue {
    store: QueueStore,
    repo: Arc<dyn Repository>,
}

impl MergeQueue {
    pub fn new(store: QueueStore, repo: Arc<dyn Repository>) -> Self {
        Self { store, repo }
    }

    pub fn store(&self) -> &QueueStore {
        &self.store
    }

    /// Records a submission and validates it.
    ///
    /// Valid submissions are `QUEUED` at the tail; invalid ones are kept as `REJECTED`
    /// with the reason, so the caller can still look the request up by id.
    pub fn submit(&self, source_ref: &str, target_ref: &str) -> Result<MergeRequest, QueueError> {
        let problem = self.validate(source_ref, target_ref);
        let request = self.store.update(|state| {
            let now = Utc::now();
            let sequence = state.take_sequence();
            let mut request = MergeRequest::new(sequence, source_ref, target_ref, now);
            match &problem {
                None => {
                    request.enqueued_at = state.next_enqueued_at(now);
                    request.transition(RequestStatus::Queued, "submitted", now)?;
                }
                Some(reason) => request.transition_with_error(
                    RequestStatus::Rejected,
                    RequestError::new(ErrorKind::ValidationFailed, reason.clone()),
                    now,
                )?,
            }
            state.requests.push(request.clone());
            Ok(request)
        })?;

        match &problem {
            None => info!(id = %request.id, source = source_ref, target = target_ref, "Merge request queued"),
            Some(reason) => warn!(id = %request.id, %reason, "Merge request rejected"),
        }
        Ok(request)
    }

    fn validate(&self, source_ref: &str, target_ref: &str) -> Option<String> {
        if source_ref.trim().is_empty() || target_ref.trim().is_empty() {
            return Some("source and target must both be named".to_string());
        }
        if source_ref == target_ref {
            return Some(format!("source and target are both '{}'", source_ref));
        }
        for reference in [source_ref, target_ref] {
            if let Err(e) = crate::git::validate_reference(reference) {
                return Some(e.to_string());
            }
            if let Err(e) = self.repo.resolve(reference) {
                return Some(e.to_string());
            }
        }
        None
    }

    /// Sends a `MANUAL_REQUIRED` request back to the tail of the queue.
    pub fn resolve_manual(&self, id: &str) -> Result<MergeRequest, QueueError> {
        let request = self.store.update(|state| {
            let now = Utc::now();
            let enqueued_at = state.next_enqueued_at(now);
            let request = state.get_mut(id)?;
            if request.status != RequestStatus::ManualRequired {
                return Err(QueueError::InvalidTransition {
                    id: id.to_string(),
                    from: request.status.to_string(),
                    to: RequestStatus::Queued.to_string(),
                });
            }
            request.transition(RequestStatus::Queued, "resolved manually", now)?;
            request.attempts += 1;
            request.enqueued_at = enqueued_at;
            Ok(request.clone())
        })?;
        info!(%id, attempts = request.attempts, "Manual resolution accepted; requeued");
        Ok(request)
    }

    /// Every request, waiting ones first in dequeue order, the rest by submission.
    pub fn status(&self) -> Result<Vec<QueueEntry>, QueueError> {
        let state = self.store.load()?;
        let now = Utc::now();
        let waiting = state.waiting();
        let mut entries: Vec<QueueEntry> = waiting
            .iter()
            .enumerate()
            .map(|(i, request)| QueueEntry {
                request: (*request).clone(),
                position: Some(i + 1),
                waiting_for: request.waiting_for(now),
            })
            .collect();

        let mut rest: Vec<&MergeRequest> = state
            .requests
            .iter()
            .filter(|r| r.status != RequestStatus::Queued)
            .collect();
        rest.sort_by_key(|r| r.sequence);
        entries.extend(rest.into_iter().map(|request| QueueEntry {
            request: request.clone(),
            position: None,
            waiting_for: None,
        }));
        Ok(entries)
    }

    /// Current state of one request.
    pub fn outcome(&self, id: &str) -> Result<MergeRequest, QueueError> {
        self.store
            .load()?
            .get(id)
            .cloned()
            .ok_or_else(|| QueueError::NotFound { id: id.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::repository::testing::FakeRepository;
    use tempfile::TempDir;

    fn queue(branches: &[&str]) -> (TempDir, MergeQueue) {
        let dir = TempDir::new().unwrap();
        let repo = Arc::new(FakeRepository::with_branches(branches));
        let queue = MergeQueue::new(QueueStore::in_dir(dir.path()), repo);
        (dir, queue)
    }

    /// # Submission Queues At The Tail
    ///
    /// ## Test Scenario
    /// - Submits two valid requests
    ///
    /// ## Expected Outcome
    /// - Sequential ids, both QUEUED, positions 1 and 2
    #[test]
    fn test_submission_queues_at_tail() {
        let (_dir, queue) = queue(&["main", "a", "b"]);
        let first = queue.submit("a", "main").unwrap();
        let second = queue.submit("b", "main").unwrap();

        assert_eq!(first.id, "mr-1");
        assert_eq!(second.id, "mr-2");
        assert_eq!(second.status, RequestStatus::Queued);
        assert!(second.enqueued_at > first.enqueued_at);

        let positions: Vec<(String, Option<usize>)> = queue
            .status()
            .unwrap()
            .into_iter()
            .map(|e| (e.request.id, e.position))
            .collect();
        assert_eq!(
            positions,
            vec![("mr-1".to_string(), Some(1)), ("mr-2".to_string(), Some(2))]
        );
    }

    /// # Invalid Submissions Are Rejected But Recorded
    ///
    /// ## Test Scenario
    /// - Submits an unknown branch, a self-merge, and a malformed name
    ///
    /// ## Expected Outcome
    /// - Each is REJECTED with VALIDATION_FAILED and has no queue position
    #[test]
    fn test_invalid_submissions_rejected() {
        let (_dir, queue) = queue(&["main", "a"]);
        for (source, target) in [("ghost", "main"), ("main", "main"), ("a;rm", "main")] {
            let request = queue.submit(source, target).unwrap();
            assert_eq!(request.status, RequestStatus::Rejected, "{}", source);
            assert_eq!(
                request.last_error.map(|e| e.kind),
                Some(ErrorKind::ValidationFailed)
            );
        }
        assert!(queue.status().unwrap().iter().all(|e| e.position.is_none()));
    }

    /// # Resolve Requires Manual Status
    ///
    /// ## Test Scenario
    /// - Resolves a QUEUED request and an unknown id
    ///
    /// ## Expected Outcome
    /// - `InvalidTransition` and `NotFound`
    #[test]
    fn test_resolve_requires_manual_status() {
        let (_dir, queue) = queue(&["main", "a"]);
        queue.submit("a", "main").unwrap();

        assert!(matches!(
            queue.resolve_manual("mr-1"),
            Err(QueueError::InvalidTransition { .. })
        ));
        assert!(matches!(
            queue.resolve_manual("mr-9"),
            Err(QueueError::NotFound { .. })
        ));
    }

    /// # Outcome Of Unknown Request
    ///
    /// ## Test Scenario
    /// - Looks up an id that was never submitted
    ///
    /// ## Expected Outcome
    /// - `NotFound`
    #[test]
    fn test_outcome_unknown() {
        let (_dir, queue) = queue(&["main"]);
        assert!(matches!(
            queue.outcome("mr-1"),
            Err(QueueError::NotFound { .. })
        ));
    }
}

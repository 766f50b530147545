//! The single-writer dequeue loop.
//!
//! One step takes the oldest waiting request and drives it to its next resting status:
//!
//! ```text
//! QUEUED -> CONFLICT_CHECK -> MERGING -> MERGED | FAILED | QUEUED (integration lock busy)
//!                          -> REBASE_PENDING -> QUEUED (tail) | MANUAL_REQUIRED | FAILED
//!                          -> MANUAL_REQUIRED | MERGED (already integrated) | FAILED
//! ```
//!
//! Only one processor runs at a time across all processes; [`QueueProcessor::run`] holds
//! the `queue-processor` lock for its whole duration and renews it between steps.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::request::{MergeRequest, RequestError, RequestStatus};
use super::store::{QueueState, QueueStore};
use crate::core::conflict::precheck::{DEFAULT_AUTO_REBASE_MAX_FILES, precheck};
use crate::core::conflict::{AuditLog, PrecheckVerdict, Resolution};
use crate::core::lock::{INTEGRATION_GROUP, LockManager, QUEUE_PROCESSOR_GROUP};
use crate::core::process::current_pid;
use crate::core::repository::{RebaseOutcome, Repository};
use crate::core::state::CheckpointStore;
use crate::error::{ErrorKind, GuardedError, LockError, QueueError};

/// Default number of conflicting attempts before a request fails.
pub const DEFAULT_RETRY_CEILING: u32 = 3;

/// Default number of finished requests kept in the queue file.
pub const DEFAULT_TERMINAL_RETENTION: usize = 200;

/// Default time a request may wait for manual resolution.
pub const DEFAULT_MANUAL_RESIDENCY: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    /// How long the integrate step waits for the integration lock.
    pub integration_timeout: Duration,
    pub retry_ceiling: u32,
    pub manual_residency: Duration,
    pub auto_rebase_max_files: usize,
    /// Minimum time between checkpoints while running.
    pub checkpoint_interval: Duration,
    /// MERGED, FAILED and REJECTED requests kept for outcome lookups.
    pub terminal_retention: usize,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self {
            integration_timeout: Duration::from_secs(30),
            retry_ceiling: DEFAULT_RETRY_CEILING,
            manual_residency: DEFAULT_MANUAL_RESIDENCY,
            auto_rebase_max_files: DEFAULT_AUTO_REBASE_MAX_FILES,
            checkpoint_interval: Duration::from_secs(60),
            terminal_retention: DEFAULT_TERMINAL_RETENTION,
        }
    }
}

/// What one step did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepOutcome {
    /// Nothing was waiting.
    Idle,
    Merged { id: String, commit: String },
    AlreadyIntegrated { id: String },
    /// Rebased and back at the tail.
    Requeued { id: String, attempts: u32 },
    ManualRequired { id: String, kind: ErrorKind },
    Failed { id: String, kind: ErrorKind },
    /// Put back in place because the integration lock was not available.
    Deferred { id: String, reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub steps: Vec<StepOutcome>,
    /// Requests failed for staying in manual resolution too long.
    pub expired: Vec<String>,
    /// Finished requests dropped from the queue file.
    pub compacted: Vec<String>,
    pub checkpoints_written: usize,
}

#[derive(Debug, Clone)]
pub struct QueueProcessor {
    store: QueueStore,
    locks: LockManager,
    repo: Arc<dyn Repository>,
    audit: Option<AuditLog>,
    checkpoints: Option<CheckpointStore>,
    settings: ProcessorSettings,
}

impl QueueProcessor {
    pub fn new(
        store: QueueStore,
        locks: LockManager,
        repo: Arc<dyn Repository>,
        settings: ProcessorSettings,
    ) -> Self {
        Self {
            store,
            locks,
            repo,
            audit: None,
            checkpoints: None,
            settings,
        }
    }

    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn with_checkpoints(mut self, checkpoints: CheckpointStore) -> Self {
        self.checkpoints = Some(checkpoints);
        self
    }

    /// Processes requests until the queue is empty, a step is deferred, or `max_steps`
    /// steps have run.
    ///
    /// Fails with [`QueueError::ProcessorBusy`] if another processor is running.
    pub fn run(&self, max_steps: Option<usize>) -> Result<RunSummary, QueueError> {
        let guard = self
            .locks
            .try_acquire(QUEUE_PROCESSOR_GROUP)
            .map_err(|e| match e {
                LockError::Busy { holder_pid, .. } => QueueError::ProcessorBusy { holder_pid },
                other => QueueError::Lock(other),
            })?;
        info!("Queue processor started");
        let reclaimed = self.reclaim_own()?;
        if !reclaimed.is_empty() {
            warn!(ids = ?reclaimed, "Requeued requests left in flight by an aborted step");
        }

        let mut summary = RunSummary::default();
        let mut last_checkpoint = Instant::now();
        loop {
            if max_steps.is_some_and(|max| summary.steps.len() >= max) {
                break;
            }
            summary.expired.extend(self.expire_manual(Utc::now())?);

            let outcome = self.step()?;
            let stop = matches!(outcome, StepOutcome::Idle | StepOutcome::Deferred { .. });
            if outcome != StepOutcome::Idle {
                summary.steps.push(outcome);
            }

            if !guard.heartbeat()? {
                warn!("Queue processor lock was reclaimed; stopping");
                break;
            }
            if last_checkpoint.elapsed() >= self.settings.checkpoint_interval {
                summary.checkpoints_written += self.checkpoint()?;
                last_checkpoint = Instant::now();
            }
            if stop {
                break;
            }
        }

        summary.compacted = self.compact()?;
        if !summary.steps.is_empty() || !summary.expired.is_empty() {
            summary.checkpoints_written += self.checkpoint()?;
        }
        guard.release()?;
        info!(
            steps = summary.steps.len(),
            expired = summary.expired.len(),
            "Queue processor finished"
        );
        Ok(summary)
    }

    /// Writes a checkpoint if a checkpoint store is configured. Returns how many were written.
    pub fn checkpoint(&self) -> Result<usize, QueueError> {
        let Some(checkpoints) = &self.checkpoints else {
            return Ok(0);
        };
        let queue = self.store.load()?;
        let locks = self.locks.backend().records()?;
        checkpoints.write(&queue, &locks)?;
        Ok(1)
    }

    /// Trims finished requests down to the retention limit.
    pub fn compact(&self) -> Result<Vec<String>, QueueError> {
        let retain = self.settings.terminal_retention;
        let finished = self
            .store
            .load()?
            .requests
            .iter()
            .filter(|r| r.status.is_terminal())
            .count();
        if finished <= retain {
            return Ok(Vec::new());
        }
        let removed = self.store.update(|state| Ok(state.compact(retain)))?;
        debug!(removed = removed.len(), retain, "Compacted finished requests");
        Ok(removed)
    }

    /// Requeues requests this process still owns in flight. Holding the processor lock
    /// means no step is running, so such requests were stranded by an earlier failed one.
    fn reclaim_own(&self) -> Result<Vec<String>, QueueError> {
        let pid = current_pid();
        let stranded =
            |request: &MergeRequest| request.status.is_in_flight() && request.owner_pid == Some(pid);
        if !self.store.load()?.requests.iter().any(stranded) {
            return Ok(Vec::new());
        }
        self.store.update(|state| {
            let mut reclaimed = Vec::new();
            for request in state.requests.iter_mut().filter(|r| stranded(r)) {
                request.transition_with_error(
                    RequestStatus::Queued,
                    RequestError::new(ErrorKind::OwnerLost, "left in flight by an aborted step"),
                    Utc::now(),
                )?;
                request.attempts += 1;
                reclaimed.push(request.id.clone());
            }
            Ok(reclaimed)
        })
    }

    /// Fails manual requests that have waited longer than the residency limit.
    pub fn expire_manual(&self, now: DateTime<Utc>) -> Result<Vec<String>, QueueError> {
        let residency = chrono::Duration::from_std(self.settings.manual_residency)
            .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
        let is_expired = |request: &MergeRequest| {
            request.status == RequestStatus::ManualRequired
                && request
                    .manual_since
                    .is_some_and(|since| now - since >= residency)
        };

        if !self.store.load()?.requests.iter().any(is_expired) {
            return Ok(Vec::new());
        }

        let hours = self.settings.manual_residency.as_secs() / 3600;
        self.store.update(|state| {
            let mut expired = Vec::new();
            for request in state.requests.iter_mut().filter(|r| is_expired(r)) {
                request.transition_with_error(
                    RequestStatus::Failed,
                    RequestError::new(
                        ErrorKind::ManualResidencyExpired,
                        format!("not resolved within {}h", hours),
                    ),
                    now,
                )?;
                warn!(id = %request.id, "Manual resolution window expired");
                expired.push(request.id.clone());
            }
            Ok(expired)
        })
    }

    /// Drives the oldest waiting request to its next resting status.
    pub fn step(&self) -> Result<StepOutcome, QueueError> {
        let Some(request) = self.dequeue()? else {
            return Ok(StepOutcome::Idle);
        };
        debug!(id = %request.id, source = %request.source_ref, target = %request.target_ref, "Dequeued");

        let id = request.id.clone();
        self.advance(request).inspect_err(|e| self.abandon(&id, e))
    }

    fn advance(&self, request: MergeRequest) -> Result<StepOutcome, QueueError> {
        let verdict = match precheck(
            self.repo.as_ref(),
            &request.source_ref,
            &request.target_ref,
            self.settings.auto_rebase_max_files,
        ) {
            Ok(verdict) => verdict,
            Err(e) => {
                return self.fail(&request.id, ErrorKind::PrecheckFailed, e.to_string());
            }
        };
        if let Some(audit) = &self.audit {
            audit.record_dynamic(
                &request.id,
                &request.source_ref,
                &request.target_ref,
                &verdict,
            );
        }

        match verdict {
            PrecheckVerdict::Clean => self.integrate(&request),
            PrecheckVerdict::AlreadyIntegrated => {
                let tip = self.repo.resolve(&request.target_ref).ok();
                self.apply(&request.id, |_, r| {
                    r.transition(RequestStatus::Merged, "already integrated", Utc::now())?;
                    r.merged_commit = tip;
                    Ok(())
                })?;
                info!(id = %request.id, "Source already integrated");
                Ok(StepOutcome::AlreadyIntegrated { id: request.id })
            }
            PrecheckVerdict::Conflicted {
                files, resolution, ..
            } => {
                let paths: Vec<&str> = files.iter().map(|f| f.path.as_str()).collect();
                if request.attempts >= self.settings.retry_ceiling {
                    return self.fail(
                        &request.id,
                        ErrorKind::RetryCeilingExceeded,
                        format!(
                            "still conflicting after {} attempts: {}",
                            request.attempts,
                            paths.join(", ")
                        ),
                    );
                }
                match resolution {
                    Resolution::AutoRebase => {
                        self.apply(&request.id, |_, r| {
                            r.transition(
                                RequestStatus::RebasePending,
                                format!("content conflicts in {}", paths.join(", ")),
                                Utc::now(),
                            )
                        })?;
                        self.rebase(&request)
                    }
                    Resolution::ManualRequired => self.to_manual(
                        &request.id,
                        ErrorKind::ConflictDetected,
                        format!(
                            "{} conflicting file(s): {}",
                            paths.len(),
                            paths.join(", ")
                        ),
                    ),
                }
            }
        }
    }

    fn dequeue(&self) -> Result<Option<MergeRequest>, QueueError> {
        self.store.update(|state| {
            let Some(id) = state.waiting().first().map(|r| r.id.clone()) else {
                return Ok(None);
            };
            let request = state.get_mut(&id)?;
            request.transition(RequestStatus::ConflictCheck, "dequeued", Utc::now())?;
            Ok(Some(request.clone()))
        })
    }

    fn integrate(&self, request: &MergeRequest) -> Result<StepOutcome, QueueError> {
        self.apply(&request.id, |_, r| {
            r.transition(RequestStatus::Merging, "precheck clean", Utc::now())
        })?;

        let message = format!(
            "Merge {} into {} ({})",
            request.source_ref, request.target_ref, request.id
        );
        let result = self.locks.execute_guarded(
            INTEGRATION_GROUP,
            self.settings.integration_timeout,
            |_| {
                let tip = self.repo.resolve(&request.target_ref)?;
                self.repo
                    .integrate(&request.source_ref, &request.target_ref, &tip, &message)
            },
        );

        match result {
            Ok(commit) => {
                self.apply(&request.id, |_, r| {
                    r.transition(
                        RequestStatus::Merged,
                        format!("integrated as {}", commit),
                        Utc::now(),
                    )?;
                    r.merged_commit = Some(commit.clone());
                    Ok(())
                })?;
                info!(id = %request.id, %commit, "Merged");
                Ok(StepOutcome::Merged {
                    id: request.id.clone(),
                    commit,
                })
            }
            Err(GuardedError::Lock(e @ (LockError::Timeout { .. } | LockError::Busy { .. }))) => {
                let kind = match e {
                    LockError::Busy { .. } => ErrorKind::LockBusy,
                    _ => ErrorKind::LockTimeout,
                };
                let reason = e.to_string();
                self.requeue_in_place(&request.id, RequestError::new(kind, reason.clone()))?;
                info!(id = %request.id, %reason, "Integration deferred");
                Ok(StepOutcome::Deferred {
                    id: request.id.clone(),
                    reason,
                })
            }
            Err(GuardedError::Lock(e)) => {
                self.requeue_in_place(
                    &request.id,
                    RequestError::new(ErrorKind::LockTimeout, e.to_string()),
                )?;
                Err(QueueError::Lock(e))
            }
            Err(GuardedError::Operation(e)) => {
                self.fail(&request.id, ErrorKind::IntegrationFailed, e.to_string())
            }
        }
    }

    fn rebase(&self, request: &MergeRequest) -> Result<StepOutcome, QueueError> {
        match self.repo.rebase(&request.source_ref, &request.target_ref) {
            Ok(RebaseOutcome::Rebased { new_head }) => {
                let updated = self.apply(&request.id, |state, r| {
                    let now = Utc::now();
                    r.transition(
                        RequestStatus::Queued,
                        format!("rebased onto {} at {}", request.target_ref, new_head),
                        now,
                    )?;
                    r.attempts += 1;
                    r.enqueued_at = state.next_enqueued_at(now);
                    Ok(())
                })?;
                info!(id = %request.id, attempts = updated.attempts, "Rebased and requeued");
                Ok(StepOutcome::Requeued {
                    id: updated.id,
                    attempts: updated.attempts,
                })
            }
            Ok(RebaseOutcome::Conflicted { files }) => self.to_manual(
                &request.id,
                ErrorKind::RebaseFailed,
                format!("rebase conflicted in {}", files.join(", ")),
            ),
            Err(e) => self.fail(&request.id, ErrorKind::RebaseFailed, e.to_string()),
        }
    }

    /// Applies `f` to one request inside a queue update and returns the result.
    fn apply(
        &self,
        id: &str,
        f: impl FnOnce(&mut QueueState, &mut MergeRequest) -> Result<(), QueueError>,
    ) -> Result<MergeRequest, QueueError> {
        self.store.update(|state| {
            let mut request = state.get_mut(id)?.clone();
            f(state, &mut request)?;
            *state.get_mut(id)? = request.clone();
            Ok(request)
        })
    }

    fn requeue_in_place(&self, id: &str, error: RequestError) -> Result<(), QueueError> {
        self.apply(id, |_, r| {
            r.transition_with_error(RequestStatus::Queued, error, Utc::now())?;
            r.attempts += 1;
            Ok(())
        })
        .map(|_| ())
    }

    /// Best-effort requeue after a step failed part way; a request left in flight here is
    /// picked up by the next [`QueueProcessor::run`] in this process.
    fn abandon(&self, id: &str, cause: &QueueError) {
        let error = RequestError::new(
            ErrorKind::OwnerLost,
            format!("processing step aborted: {}", cause),
        );
        let result = self.apply(id, |_, r| {
            if r.status.is_in_flight() {
                r.transition_with_error(RequestStatus::Queued, error, Utc::now())?;
                r.attempts += 1;
            }
            Ok(())
        });
        match result {
            Ok(request) => warn!(%id, %cause, status = %request.status, "Processing step aborted"),
            Err(e) => warn!(%id, %cause, error = %e, "Processing step aborted; request left in flight"),
        }
    }

    fn to_manual(
        &self,
        id: &str,
        kind: ErrorKind,
        message: String,
    ) -> Result<StepOutcome, QueueError> {
        self.apply(id, |_, r| {
            r.transition_with_error(
                RequestStatus::ManualRequired,
                RequestError::new(kind, message.clone()),
                Utc::now(),
            )
        })?;
        info!(%id, %kind, %message, "Manual resolution required");
        Ok(StepOutcome::ManualRequired {
            id: id.to_string(),
            kind,
        })
    }

    fn fail(&self, id: &str, kind: ErrorKind, message: String) -> Result<StepOutcome, QueueError> {
        self.apply(id, |_, r| {
            r.transition_with_error(
                RequestStatus::Failed,
                RequestError::new(kind, message.clone()),
                Utc::now(),
            )
        })?;
        warn!(%id, %kind, %message, "Merge request failed");
        Ok(StepOutcome::Failed {
            id: id.to_string(),
            kind,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::lock::{LockState, MemoryLockBackend, Registry};
    use crate::core::queue::MergeQueue;
    use crate::core::repository::testing::{FakeRepository, RebaseScript};
    use crate::core::repository::{ConflictKind, DryRunMerge, FileConflict};
    use crate::error::GitError;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        repo: Arc<FakeRepository>,
        queue: MergeQueue,
        locks: LockManager,
        processor: QueueProcessor,
    }

    fn fixture(branches: &[&str], settings: ProcessorSettings) -> Fixture {
        let dir = TempDir::new().unwrap();
        let repo = Arc::new(FakeRepository::with_branches(branches));
        let store = QueueStore::in_dir(dir.path());
        let locks = LockManager::new(
            Arc::new(MemoryLockBackend::new()),
            Registry::in_dir(dir.path()),
        );
        let queue = MergeQueue::new(store.clone(), repo.clone());
        let processor = QueueProcessor::new(store, locks.clone(), repo.clone(), settings)
            .with_audit(AuditLog::in_dir(dir.path()))
            .with_checkpoints(CheckpointStore::in_dir(dir.path(), 5));
        Fixture {
            _dir: dir,
            repo,
            queue,
            locks,
            processor,
        }
    }

    fn content(path: &str) -> FileConflict {
        FileConflict::new(path, ConflictKind::Content)
    }

    /// # FIFO Integration Order
    ///
    /// Verifies that clean requests merge in submission order.
    ///
    /// ## Test Scenario
    /// - Submits three clean branches and runs the processor
    ///
    /// ## Expected Outcome
    /// - All three are MERGED, integrated in submission order
    /// - The integration and processor locks are free afterwards
    #[test]
    fn test_fifo_integration_order() {
        let fx = fixture(&["main", "a", "b", "c"], ProcessorSettings::default());
        for branch in ["a", "b", "c"] {
            fx.queue.submit(branch, "main").unwrap();
        }

        let summary = fx.processor.run(None).unwrap();

        assert_eq!(summary.steps.len(), 3);
        assert_eq!(fx.repo.integrated(), vec!["a", "b", "c"]);
        for id in ["mr-1", "mr-2", "mr-3"] {
            assert_eq!(fx.queue.outcome(id).unwrap().status, RequestStatus::Merged);
        }
        assert!(!fx.locks.status(INTEGRATION_GROUP).unwrap().is_active());
        assert!(!fx.locks.status(QUEUE_PROCESSOR_GROUP).unwrap().is_active());
        assert_eq!(summary.checkpoints_written, 1);
    }

    /// # Auto Rebase Moves Request To Tail
    ///
    /// ## Test Scenario
    /// - `a` conflicts once on a single content file; `b` is clean
    /// - Runs one step, then the rest
    ///
    /// ## Expected Outcome
    /// - The first step rebases `a` and requeues it behind `b` with one attempt
    /// - `b` merges before `a`
    #[test]
    fn test_auto_rebase_moves_to_tail() {
        let fx = fixture(&["main", "a", "b"], ProcessorSettings::default());
        fx.repo.script_dry_runs("a", vec![vec![content("src/lib.rs")]]);
        fx.queue.submit("a", "main").unwrap();
        fx.queue.submit("b", "main").unwrap();

        let first = fx.processor.step().unwrap();
        assert_eq!(
            first,
            StepOutcome::Requeued {
                id: "mr-1".to_string(),
                attempts: 1
            }
        );
        let waiting: Vec<String> = fx
            .queue
            .status()
            .unwrap()
            .into_iter()
            .filter_map(|e| e.position.map(|_| e.request.id))
            .collect();
        assert_eq!(waiting, vec!["mr-2", "mr-1"]);

        fx.processor.run(None).unwrap();
        assert_eq!(fx.repo.integrated(), vec!["b", "a"]);
    }

    /// # Retry Ceiling Bounds Attempts
    ///
    /// Verifies that a request that keeps conflicting fails after exactly the ceiling.
    ///
    /// ## Test Scenario
    /// - `a` conflicts on every precheck; rebases always succeed; ceiling is 3
    ///
    /// ## Expected Outcome
    /// - Three requeues, then FAILED with RETRY_CEILING_EXCEEDED and three attempts
    #[test]
    fn test_retry_ceiling_bounds_attempts() {
        let fx = fixture(&["main", "a"], ProcessorSettings::default());
        fx.repo
            .script_dry_runs("a", vec![vec![content("src/lib.rs")]; 10]);
        fx.queue.submit("a", "main").unwrap();

        let summary = fx.processor.run(None).unwrap();

        let requeues = summary
            .steps
            .iter()
            .filter(|s| matches!(s, StepOutcome::Requeued { .. }))
            .count();
        assert_eq!(requeues, 3);
        let request = fx.queue.outcome("mr-1").unwrap();
        assert_eq!(request.status, RequestStatus::Failed);
        assert_eq!(request.attempts, 3);
        assert_eq!(
            request.last_error.map(|e| e.kind),
            Some(ErrorKind::RetryCeilingExceeded)
        );
    }

    /// # Structural Conflict Needs Manual Resolution
    ///
    /// ## Test Scenario
    /// - `a` has a modify/delete conflict
    /// - After the step, the caller resolves it and the next precheck is clean
    ///
    /// ## Expected Outcome
    /// - MANUAL_REQUIRED with CONFLICT_DETECTED
    /// - After resolution it is requeued with one attempt and merges
    #[test]
    fn test_structural_conflict_needs_manual() {
        let fx = fixture(&["main", "a"], ProcessorSettings::default());
        fx.repo.script_dry_runs(
            "a",
            vec![vec![FileConflict::new("old.rs", ConflictKind::ModifyDelete)]],
        );
        fx.queue.submit("a", "main").unwrap();

        let outcome = fx.processor.step().unwrap();
        assert_eq!(
            outcome,
            StepOutcome::ManualRequired {
                id: "mr-1".to_string(),
                kind: ErrorKind::ConflictDetected
            }
        );

        let resolved = fx.queue.resolve_manual("mr-1").unwrap();
        assert_eq!(resolved.status, RequestStatus::Queued);
        assert_eq!(resolved.attempts, 1);

        fx.processor.run(None).unwrap();
        assert_eq!(fx.queue.outcome("mr-1").unwrap().status, RequestStatus::Merged);
    }

    /// # Conflicted Rebase Needs Manual Resolution
    ///
    /// ## Test Scenario
    /// - `a` conflicts on one content file; its rebase conflicts as well
    ///
    /// ## Expected Outcome
    /// - MANUAL_REQUIRED with REBASE_FAILED
    #[test]
    fn test_conflicted_rebase_needs_manual() {
        let fx = fixture(&["main", "a"], ProcessorSettings::default());
        fx.repo.script_dry_runs("a", vec![vec![content("x.rs")]]);
        fx.repo
            .script_rebases("a", vec![RebaseScript::Conflict(vec!["x.rs".to_string()])]);
        fx.queue.submit("a", "main").unwrap();

        assert_eq!(
            fx.processor.step().unwrap(),
            StepOutcome::ManualRequired {
                id: "mr-1".to_string(),
                kind: ErrorKind::RebaseFailed
            }
        );
    }

    /// # Rebase Error Fails Request
    ///
    /// ## Test Scenario
    /// - `a` conflicts on one content file; its rebase errors out
    ///
    /// ## Expected Outcome
    /// - FAILED with REBASE_FAILED
    #[test]
    fn test_rebase_error_fails_request() {
        let fx = fixture(&["main", "a"], ProcessorSettings::default());
        fx.repo.script_dry_runs("a", vec![vec![content("x.rs")]]);
        fx.repo
            .script_rebases("a", vec![RebaseScript::Fail("worktree vanished".to_string())]);
        fx.queue.submit("a", "main").unwrap();

        assert_eq!(
            fx.processor.step().unwrap(),
            StepOutcome::Failed {
                id: "mr-1".to_string(),
                kind: ErrorKind::RebaseFailed
            }
        );
    }

    /// # Integration Failure Is Final
    ///
    /// ## Test Scenario
    /// - `a` is clean but its integration errors; `b` is clean
    ///
    /// ## Expected Outcome
    /// - `a` FAILED with INTEGRATION_FAILED, not retried; `b` still merges
    /// - The integration lock was released despite the failure
    #[test]
    fn test_integration_failure_is_final() {
        let fx = fixture(&["main", "a", "b"], ProcessorSettings::default());
        fx.repo.fail_integration("a");
        fx.queue.submit("a", "main").unwrap();
        fx.queue.submit("b", "main").unwrap();

        fx.processor.run(None).unwrap();

        let a = fx.queue.outcome("mr-1").unwrap();
        assert_eq!(a.status, RequestStatus::Failed);
        assert_eq!(a.attempts, 0);
        assert_eq!(a.last_error.map(|e| e.kind), Some(ErrorKind::IntegrationFailed));
        assert_eq!(fx.repo.integrated(), vec!["b"]);

        let released = fx
            .locks
            .registry()
            .history(INTEGRATION_GROUP)
            .unwrap()
            .iter()
            .filter(|e| e.state == LockState::Released)
            .count();
        assert_eq!(released, 2);
    }

    /// # Busy Integration Lock Defers In Place
    ///
    /// ## Test Scenario
    /// - Holds the integration lock, submits two requests, runs with a short timeout
    ///
    /// ## Expected Outcome
    /// - The run stops after one deferred step
    /// - The first request is QUEUED at position 1 with one attempt and LOCK_TIMEOUT
    #[test]
    fn test_busy_integration_lock_defers() {
        let fx = fixture(
            &["main", "a", "b"],
            ProcessorSettings {
                integration_timeout: Duration::from_millis(20),
                ..ProcessorSettings::default()
            },
        );
        let _held = fx.locks.try_acquire(INTEGRATION_GROUP).unwrap();
        fx.queue.submit("a", "main").unwrap();
        fx.queue.submit("b", "main").unwrap();

        let summary = fx.processor.run(None).unwrap();

        assert_eq!(summary.steps.len(), 1);
        assert!(matches!(summary.steps[0], StepOutcome::Deferred { .. }));
        let entry = fx
            .queue
            .status()
            .unwrap()
            .into_iter()
            .find(|e| e.request.id == "mr-1")
            .unwrap();
        assert_eq!(entry.position, Some(1));
        assert_eq!(entry.request.attempts, 1);
        assert_eq!(
            entry.request.last_error.map(|e| e.kind),
            Some(ErrorKind::LockTimeout)
        );
    }

    /// # Already Integrated Source Merges Without Commit
    ///
    /// ## Test Scenario
    /// - `a` was merged into `main` outside the queue
    ///
    /// ## Expected Outcome
    /// - MERGED via the already-integrated edge, no integration performed
    #[test]
    fn test_already_integrated() {
        let fx = fixture(&["main", "a"], ProcessorSettings::default());
        fx.repo.merge_externally("a", "main");
        fx.queue.submit("a", "main").unwrap();

        assert_eq!(
            fx.processor.step().unwrap(),
            StepOutcome::AlreadyIntegrated {
                id: "mr-1".to_string()
            }
        );
        assert!(fx.repo.integrated().is_empty());
    }

    /// # Manual Residency Expires
    ///
    /// ## Test Scenario
    /// - Puts a request in MANUAL_REQUIRED with a one-hour residency
    /// - Expires as of two hours later
    ///
    /// ## Expected Outcome
    /// - FAILED with MANUAL_RESIDENCY_EXPIRED
    #[test]
    fn test_manual_residency_expires() {
        let fx = fixture(
            &["main", "a"],
            ProcessorSettings {
                manual_residency: Duration::from_secs(3600),
                ..ProcessorSettings::default()
            },
        );
        fx.repo.script_dry_runs(
            "a",
            vec![vec![FileConflict::new("x", ConflictKind::AddAdd)]],
        );
        fx.queue.submit("a", "main").unwrap();
        fx.processor.step().unwrap();

        assert!(fx.processor.expire_manual(Utc::now()).unwrap().is_empty());
        let expired = fx
            .processor
            .expire_manual(Utc::now() + chrono::Duration::hours(2))
            .unwrap();

        assert_eq!(expired, vec!["mr-1".to_string()]);
        let request = fx.queue.outcome("mr-1").unwrap();
        assert_eq!(request.status, RequestStatus::Failed);
        assert_eq!(
            request.last_error.map(|e| e.kind),
            Some(ErrorKind::ManualResidencyExpired)
        );
    }

    /// # Finished Requests Are Compacted
    ///
    /// ## Test Scenario
    /// - Retention of two; one rejected submission, three clean merges and one request
    ///   that ends in manual resolution
    ///
    /// ## Expected Outcome
    /// - The two oldest finished requests are dropped from the queue file
    /// - Retained outcomes and the manual request can still be looked up
    #[test]
    fn test_finished_requests_compacted() {
        let fx = fixture(
            &["main", "a", "b", "c", "d"],
            ProcessorSettings {
                terminal_retention: 2,
                ..ProcessorSettings::default()
            },
        );
        fx.repo.script_dry_runs(
            "d",
            vec![vec![FileConflict::new("x", ConflictKind::AddAdd)]],
        );
        assert_eq!(
            fx.queue.submit("ghost", "main").unwrap().status,
            RequestStatus::Rejected
        );
        for branch in ["a", "b", "d", "c"] {
            fx.queue.submit(branch, "main").unwrap();
        }

        let summary = fx.processor.run(None).unwrap();

        assert_eq!(summary.compacted, vec!["mr-1".to_string(), "mr-2".to_string()]);
        assert!(matches!(
            fx.queue.outcome("mr-1"),
            Err(QueueError::NotFound { .. })
        ));
        assert_eq!(fx.queue.outcome("mr-3").unwrap().status, RequestStatus::Merged);
        assert_eq!(fx.queue.outcome("mr-5").unwrap().status, RequestStatus::Merged);
        assert_eq!(
            fx.queue.outcome("mr-4").unwrap().status,
            RequestStatus::ManualRequired
        );
        assert_eq!(fx.queue.submit("a", "main").unwrap().id, "mr-6");
    }

    /// Repository whose first integration blocks the queue file's next atomic write.
    #[derive(Debug)]
    struct BlockedWrite {
        inner: FakeRepository,
        blocker: std::path::PathBuf,
        armed: std::sync::atomic::AtomicBool,
    }

    impl Repository for BlockedWrite {
        fn resolve(&self, reference: &str) -> Result<String, GitError> {
            self.inner.resolve(reference)
        }

        fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool, GitError> {
            self.inner.is_ancestor(ancestor, descendant)
        }

        fn dry_run_merge(&self, source: &str, target: &str) -> Result<DryRunMerge, GitError> {
            self.inner.dry_run_merge(source, target)
        }

        fn rebase(&self, source: &str, onto: &str) -> Result<RebaseOutcome, GitError> {
            self.inner.rebase(source, onto)
        }

        fn integrate(
            &self,
            source: &str,
            target: &str,
            expected_tip: &str,
            message: &str,
        ) -> Result<String, GitError> {
            let commit = self.inner.integrate(source, target, expected_tip, message)?;
            if self.armed.swap(false, std::sync::atomic::Ordering::SeqCst) {
                std::fs::create_dir_all(&self.blocker).unwrap();
            }
            Ok(commit)
        }
    }

    /// # Aborted Step Does Not Strand The Request
    ///
    /// ## Test Scenario
    /// - `a` integrates, then the queue write recording MERGED fails; `b` waits behind it
    /// - The write failure is cleared and the processor runs again
    ///
    /// ## Expected Outcome
    /// - The first run returns the storage error and its lock is free again
    /// - The second run requeues `a`, sees it already integrated and merges `b`
    /// - `a` is integrated only once
    #[test]
    fn test_aborted_step_requeued_on_next_run() {
        let dir = TempDir::new().unwrap();
        let blocker = dir
            .path()
            .join(format!("{}.tmp-{}", crate::core::queue::store::QUEUE_FILE, std::process::id()));
        let repo = Arc::new(BlockedWrite {
            inner: FakeRepository::with_branches(&["main", "a", "b"]),
            blocker: blocker.clone(),
            armed: std::sync::atomic::AtomicBool::new(true),
        });
        let store = QueueStore::in_dir(dir.path());
        let locks = LockManager::new(
            Arc::new(MemoryLockBackend::new()),
            Registry::in_dir(dir.path()),
        );
        let queue = MergeQueue::new(store.clone(), repo.clone());
        let processor =
            QueueProcessor::new(store, locks.clone(), repo.clone(), ProcessorSettings::default());
        queue.submit("a", "main").unwrap();
        queue.submit("b", "main").unwrap();

        assert!(matches!(
            processor.run(None),
            Err(QueueError::Storage { .. })
        ));
        let stranded = queue.outcome("mr-1").unwrap();
        assert_eq!(stranded.status, RequestStatus::Merging);
        assert_eq!(stranded.owner_pid, Some(std::process::id()));
        assert!(!locks.status(QUEUE_PROCESSOR_GROUP).unwrap().is_active());

        std::fs::remove_dir(&blocker).unwrap();
        let summary = processor.run(None).unwrap();

        assert_eq!(
            summary.steps[0],
            StepOutcome::AlreadyIntegrated {
                id: "mr-1".to_string()
            }
        );
        let a = queue.outcome("mr-1").unwrap();
        assert_eq!(a.status, RequestStatus::Merged);
        assert_eq!(a.attempts, 1);
        assert_eq!(a.owner_pid, None);
        assert_eq!(queue.outcome("mr-2").unwrap().status, RequestStatus::Merged);
        assert_eq!(repo.inner.integrated(), vec!["a", "b"]);
    }

    /// # Second Processor Is Refused
    ///
    /// ## Test Scenario
    /// - Holds the queue-processor lock and runs the processor
    ///
    /// ## Expected Outcome
    /// - `ProcessorBusy`
    #[test]
    fn test_second_processor_refused() {
        let fx = fixture(&["main"], ProcessorSettings::default());
        let _running = fx.locks.try_acquire(QUEUE_PROCESSOR_GROUP).unwrap();

        assert!(matches!(
            fx.processor.run(None),
            Err(QueueError::ProcessorBusy { .. })
        ));
    }
}

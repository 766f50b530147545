//! Startup reconciliation after a crash.
//!
//! [`RecoverySupervisor::recover`] brings the durable state back to something the queue
//! processor can run on:
//!
//! 1. find the newest checkpoint that validates, falling back to older ones
//! 2. restore the queue file from it if the live file is unreadable
//! 3. put requests whose owning process is gone back in line, at their old position
//! 4. reclaim locks whose holder is gone
//! 5. set invalid checkpoints aside and write a fresh one
//!
//! Every step only acts on state left behind by dead processes, so running recovery
//! again right away finds nothing to do.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::core::lock::LockManager;
use crate::core::monitor::{DeadlockMonitor, ReclaimedLock};
use crate::core::process::ProcessProbe;
use crate::core::queue::{QueueStore, RequestError, RequestStatus};
use crate::core::state::{CheckpointStore, SkippedCheckpoint};
use crate::error::{ErrorKind, QueueError, TrunklineError};

/// A request put back in line because its owner died.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequeuedRequest {
    pub id: String,
    /// Status it was stranded in.
    pub previous_status: RequestStatus,
    pub owner_pid: Option<u32>,
    pub attempts: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Generation of the checkpoint recovery started from, if any existed.
    pub checkpoint_generation: Option<u64>,
    /// Newer checkpoints that failed validation and were set aside.
    pub skipped_checkpoints: Vec<SkippedCheckpoint>,
    /// Whether the live queue file was replaced from the checkpoint.
    pub queue_restored: bool,
    pub reclaimed_locks: Vec<ReclaimedLock>,
    pub requeued_requests: Vec<RequeuedRequest>,
    /// Generation of the checkpoint written at the end.
    pub new_checkpoint: Option<u64>,
}

impl RecoveryReport {
    /// True when recovery found nothing to repair.
    pub fn is_clean(&self) -> bool {
        self.skipped_checkpoints.is_empty()
            && !self.queue_restored
            && self.reclaimed_locks.is_empty()
            && self.requeued_requests.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct RecoverySupervisor {
    store: QueueStore,
    locks: LockManager,
    checkpoints: CheckpointStore,
    probe: Arc<dyn ProcessProbe>,
}

impl RecoverySupervisor {
    pub fn new(
        store: QueueStore,
        locks: LockManager,
        checkpoints: CheckpointStore,
        probe: Arc<dyn ProcessProbe>,
    ) -> Self {
        Self {
            store,
            locks,
            checkpoints,
            probe,
        }
    }

    /// Reconciles queue, locks and checkpoints.
    ///
    /// Fails with `CheckpointError::NoValidCheckpoint` when checkpoints exist but none
    /// validates; the queue must not be processed until an operator intervenes.
    pub fn recover(&self) -> Result<RecoveryReport, TrunklineError> {
        let mut report = RecoveryReport::default();

        let loaded = self.checkpoints.latest_valid().inspect_err(|e| {
            error!(error = %e, "Recovery halted: no usable checkpoint");
        })?;
        if let Some(loaded) = &loaded {
            report.checkpoint_generation = Some(loaded.checkpoint.generation);
            report.skipped_checkpoints = loaded.skipped.clone();
        }

        match self.store.load() {
            Ok(_) => {}
            Err(QueueError::Corrupt { path, message }) => {
                let Some(loaded) = &loaded else {
                    error!(path = %path.display(), %message, "Queue file is corrupt and no checkpoint exists");
                    return Err(QueueError::Corrupt { path, message }.into());
                };
                warn!(
                    path = %path.display(),
                    %message,
                    generation = loaded.checkpoint.generation,
                    "Restoring queue from checkpoint"
                );
                self.store.replace(&loaded.checkpoint.payload.queue)?;
                report.queue_restored = true;
            }
            Err(e) => return Err(e.into()),
        }

        report.requeued_requests = self.requeue_stranded()?;

        // Age is not judged here; the running monitor owns that policy.
        let monitor = DeadlockMonitor::new(
            self.locks.clone(),
            Arc::clone(&self.probe),
            Duration::MAX,
        );
        report.reclaimed_locks = monitor.reclaim_orphans()?.reclaimed;

        self.checkpoints.quarantine(&report.skipped_checkpoints)?;
        let queue = self.store.load()?;
        let locks = self.locks.backend().records()?;
        let written = self.checkpoints.write(&queue, &locks)?;
        report.new_checkpoint = Some(written.generation);

        if report.is_clean() {
            info!(generation = written.generation, "Recovery found nothing to repair");
        } else {
            warn!(
                restored = report.queue_restored,
                skipped = report.skipped_checkpoints.len(),
                reclaimed = report.reclaimed_locks.len(),
                requeued = report.requeued_requests.len(),
                "Recovery repaired state"
            );
        }
        Ok(report)
    }

    /// In-flight requests whose owner is gone go back to `QUEUED` at their old position.
    fn requeue_stranded(&self) -> Result<Vec<RequeuedRequest>, QueueError> {
        let is_stranded = |status: RequestStatus, owner: Option<u32>| {
            status.is_in_flight() && owner.is_none_or(|pid| !self.probe.is_alive(pid))
        };
        let state = self.store.load()?;
        if !state
            .requests
            .iter()
            .any(|r| is_stranded(r.status, r.owner_pid))
        {
            return Ok(Vec::new());
        }

        self.store.update(|state| {
            let now = Utc::now();
            let mut requeued = Vec::new();
            for request in state
                .requests
                .iter_mut()
                .filter(|r| is_stranded(r.status, r.owner_pid))
            {
                let previous_status = request.status;
                let owner_pid = request.owner_pid;
                let message = match owner_pid {
                    Some(pid) => format!("owning process {} died during {}", pid, previous_status),
                    None => format!("no owner recorded during {}", previous_status),
                };
                request.transition_with_error(
                    RequestStatus::Queued,
                    RequestError::new(ErrorKind::OwnerLost, message),
                    now,
                )?;
                request.attempts += 1;
                warn!(id = %request.id, status = %previous_status, ?owner_pid, "Requeued stranded request");
                requeued.push(RequeuedRequest {
                    id: request.id.clone(),
                    previous_status,
                    owner_pid,
                    attempts: request.attempts,
                });
            }
            Ok(requeued)
        })
    }
}

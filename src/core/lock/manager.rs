//! Caller-facing lock API.

use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::backend::{FileLockBackend, LockBackend};
use super::registry::{Registry, RegistryEntry};
use super::types::{
    AcquireAttempt, LockHandle, LockRecord, LockRequest, LockState, LockStatus, validate_group_id,
};
use crate::error::{GuardedError, LockError};

/// Directory holding lock records inside the state directory.
pub const LOCKS_DIR: &str = "locks";

/// Default delay between attempts while waiting for a file-backed lock.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Exclusive locks over named resource groups.
///
/// Cloning is cheap; clones share the backend and the registry.
#[derive(Debug, Clone)]
pub struct LockManager {
    backend: Arc<dyn LockBackend>,
    registry: Registry,
    poll_interval: Duration,
}

impl LockManager {
    pub fn new(backend: Arc<dyn LockBackend>, registry: Registry) -> Self {
        Self {
            backend,
            registry,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Manager over `<state_dir>/locks` and `<state_dir>/registry.jsonl`.
    pub fn file_backed(state_dir: &Path) -> Result<Self, LockError> {
        let backend = FileLockBackend::new(state_dir.join(LOCKS_DIR))?;
        Ok(Self::new(Arc::new(backend), Registry::in_dir(state_dir)))
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn backend(&self) -> &Arc<dyn LockBackend> {
        &self.backend
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Blocks up to `timeout` for the group; fails with [`LockError::Timeout`].
    pub fn acquire(&self, resource_group_id: &str, timeout: Duration) -> Result<LockGuard, LockError> {
        validate_group_id(resource_group_id)?;
        let request = LockRequest::new(resource_group_id);
        let record = self
            .backend
            .acquire_blocking(&request, timeout, self.poll_interval)
            .inspect_err(|e| {
                if matches!(e, LockError::Timeout { .. }) {
                    info!(group = resource_group_id, ?timeout, "Lock wait timed out");
                }
            })?;
        self.register(record)
    }

    /// Grants the group immediately or fails with [`LockError::Busy`].
    pub fn try_acquire(&self, resource_group_id: &str) -> Result<LockGuard, LockError> {
        validate_group_id(resource_group_id)?;
        let request = LockRequest::new(resource_group_id);
        match self.backend.try_acquire(&request)? {
            AcquireAttempt::Granted(record) => self.register(record),
            AcquireAttempt::Held(holder) => Err(LockError::Busy {
                resource_group_id: resource_group_id.to_string(),
                holder_pid: holder.holder_pid,
            }),
        }
    }

    /// Records a granted lock in the registry, undoing the grant if that fails.
    fn register(&self, record: LockRecord) -> Result<LockGuard, LockError> {
        let entry = RegistryEntry::for_record(&record, LockState::Active, None);
        if let Err(e) = self.registry.append(&entry) {
            if let Err(rollback) = self
                .backend
                .release(&record.resource_group_id, &record.token)
            {
                warn!(group = %record.resource_group_id, error = %rollback, "Failed to roll back unregistered lock");
            }
            return Err(e);
        }
        debug!(group = %record.resource_group_id, token = %record.token, "Lock acquired");
        Ok(LockGuard {
            manager: self.clone(),
            handle: LockHandle::from(&record),
            released: false,
        })
    }

    /// Releases a lock. Returns `false` if it was already released or reclaimed.
    pub fn release(&self, handle: &LockHandle) -> Result<bool, LockError> {
        let Some(record) = self
            .backend
            .reclaim(&handle.resource_group_id, &handle.token)?
        else {
            debug!(group = %handle.resource_group_id, token = %handle.token, "Lock already released");
            return Ok(false);
        };
        self.registry
            .append(&RegistryEntry::for_record(&record, LockState::Released, None))?;
        debug!(group = %handle.resource_group_id, token = %handle.token, "Lock released");
        Ok(true)
    }

    /// Renews a held lock so the age ceiling counts from now.
    pub fn heartbeat(&self, handle: &LockHandle) -> Result<bool, LockError> {
        self.backend
            .heartbeat(&handle.resource_group_id, &handle.token)
    }

    /// Takes a lock away from its holder, recording why.
    ///
    /// Only succeeds if `record` is still the current holder. Returns whether it was.
    pub fn reclaim(
        &self,
        record: &LockRecord,
        state: LockState,
        note: &str,
    ) -> Result<bool, LockError> {
        let Some(removed) = self
            .backend
            .reclaim(&record.resource_group_id, &record.token)?
        else {
            return Ok(false);
        };
        self.registry.append(&RegistryEntry::for_record(
            &removed,
            state,
            Some(note.to_string()),
        ))?;
        Ok(true)
    }

    pub fn status(&self, resource_group_id: &str) -> Result<LockStatus, LockError> {
        validate_group_id(resource_group_id)?;
        Ok(match self.backend.current(resource_group_id)? {
            Some(record) => LockStatus::from_record(&record, Utc::now()),
            None => LockStatus::free(resource_group_id),
        })
    }

    /// Status of every currently held group.
    pub fn held(&self) -> Result<Vec<LockStatus>, LockError> {
        let now = Utc::now();
        Ok(self
            .backend
            .records()?
            .iter()
            .map(|record| LockStatus::from_record(record, now))
            .collect())
    }

    /// Runs `operation` while holding the group's lock.
    ///
    /// The lock is released on every exit path, including a panic inside `operation`.
    /// A lock timeout is returned as [`GuardedError::Lock`] and never retried here.
    pub fn execute_guarded<T, E, F>(
        &self,
        resource_group_id: &str,
        timeout: Duration,
        operation: F,
    ) -> Result<T, GuardedError<E>>
    where
        F: FnOnce(&LockHandle) -> Result<T, E>,
    {
        let guard = self
            .acquire(resource_group_id, timeout)
            .map_err(GuardedError::Lock)?;
        let result = operation(guard.handle());
        if let Err(e) = guard.release() {
            warn!(group = resource_group_id, error = %e, "Failed to release guarded lock");
        }
        result.map_err(GuardedError::Operation)
    }
}

/// A held lock, released when dropped.
#[must_use = "the lock is released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct LockGuard {
    manager: LockManager,
    handle: LockHandle,
    released: bool,
}

impl LockGuard {
    pub fn handle(&self) -> &LockHandle {
        &self.handle
    }

    pub fn heartbeat(&self) -> Result<bool, LockError> {
        self.manager.heartbeat(&self.handle)
    }

    /// Releases now, reporting failures that a drop would only log.
    pub fn release(mut self) -> Result<bool, LockError> {
        self.released = true;
        self.manager.release(&self.handle)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.manager.release(&self.handle) {
            warn!(group = %self.handle.resource_group_id, error = %e, "Failed to release lock on drop");
        }
    }
}

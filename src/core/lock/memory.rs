//! In-process lock backend.
//!
//! Holds records in a map guarded by a mutex; blocked acquirers park on a condition
//! variable instead of polling. Locks are only visible inside the current process, which
//! suits embedding several coordinators side by side and unit tests.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::backend::LockBackend;
use super::types::{AcquireAttempt, LockRecord, LockRequest};
use crate::error::LockError;

#[derive(Debug, Default)]
pub struct MemoryLockBackend {
    records: Mutex<HashMap<String, LockRecord>>,
    freed: Condvar,
}

impl MemoryLockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn records_guard(&self) -> MutexGuard<'_, HashMap<String, LockRecord>> {
        // A panic while holding the map cannot leave a half-written record behind
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl LockBackend for MemoryLockBackend {
    fn try_acquire(&self, request: &LockRequest) -> Result<AcquireAttempt, LockError> {
        let mut records = self.records_guard();
        if let Some(holder) = records.get(&request.resource_group_id) {
            return Ok(AcquireAttempt::Held(holder.clone()));
        }
        let record = request.grant(Utc::now());
        records.insert(request.resource_group_id.clone(), record.clone());
        Ok(AcquireAttempt::Granted(record))
    }

    fn acquire_blocking(
        &self,
        request: &LockRequest,
        timeout: Duration,
        _poll_interval: Duration,
    ) -> Result<LockRecord, LockError> {
        let deadline = Instant::now() + timeout;
        let started = Instant::now();
        let mut records = self.records_guard();
        loop {
            if !records.contains_key(&request.resource_group_id) {
                let record = request.grant(Utc::now());
                records.insert(request.resource_group_id.clone(), record.clone());
                return Ok(record);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(LockError::Timeout {
                    resource_group_id: request.resource_group_id.clone(),
                    waited: started.elapsed(),
                });
            }
            records = self
                .freed
                .wait_timeout(records, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }

    fn current(&self, resource_group_id: &str) -> Result<Option<LockRecord>, LockError> {
        Ok(self.records_guard().get(resource_group_id).cloned())
    }

    fn records(&self) -> Result<Vec<LockRecord>, LockError> {
        let mut records: Vec<LockRecord> = self.records_guard().values().cloned().collect();
        records.sort_by(|a, b| a.resource_group_id.cmp(&b.resource_group_id));
        Ok(records)
    }

    fn heartbeat(&self, resource_group_id: &str, token: &str) -> Result<bool, LockError> {
        let mut records = self.records_guard();
        match records.get_mut(resource_group_id) {
            Some(record) if record.token == token => {
                record.heartbeat_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn reclaim(
        &self,
        resource_group_id: &str,
        token: &str,
    ) -> Result<Option<LockRecord>, LockError> {
        let mut records = self.records_guard();
        let matches = records
            .get(resource_group_id)
            .is_some_and(|record| record.token == token);
        if !matches {
            return Ok(None);
        }
        let removed = records.remove(resource_group_id);
        drop(records);
        self.freed.notify_all();
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// # Waiter Wakes On Release
    ///
    /// Verifies that a blocked acquirer is granted the lock as soon as it is released.
    ///
    /// ## Test Scenario
    /// - Holds a lock on the main thread
    /// - Starts a waiter with a generous timeout, releases after 50ms
    ///
    /// ## Expected Outcome
    /// - The waiter is granted the lock well before its timeout
    #[test]
    fn test_waiter_wakes_on_release() {
        let backend = Arc::new(MemoryLockBackend::new());
        let first = LockRequest::new("g");
        backend.try_acquire(&first).unwrap();

        let waiter = {
            let backend = Arc::clone(&backend);
            std::thread::spawn(move || {
                let started = Instant::now();
                let record = backend
                    .acquire_blocking(
                        &LockRequest::new("g"),
                        Duration::from_secs(10),
                        Duration::ZERO,
                    )
                    .unwrap();
                (record, started.elapsed())
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        assert!(backend.release("g", &first.token).unwrap());

        let (record, waited) = waiter.join().unwrap();
        assert_ne!(record.token, first.token);
        assert!(waited < Duration::from_secs(5));
    }

    /// # Heartbeat Requires Matching Token
    ///
    /// ## Test Scenario
    /// - Renews a held lock with its own token and with a foreign token
    ///
    /// ## Expected Outcome
    /// - Only the holder's renewal succeeds
    #[test]
    fn test_heartbeat_requires_token() {
        let backend = MemoryLockBackend::new();
        let request = LockRequest::new("g");
        backend.try_acquire(&request).unwrap();

        assert!(backend.heartbeat("g", &request.token).unwrap());
        assert!(!backend.heartbeat("g", "someone-else").unwrap());
        assert!(!backend.heartbeat("other", &request.token).unwrap());
    }
}

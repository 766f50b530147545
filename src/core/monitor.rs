//! Deadlock monitor.
//!
//! Periodically inspects every held lock and reclaims the ones whose holder process no
//! longer exists (`ORPHAN_RECLAIMED`) or that have not been acquired or renewed within
//! the age ceiling (`TIMED_OUT`). Registry acquisitions left open by a dead holder
//! without a backing record are closed as well, so the registry never reports a lock
//! nobody can hold.
//!
//! [`DeadlockMonitor::scan_once`] performs a single pass and is what tests drive;
//! [`DeadlockMonitor::start`] runs it on a tokio interval until stopped.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::core::lock::{LockManager, LockRecord, LockState};
use crate::core::process::ProcessProbe;
use crate::error::LockError;

/// One lock taken away from its holder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReclaimedLock {
    pub resource_group_id: String,
    pub holder_pid: u32,
    pub token: String,
    pub acquired_at: DateTime<Utc>,
    /// `TIMED_OUT` or `ORPHAN_RECLAIMED`.
    pub state: LockState,
    pub reason: String,
}

/// Result of one monitor pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    /// Held locks inspected.
    pub examined: usize,
    pub reclaimed: Vec<ReclaimedLock>,
}

#[derive(Debug)]
pub struct DeadlockMonitor {
    locks: LockManager,
    probe: Arc<dyn ProcessProbe>,
    max_age: Duration,
}

impl DeadlockMonitor {
    pub fn new(locks: LockManager, probe: Arc<dyn ProcessProbe>, max_age: Duration) -> Self {
        Self {
            locks,
            probe,
            max_age,
        }
    }

    /// Reclaims orphaned and over-age locks once.
    pub fn scan_once(&self) -> Result<ScanReport, LockError> {
        self.scan(true)
    }

    /// Reclaims only locks whose holder is gone, regardless of age.
    pub fn reclaim_orphans(&self) -> Result<ScanReport, LockError> {
        self.scan(false)
    }

    fn scan(&self, enforce_age: bool) -> Result<ScanReport, LockError> {
        let now = Utc::now();
        let records = self.locks.backend().records()?;
        let mut report = ScanReport {
            examined: records.len(),
            reclaimed: Vec::new(),
        };

        for record in &records {
            let Some((state, reason)) = self.judge(record, now, enforce_age) else {
                continue;
            };
            if self.locks.reclaim(record, state, &reason)? {
                warn!(
                    group = %record.resource_group_id,
                    pid = record.holder_pid,
                    state = %state,
                    reason = %reason,
                    "Reclaimed lock"
                );
                report.reclaimed.push(ReclaimedLock {
                    resource_group_id: record.resource_group_id.clone(),
                    holder_pid: record.holder_pid,
                    token: record.token.clone(),
                    acquired_at: record.acquired_at,
                    state,
                    reason,
                });
            }
        }

        // Open registry acquisitions with no backing record: close them if the holder is gone.
        // A live holder may be between its release and the registry append, so leave those.
        let held: HashSet<&str> = records.iter().map(|r| r.token.as_str()).collect();
        for entry in self.locks.registry().active()? {
            if held.contains(entry.token.as_str()) || self.probe.is_alive(entry.holder_pid) {
                continue;
            }
            let reason = format!("holder process {} no longer exists", entry.holder_pid);
            self.locks
                .registry()
                .append(&entry.closed(LockState::OrphanReclaimed, Some(reason.clone())))?;
            warn!(group = %entry.resource_group_id, pid = entry.holder_pid, "Closed dangling registry entry");
            report.reclaimed.push(ReclaimedLock {
                resource_group_id: entry.resource_group_id,
                holder_pid: entry.holder_pid,
                token: entry.token,
                acquired_at: entry.acquired_at,
                state: LockState::OrphanReclaimed,
                reason,
            });
        }

        debug!(
            examined = report.examined,
            reclaimed = report.reclaimed.len(),
            "Lock scan complete"
        );
        Ok(report)
    }

    fn judge(
        &self,
        record: &LockRecord,
        now: DateTime<Utc>,
        enforce_age: bool,
    ) -> Option<(LockState, String)> {
        if !self.probe.is_alive(record.holder_pid) {
            return Some((
                LockState::OrphanReclaimed,
                format!("holder process {} no longer exists", record.holder_pid),
            ));
        }
        let age = record.age(now);
        if enforce_age && age > self.max_age {
            return Some((
                LockState::TimedOut,
                format!(
                    "held for {}s without renewal (ceiling {}s)",
                    age.as_secs(),
                    self.max_age.as_secs()
                ),
            ));
        }
        None
    }

    /// Runs [`DeadlockMonitor::scan_once`] every `period` on the tokio runtime.
    ///
    /// Scans run on the blocking pool; a failed scan is logged and the next tick retries.
    pub fn start(self: Arc<Self>, period: Duration) -> MonitorHandle {
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(period_secs = period.as_secs_f64(), "Deadlock monitor started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let monitor = Arc::clone(&self);
                        match tokio::task::spawn_blocking(move || monitor.scan_once()).await {
                            Ok(Ok(report)) if !report.reclaimed.is_empty() => {
                                info!(reclaimed = report.reclaimed.len(), "Deadlock monitor reclaimed locks");
                            }
                            Ok(Ok(_)) => {}
                            Ok(Err(e)) => error!(error = %e, "Deadlock monitor scan failed"),
                            Err(e) => error!(error = %e, "Deadlock monitor scan panicked"),
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Deadlock monitor stopped");
        });

        MonitorHandle { shutdown, task }
    }
}

/// Running monitor task.
#[derive(Debug)]
pub struct MonitorHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    /// Signals the task to stop and waits for the current scan to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Deadlock monitor task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::lock::{FileLockBackend, LockBackend, LockRequest, Registry, RegistryEntry};
    use crate::core::process::testing::FakeProbe;
    use tempfile::TempDir;

    const DEAD_PID: u32 = 999_999;

    struct Fixture {
        _dir: TempDir,
        backend: FileLockBackend,
        locks: LockManager,
        monitor: DeadlockMonitor,
    }

    fn setup(probe: Arc<FakeProbe>) -> Fixture {
        let dir = TempDir::new().unwrap();
        let backend = FileLockBackend::new(dir.path().join("locks")).unwrap();
        let locks = LockManager::new(Arc::new(backend.clone()), Registry::in_dir(dir.path()));
        let monitor = DeadlockMonitor::new(locks.clone(), probe, Duration::from_secs(3600));
        Fixture {
            _dir: dir,
            backend,
            locks,
            monitor,
        }
    }

    /// Writes a lock record and its registry entry as if `pid` had acquired at `at`.
    fn plant(fx: &Fixture, group: &str, pid: u32, at: DateTime<Utc>) -> LockRecord {
        let mut request = LockRequest::new(group);
        request.holder_pid = pid;
        let record = request.grant(at);
        std::fs::write(
            fx.backend.path_for(group),
            serde_json::to_vec(&record).unwrap(),
        )
        .unwrap();
        fx.locks
            .registry()
            .append(&RegistryEntry::for_record(&record, LockState::Active, None))
            .unwrap();
        record
    }

    /// # Orphaned Lock Reclaimed In One Cycle
    ///
    /// Verifies that a lock held by a dead process is freed by a single scan.
    ///
    /// ## Test Scenario
    /// - Plants a lock for a pid the probe reports dead
    /// - Runs one scan
    ///
    /// ## Expected Outcome
    /// - The lock is reported as ORPHAN_RECLAIMED and the group is free
    /// - The registry no longer lists it as active
    #[test]
    fn test_orphan_reclaimed_in_one_cycle() {
        let fx = setup(Arc::new(FakeProbe::with_dead(&[DEAD_PID])));
        plant(&fx, "frontend", DEAD_PID, Utc::now());

        let report = fx.monitor.scan_once().unwrap();

        assert_eq!(report.examined, 1);
        assert_eq!(report.reclaimed.len(), 1);
        assert_eq!(report.reclaimed[0].state, LockState::OrphanReclaimed);
        assert!(!fx.locks.status("frontend").unwrap().is_active());
        assert!(fx.locks.registry().active().unwrap().is_empty());
        assert!(fx.locks.try_acquire("frontend").is_ok());
    }

    /// # Over-Age Lock Times Out
    ///
    /// ## Test Scenario
    /// - Plants a lock for a live pid acquired two hours ago (ceiling one hour)
    /// - Holds a fresh lock through the manager
    ///
    /// ## Expected Outcome
    /// - Only the old lock is reclaimed, as TIMED_OUT
    #[test]
    fn test_over_age_lock_times_out() {
        let fx = setup(Arc::new(FakeProbe::default()));
        plant(
            &fx,
            "old",
            std::process::id(),
            Utc::now() - chrono::Duration::hours(2),
        );
        let _fresh = fx.locks.try_acquire("fresh").unwrap();

        let report = fx.monitor.scan_once().unwrap();

        assert_eq!(report.examined, 2);
        assert_eq!(report.reclaimed.len(), 1);
        assert_eq!(report.reclaimed[0].resource_group_id, "old");
        assert_eq!(report.reclaimed[0].state, LockState::TimedOut);
        assert!(fx.locks.status("fresh").unwrap().is_active());
    }

    /// # Heartbeat Keeps Long Holder Alive
    ///
    /// ## Test Scenario
    /// - Plants a lock acquired two hours ago and renews it through its token
    ///
    /// ## Expected Outcome
    /// - The scan leaves it alone
    #[test]
    fn test_heartbeat_keeps_holder() {
        let fx = setup(Arc::new(FakeProbe::default()));
        let record = plant(
            &fx,
            "processor",
            std::process::id(),
            Utc::now() - chrono::Duration::hours(2),
        );
        assert!(fx.backend.heartbeat("processor", &record.token).unwrap());

        assert!(fx.monitor.scan_once().unwrap().reclaimed.is_empty());
    }

    /// # Orphan-Only Pass Ignores Age
    ///
    /// ## Test Scenario
    /// - Plants an ancient lock held by a live process and a lock held by a dead one
    /// - Runs the orphan-only pass
    ///
    /// ## Expected Outcome
    /// - Only the dead holder's lock is reclaimed
    #[test]
    fn test_orphan_only_pass_ignores_age() {
        let fx = setup(Arc::new(FakeProbe::with_dead(&[DEAD_PID])));
        plant(
            &fx,
            "alive",
            std::process::id(),
            Utc::now() - chrono::Duration::days(3),
        );
        plant(&fx, "dead", DEAD_PID, Utc::now());

        let report = fx.monitor.reclaim_orphans().unwrap();
        assert_eq!(report.reclaimed.len(), 1);
        assert_eq!(report.reclaimed[0].resource_group_id, "dead");
        assert!(fx.locks.status("alive").unwrap().is_active());
    }

    /// # Dangling Registry Entry Closed
    ///
    /// Verifies that an ACTIVE registry entry with no backing record is closed when its
    /// holder is gone, and left alone when it is alive.
    ///
    /// ## Test Scenario
    /// - Appends ACTIVE entries for a dead and a live pid without backend records
    ///
    /// ## Expected Outcome
    /// - The dead holder's entry is closed, the live one stays open
    #[test]
    fn test_dangling_registry_entry_closed() {
        let fx = setup(Arc::new(FakeProbe::with_dead(&[DEAD_PID])));
        let mut dead = LockRequest::new("ghost");
        dead.holder_pid = DEAD_PID;
        let live = LockRequest::new("busy");
        for request in [&dead, &live] {
            fx.locks
                .registry()
                .append(&RegistryEntry::for_record(
                    &request.grant(Utc::now()),
                    LockState::Active,
                    None,
                ))
                .unwrap();
        }

        let report = fx.monitor.scan_once().unwrap();
        assert_eq!(report.reclaimed.len(), 1);
        assert_eq!(report.reclaimed[0].resource_group_id, "ghost");

        let active = fx.locks.registry().active().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].resource_group_id, "busy");
    }

    /// # Background Task Reclaims And Stops
    ///
    /// Verifies the started monitor scans on its own and shuts down cleanly.
    ///
    /// ## Test Scenario
    /// - Starts the monitor with a 20ms period
    /// - Plants an orphaned lock and waits for it to disappear
    ///
    /// ## Expected Outcome
    /// - The group becomes free without calling `scan_once`
    /// - `stop` returns
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_background_task_reclaims_and_stops() {
        let probe = Arc::new(FakeProbe::with_dead(&[DEAD_PID]));
        let fx = setup(Arc::clone(&probe));
        let monitor = DeadlockMonitor::new(fx.locks.clone(), probe, Duration::from_secs(3600));
        let handle = Arc::new(monitor).start(Duration::from_millis(20));

        plant(&fx, "frontend", DEAD_PID, Utc::now());

        let mut freed = false;
        for _ in 0..200 {
            if !fx.locks.status("frontend").unwrap().is_active() {
                freed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.stop().await;
        assert!(freed);
    }
}

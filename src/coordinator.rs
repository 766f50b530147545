//! The coordinator facade.
//!
//! [`Coordinator`] wires the lock manager, conflict detector, merge queue, deadlock
//! monitor and recovery supervisor to one repository and one state directory. All of its
//! configuration lives in [`CoordinatorSettings`]; there is no global state, so several
//! coordinators can run side by side.
//!
//! ## Example
//!
//! ```rust,no_run
//! use trunkline::{Coordinator, CoordinatorSettings};
//!
//! # fn main() -> Result<(), trunkline::error::TrunklineError> {
//! let settings = CoordinatorSettings::new("/srv/repo".into(), "/var/lib/trunkline".into());
//! let coordinator = Coordinator::open(settings)?;
//! coordinator.recover()?;
//! let request = coordinator.submit_merge("feature/auth", "main")?;
//! coordinator.process_queue(None)?;
//! println!("{}", coordinator.get_merge_outcome(&request.id)?.status);
//! # Ok(())
//! # }
//! ```

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::core::conflict::precheck::precheck;
use crate::core::conflict::{
    AuditLog, ConflictDetector, ConflictReport, GroupDeclaration, PrecheckVerdict, ResourceGroup,
    RuleTable,
};
use crate::core::lock::{LockHandle, LockManager, LockStatus};
use crate::core::monitor::{DeadlockMonitor, ScanReport};
use crate::core::process::{ProcessProbe, SystemProbe};
use crate::core::queue::{
    MergeQueue, MergeRequest, ProcessorSettings, QueueEntry, QueueProcessor, QueueStore,
    RunSummary,
};
use crate::core::recovery::{RecoveryReport, RecoverySupervisor};
use crate::core::repository::Repository;
use crate::core::state::{CheckpointStore, DEFAULT_RETENTION};
use crate::error::{
    ConfigError, ConflictError, GuardedError, LockError, QueueError, TrunklineError,
};
use crate::git::{CommitIdentity, GitCli};

/// Everything a coordinator needs to know, passed explicitly.
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub repo_path: PathBuf,
    pub state_dir: PathBuf,
    /// Default wait for `lock run` and the integration lock.
    pub lock_timeout: Duration,
    pub poll_interval: Duration,
    /// Locks not acquired or renewed for this long are reclaimed by the monitor.
    pub stale_lock_age: Duration,
    pub monitor_interval: Duration,
    pub checkpoint_retention: usize,
    pub processor: ProcessorSettings,
    pub rules: RuleTable,
    /// Identity on integration commits; git's own configuration when `None`.
    pub identity: Option<CommitIdentity>,
}

impl CoordinatorSettings {
    pub fn new(repo_path: PathBuf, state_dir: PathBuf) -> Self {
        Self {
            repo_path,
            state_dir,
            lock_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(50),
            stale_lock_age: Duration::from_secs(3600),
            monitor_interval: Duration::from_secs(30),
            checkpoint_retention: DEFAULT_RETENTION,
            processor: ProcessorSettings::default(),
            rules: RuleTable::default(),
            identity: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Coordinator {
    settings: CoordinatorSettings,
    repo: Arc<dyn Repository>,
    locks: LockManager,
    probe: Arc<dyn ProcessProbe>,
    queue: MergeQueue,
    checkpoints: CheckpointStore,
    audit: AuditLog,
}

impl Coordinator {
    /// Opens the repository with the git CLI and uses file-backed locks in the state dir.
    pub fn open(settings: CoordinatorSettings) -> Result<Self, TrunklineError> {
        fs::create_dir_all(&settings.state_dir).map_err(|e| {
            ConfigError::DirectoryCreationError {
                path: settings.state_dir.clone(),
                message: e.to_string(),
            }
        })?;
        let repo = GitCli::open(&settings.repo_path)?.with_identity(settings.identity.clone());
        let locks =
            LockManager::file_backed(&settings.state_dir)?.with_poll_interval(settings.poll_interval);
        debug!(
            repo = %settings.repo_path.display(),
            state_dir = %settings.state_dir.display(),
            "Coordinator opened"
        );
        Ok(Self::with_parts(
            settings,
            Arc::new(repo),
            locks,
            Arc::new(SystemProbe),
        ))
    }

    /// Assembles a coordinator from explicit collaborators.
    pub fn with_parts(
        settings: CoordinatorSettings,
        repo: Arc<dyn Repository>,
        locks: LockManager,
        probe: Arc<dyn ProcessProbe>,
    ) -> Self {
        let store = QueueStore::in_dir(&settings.state_dir);
        let checkpoints =
            CheckpointStore::in_dir(&settings.state_dir, settings.checkpoint_retention);
        let audit = AuditLog::in_dir(&settings.state_dir);
        Self {
            queue: MergeQueue::new(store, repo.clone()),
            settings,
            repo,
            locks,
            probe,
            checkpoints,
            audit,
        }
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn get_lock_status(&self, resource_group_id: &str) -> Result<LockStatus, LockError> {
        self.locks.status(resource_group_id)
    }

    /// Every group currently held.
    pub fn held_locks(&self) -> Result<Vec<LockStatus>, LockError> {
        self.locks.held()
    }

    /// Runs `operation` under the group's lock, waiting up to `timeout` or the configured
    /// lock timeout.
    pub fn run_guarded<T, E, F>(
        &self,
        resource_group_id: &str,
        timeout: Option<Duration>,
        operation: F,
    ) -> Result<T, GuardedError<E>>
    where
        F: FnOnce(&LockHandle) -> Result<T, E>,
    {
        self.locks.execute_guarded(
            resource_group_id,
            timeout.unwrap_or(self.settings.lock_timeout),
            operation,
        )
    }

    /// Static verdicts for a batch of declared resource groups.
    pub fn get_conflict_report(
        &self,
        batch: Vec<GroupDeclaration>,
    ) -> Result<ConflictReport, ConflictError> {
        let groups = batch
            .into_iter()
            .map(ResourceGroup::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        ConflictDetector::new(self.settings.rules)
            .with_audit(self.audit.clone())
            .report(&groups)
    }

    /// Dry-run merge of `source_ref` into `target_ref`, recorded in the audit log.
    pub fn check_merge(
        &self,
        source_ref: &str,
        target_ref: &str,
    ) -> Result<PrecheckVerdict, TrunklineError> {
        let verdict = precheck(
            self.repo.as_ref(),
            source_ref,
            target_ref,
            self.settings.processor.auto_rebase_max_files,
        )?;
        self.audit
            .record_dynamic("-", source_ref, target_ref, &verdict);
        Ok(verdict)
    }

    pub fn submit_merge(
        &self,
        source_ref: &str,
        target_ref: &str,
    ) -> Result<MergeRequest, QueueError> {
        self.queue.submit(source_ref, target_ref)
    }

    pub fn get_queue_status(&self) -> Result<Vec<QueueEntry>, QueueError> {
        self.queue.status()
    }

    pub fn get_merge_outcome(&self, request_id: &str) -> Result<MergeRequest, QueueError> {
        self.queue.outcome(request_id)
    }

    /// Puts a request back in line after someone resolved its conflicts by hand.
    pub fn resolve_manual(&self, request_id: &str) -> Result<MergeRequest, QueueError> {
        self.queue.resolve_manual(request_id)
    }

    fn processor(&self) -> QueueProcessor {
        QueueProcessor::new(
            self.queue.store().clone(),
            self.locks.clone(),
            self.repo.clone(),
            self.settings.processor.clone(),
        )
        .with_audit(self.audit.clone())
        .with_checkpoints(self.checkpoints.clone())
    }

    /// Runs the dequeue loop until the queue drains or `max_steps` steps have run.
    pub fn process_queue(&self, max_steps: Option<usize>) -> Result<RunSummary, QueueError> {
        self.processor().run(max_steps)
    }

    /// Snapshots queue and locks. Returns the generation written.
    pub fn checkpoint(&self) -> Result<u64, TrunklineError> {
        let queue = self.queue.store().load()?;
        let locks = self.locks.backend().records()?;
        let checkpoint = self.checkpoints.write(&queue, &locks)?;
        info!(generation = checkpoint.generation, "Checkpoint written");
        Ok(checkpoint.generation)
    }

    /// Reconciles state after a crash. Safe to run at every startup.
    pub fn recover(&self) -> Result<RecoveryReport, TrunklineError> {
        RecoverySupervisor::new(
            self.queue.store().clone(),
            self.locks.clone(),
            self.checkpoints.clone(),
            self.probe.clone(),
        )
        .recover()
    }

    pub fn monitor(&self) -> DeadlockMonitor {
        DeadlockMonitor::new(
            self.locks.clone(),
            self.probe.clone(),
            self.settings.stale_lock_age,
        )
    }

    /// One deadlock-monitor pass.
    pub fn scan_locks(&self) -> Result<ScanReport, LockError> {
        self.monitor().scan_once()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::conflict::{ExecutionStrategy, RecommendedAction, Relationship};
    use crate::core::lock::{FileLockBackend, LockRequest, Registry};
    use crate::core::process::testing::FakeProbe;
    use crate::core::queue::{RequestStatus, StepOutcome};
    use crate::core::repository::testing::FakeRepository;
    use crate::core::repository::{ConflictKind, FileConflict};
    use crate::error::ErrorKind;
    use tempfile::TempDir;

    const DEAD_PID: u32 = 999_999;

    struct Fixture {
        _dir: TempDir,
        repo: Arc<FakeRepository>,
        backend: FileLockBackend,
        coordinator: Coordinator,
    }

    fn fixture(branches: &[&str]) -> Fixture {
        let dir = TempDir::new().unwrap();
        let settings = CoordinatorSettings::new(dir.path().to_path_buf(), dir.path().join("state"));
        fs::create_dir_all(&settings.state_dir).unwrap();
        let backend = FileLockBackend::new(settings.state_dir.join("locks")).unwrap();
        let locks = LockManager::new(
            Arc::new(backend.clone()),
            Registry::in_dir(&settings.state_dir),
        )
        .with_poll_interval(Duration::from_millis(5));
        let repo = Arc::new(FakeRepository::with_branches(branches));
        let coordinator = Coordinator::with_parts(
            settings,
            repo.clone(),
            locks,
            Arc::new(FakeProbe::with_dead(&[DEAD_PID])),
        );
        Fixture {
            _dir: dir,
            repo,
            backend,
            coordinator,
        }
    }

    fn declare(id: &str, patterns: &[&str]) -> GroupDeclaration {
        GroupDeclaration {
            id: id.to_string(),
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
        }
    }

    /// # Three Workers, Two Touch The Same File
    ///
    /// Verifies the whole flow for workers A (`src/auth.ts`), B (`src/payments.ts`)
    /// and C (`src/auth.ts`).
    ///
    /// ## Test Scenario
    /// - Asks for the static report of the three groups
    /// - Submits all three; C's first precheck conflicts on `src/auth.ts` after A lands
    /// - Processes the queue
    ///
    /// ## Expected Outcome
    /// - A/C is an exact overlap that forces serial execution; B is disjoint from both
    /// - A and B merge first, C is rebased to the tail and merges last
    /// - The audit log holds both static and dynamic verdicts
    #[test]
    fn test_end_to_end_three_workers() {
        let f = fixture(&["main", "a", "b", "c"]);
        let report = f
            .coordinator
            .get_conflict_report(vec![
                declare("A", &["src/auth.ts"]),
                declare("B", &["src/payments.ts"]),
                declare("C", &["src/auth.ts"]),
            ])
            .unwrap();

        let ac = report
            .verdicts
            .iter()
            .find(|v| v.left == "A" && v.right == "C")
            .unwrap();
        assert_eq!(ac.relationship, Relationship::ExactOverlap);
        assert_eq!(ac.recommended_action, RecommendedAction::DowngradeSerial);
        assert!(
            report
                .verdicts
                .iter()
                .filter(|v| v.left == "B" || v.right == "B")
                .all(|v| v.relationship == Relationship::SameDirectory
                    && v.recommended_action == RecommendedAction::Proceed)
        );
        assert_eq!(report.strategy, ExecutionStrategy::Serial);

        f.repo.script_dry_runs(
            "c",
            vec![vec![FileConflict::new("src/auth.ts", ConflictKind::Content)]],
        );
        let a = f.coordinator.submit_merge("a", "main").unwrap();
        let b = f.coordinator.submit_merge("b", "main").unwrap();
        let c = f.coordinator.submit_merge("c", "main").unwrap();

        let summary = f.coordinator.process_queue(None).unwrap();

        assert!(matches!(summary.steps[2], StepOutcome::Requeued { ref id, attempts: 1 } if *id == c.id));
        assert_eq!(f.repo.integrated(), vec!["a", "b", "c"]);
        for id in [&a.id, &b.id, &c.id] {
            let outcome = f.coordinator.get_merge_outcome(id).unwrap();
            assert_eq!(outcome.status, RequestStatus::Merged);
        }

        let records = AuditLog::in_dir(&f.coordinator.settings().state_dir)
            .records()
            .unwrap();
        assert!(records.len() >= 3 + 4);
    }

    /// # Lock Status And Guarded Run
    ///
    /// ## Test Scenario
    /// - Runs an operation under `build` and checks status inside and after it
    ///
    /// ## Expected Outcome
    /// - Active with this process as holder inside; free afterwards
    #[test]
    fn test_lock_status_and_guarded_run() {
        let f = fixture(&["main"]);
        let inside = f
            .coordinator
            .run_guarded("build", Some(Duration::from_secs(1)), |_| {
                f.coordinator.get_lock_status("build")
            })
            .unwrap();

        assert!(inside.is_active());
        assert_eq!(inside.holder.unwrap().pid, std::process::id());
        assert!(!f.coordinator.get_lock_status("build").unwrap().is_active());
    }

    /// # Guarded Run Times Out On A Held Group
    ///
    /// ## Test Scenario
    /// - Holds `build` then runs a guarded operation on it with a short timeout
    ///
    /// ## Expected Outcome
    /// - `GuardedError::Lock(Timeout)`; the operation never runs
    #[test]
    fn test_guarded_run_times_out() {
        let f = fixture(&["main"]);
        let _held = f.coordinator.locks().acquire("build", Duration::from_secs(1)).unwrap();

        let result: Result<(), GuardedError<()>> = f.coordinator.run_guarded(
            "build",
            Some(Duration::from_millis(30)),
            |_| panic!("must not run"),
        );

        assert!(matches!(
            result,
            Err(GuardedError::Lock(LockError::Timeout { .. }))
        ));
    }

    /// # Manual Resolution Through The Facade
    ///
    /// ## Test Scenario
    /// - A rename conflict sends the request to manual resolution
    /// - The operator resolves it and the queue runs again
    ///
    /// ## Expected Outcome
    /// - MANUAL_REQUIRED with a conflict error, then MERGED
    #[test]
    fn test_manual_resolution_through_facade() {
        let f = fixture(&["main", "feature"]);
        f.repo.script_dry_runs(
            "feature",
            vec![vec![FileConflict::new("src/lib.rs", ConflictKind::RenameDelete)]],
        );
        let request = f.coordinator.submit_merge("feature", "main").unwrap();

        f.coordinator.process_queue(None).unwrap();
        let stuck = f.coordinator.get_merge_outcome(&request.id).unwrap();
        assert_eq!(stuck.status, RequestStatus::ManualRequired);
        assert_eq!(
            stuck.last_error.unwrap().kind,
            ErrorKind::ConflictDetected
        );

        f.coordinator.resolve_manual(&request.id).unwrap();
        f.coordinator.process_queue(None).unwrap();
        assert_eq!(
            f.coordinator.get_merge_outcome(&request.id).unwrap().status,
            RequestStatus::Merged
        );
    }

    /// # Stale Lock Reclaimed In One Scan
    ///
    /// ## Test Scenario
    /// - Writes a lock record owned by a dead pid
    /// - Runs one monitor pass
    ///
    /// ## Expected Outcome
    /// - The lock is reclaimed and the group reads free
    #[test]
    fn test_stale_lock_reclaimed_in_one_scan() {
        let f = fixture(&["main"]);
        let mut request = LockRequest::new("deploy");
        request.holder_pid = DEAD_PID;
        let record = request.grant(chrono::Utc::now());
        fs::write(
            f.backend.path_for("deploy"),
            serde_json::to_vec(&record).unwrap(),
        )
        .unwrap();
        assert!(f.coordinator.get_lock_status("deploy").unwrap().is_active());

        let report = f.coordinator.scan_locks().unwrap();

        assert_eq!(report.reclaimed.len(), 1);
        assert!(!f.coordinator.get_lock_status("deploy").unwrap().is_active());
    }

    /// # Checkpoint Then Recover Is Clean
    ///
    /// ## Test Scenario
    /// - Submits a request, writes a checkpoint, recovers twice
    ///
    /// ## Expected Outcome
    /// - The second recovery finds nothing to fix
    #[test]
    fn test_checkpoint_then_recover_is_clean() {
        let f = fixture(&["main", "feature"]);
        f.coordinator.submit_merge("feature", "main").unwrap();
        let generation = f.coordinator.checkpoint().unwrap();

        let first = f.coordinator.recover().unwrap();
        let second = f.coordinator.recover().unwrap();

        assert!(first.checkpoint_generation >= Some(generation));
        assert!(second.is_clean());
        assert_eq!(f.coordinator.get_queue_status().unwrap().len(), 1);
    }

    /// # Dynamic Check Reports Conflicts
    ///
    /// ## Test Scenario
    /// - Scripts one content conflict and checks the merge directly
    ///
    /// ## Expected Outcome
    /// - A conflicted verdict that is not clean
    #[test]
    fn test_check_merge_reports_conflicts() {
        let f = fixture(&["main", "feature"]);
        f.repo.script_dry_runs(
            "feature",
            vec![vec![FileConflict::new("README.md", ConflictKind::Content)]],
        );

        let verdict = f.coordinator.check_merge("feature", "main").unwrap();

        assert!(!verdict.is_clean());
        assert!(f.coordinator.check_merge("feature", "main").unwrap().is_clean());
    }

    /// # Unusable State Directory Is A Config Error
    ///
    /// ## Test Scenario
    /// - Opens a coordinator whose state dir would live under a regular file
    ///
    /// ## Expected Outcome
    /// - `DirectoryCreationError` naming the state dir
    #[test]
    fn test_open_reports_state_dir_creation_failure() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, "").unwrap();
        let state_dir = blocker.join("state");

        let err = Coordinator::open(CoordinatorSettings::new(
            dir.path().to_path_buf(),
            state_dir.clone(),
        ))
        .err()
        .unwrap();

        assert!(matches!(
            err,
            TrunklineError::Config(ConfigError::DirectoryCreationError { ref path, .. })
                if *path == state_dir
        ));
    }
}

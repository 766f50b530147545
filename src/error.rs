//! Unified error handling for the trunkline library.
//!
//! This module provides the error hierarchy used across the coordinator, built with
//! `thiserror` so callers can match on the exact failure instead of parsing messages.
//!
//! ## Error Categories
//!
//! - [`LockError`]: Errors from the lock manager and its backends
//! - [`ConflictError`]: Caller errors when declaring resource groups
//! - [`QueueError`]: Errors from the merge queue and its processor
//! - [`CheckpointError`]: Errors reading or writing checkpoints
//! - [`GitError`]: Errors from git operations
//! - [`ConfigError`]: Errors from configuration loading and validation
//!
//! Conditions that are expected outcomes rather than failures (a detected conflict, an
//! orphaned lock) are not errors; they travel through the queue state machine and the
//! monitor reports instead. The persisted classification of a request failure is
//! [`ErrorKind`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use trunkline::error::{LockError, TrunklineError};
//! use std::time::Duration;
//!
//! fn example() -> Result<(), TrunklineError> {
//!     Err(LockError::Timeout {
//!         resource_group_id: "integration".to_string(),
//!         waited: Duration::from_secs(5),
//!     })?;
//!     Ok(())
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// The main error type for the trunkline library.
#[derive(Error, Debug)]
pub enum TrunklineError {
    /// An error occurred while acquiring, releasing or inspecting a lock.
    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    /// A resource group declaration was rejected.
    #[error("Conflict detector error: {0}")]
    Conflict(#[from] ConflictError),

    /// An error occurred in the merge queue.
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// A checkpoint could not be written or no valid checkpoint exists.
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// An error occurred during a git operation.
    #[error("Git error: {0}")]
    Git(#[from] GitError),

    /// An error occurred while loading or validating configuration.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A generic error for cases not covered by specific error types.
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Errors that can occur in the lock manager.
#[derive(Error, Debug)]
pub enum LockError {
    /// The lock was not granted before the caller's timeout expired.
    #[error("Timed out after {waited:?} waiting for lock on '{resource_group_id}'")]
    Timeout {
        /// Resource group that was requested.
        resource_group_id: String,
        /// How long the caller waited.
        waited: Duration,
    },

    /// The lock is held by someone else (non-blocking acquisition).
    #[error("Lock on '{resource_group_id}' is held by process {holder_pid}")]
    Busy {
        /// Resource group that was requested.
        resource_group_id: String,
        /// Process currently holding the lock.
        holder_pid: u32,
    },

    /// The resource group id is not usable as a lock name.
    #[error("Invalid resource group id '{id}': {reason}")]
    InvalidGroupId {
        /// The rejected id.
        id: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Reading or writing the lock store failed.
    #[error("Lock storage failure at {path}: {message}")]
    Storage {
        /// Path of the file involved.
        path: PathBuf,
        /// Underlying error message.
        message: String,
    },

    /// Appending to or reading the registry failed.
    #[error("Registry failure at {path}: {message}")]
    Registry {
        /// Path of the registry log.
        path: PathBuf,
        /// Underlying error message.
        message: String,
    },
}

/// Result of [`crate::core::lock::LockManager::execute_guarded`] when something went wrong.
///
/// Keeps the lock failure apart from the guarded operation's own error so callers
/// can apply their own retry policy to timeouts.
#[derive(Error, Debug)]
pub enum GuardedError<E> {
    /// The lock could not be acquired (or its bookkeeping failed).
    #[error(transparent)]
    Lock(LockError),

    /// The lock was acquired and the operation itself failed.
    #[error("{0}")]
    Operation(E),
}

/// Caller errors raised when declaring resource groups.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConflictError {
    /// A declared path pattern is malformed.
    #[error("Invalid pattern '{pattern}' in group '{group}': {message}")]
    InvalidPattern {
        /// Group that declared the pattern.
        group: String,
        /// The malformed pattern.
        pattern: String,
        /// Why the pattern was rejected.
        message: String,
    },

    /// A group declared no patterns at all.
    #[error("Resource group '{group}' declares no path patterns")]
    EmptyGroup {
        /// The offending group.
        group: String,
    },

    /// Two groups in one batch share an id.
    #[error("Resource group '{id}' is declared more than once in the batch")]
    DuplicateGroup {
        /// The duplicated id.
        id: String,
    },

    /// The group id is not valid.
    #[error("Invalid resource group id '{id}': {reason}")]
    InvalidGroupId {
        /// The rejected id.
        id: String,
        /// Why it was rejected.
        reason: String,
    },
}

/// Errors that can occur in the merge queue.
#[derive(Error, Debug)]
pub enum QueueError {
    /// No request with this id exists.
    #[error("Merge request '{id}' not found")]
    NotFound {
        /// The requested id.
        id: String,
    },

    /// The state machine does not allow this transition.
    #[error("Merge request '{id}' cannot move from {from} to {to}")]
    InvalidTransition {
        /// Request id.
        id: String,
        /// Current status.
        from: String,
        /// Requested status.
        to: String,
    },

    /// Another processor instance holds the queue-processor lock.
    #[error("Queue processor already running in process {holder_pid}")]
    ProcessorBusy {
        /// Process running the other processor.
        holder_pid: u32,
    },

    /// Reading or writing the queue file failed.
    #[error("Queue storage failure at {path}: {message}")]
    Storage {
        /// Path of the queue file.
        path: PathBuf,
        /// Underlying error message.
        message: String,
    },

    /// The queue file exists but cannot be parsed or fails validation.
    #[error("Queue file at {path} is corrupt: {message}")]
    Corrupt {
        /// Path of the queue file.
        path: PathBuf,
        /// Why it was rejected.
        message: String,
    },

    /// A lock needed by the processor failed.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// The processor could not write its periodic checkpoint.
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

/// Errors raised while writing or validating checkpoints.
#[derive(Error, Debug)]
pub enum CheckpointError {
    /// A checkpoint failed structural validation.
    #[error("Checkpoint {path} is corrupt: {reason}")]
    Corrupt {
        /// Path of the checkpoint.
        path: PathBuf,
        /// Why it was rejected.
        reason: String,
    },

    /// Checkpoints exist but none of them is valid; processing must halt.
    #[error("None of the {examined} retained checkpoint(s) is valid; operator intervention required")]
    NoValidCheckpoint {
        /// Number of checkpoints that were examined.
        examined: usize,
    },

    /// Filesystem failure while handling checkpoints.
    #[error("Checkpoint I/O failure at {path}: {message}")]
    Io {
        /// Path involved.
        path: PathBuf,
        /// Underlying error message.
        message: String,
    },
}

impl CheckpointError {
    /// Whether the stored state itself is bad, as opposed to the filesystem failing.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            CheckpointError::Corrupt { .. } | CheckpointError::NoValidCheckpoint { .. }
        )
    }
}

/// Errors that can occur during git operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GitError {
    /// The specified path is not a valid git repository.
    #[error("Not a valid git repository: {path}")]
    NotARepository {
        /// Path that was expected to be a repository.
        path: PathBuf,
    },

    /// The repository path does not exist.
    #[error("Repository path does not exist: {path}")]
    PathNotFound {
        /// Path that was not found.
        path: PathBuf,
    },

    /// A git command execution failed.
    #[error("Git command failed: {command} - {message}")]
    CommandFailed {
        /// The git command that failed.
        command: String,
        /// Error message from git.
        message: String,
    },

    /// Invalid git reference (contains invalid characters).
    #[error("Invalid git reference '{reference}': contains forbidden characters")]
    InvalidReference {
        /// The invalid reference string.
        reference: String,
    },

    /// The reference does not resolve to a commit.
    #[error("Unknown git reference '{reference}'")]
    UnknownReference {
        /// The reference that failed to resolve.
        reference: String,
    },

    /// A compare-and-swap ref update lost the race.
    #[error("Update of '{reference}' rejected: {message}")]
    RefUpdateRejected {
        /// Reference that was being advanced.
        reference: String,
        /// Error message from git.
        message: String,
    },

    /// The installed git cannot perform an in-memory merge.
    #[error("Installed git does not support 'merge-tree --write-tree' (git >= 2.38 required)")]
    MergeTreeUnsupported,
}

/// Errors that can occur during configuration loading and validation.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A required configuration field is missing.
    #[error("{field} is required (use --{field}, {env_var} env var, or config file)")]
    MissingRequired {
        /// Name of the missing field.
        field: String,
        /// Environment variable name for this field.
        env_var: String,
    },

    /// Failed to read the configuration file.
    #[error("Failed to read config file at {path}: {message}")]
    FileReadError {
        /// Path to the config file.
        path: PathBuf,
        /// Error message.
        message: String,
    },

    /// Failed to parse the configuration file.
    #[error("Failed to parse config file at {path}: {message}")]
    ParseError {
        /// Path to the config file.
        path: PathBuf,
        /// Parse error message.
        message: String,
    },

    /// An invalid value was provided for a configuration field.
    #[error("Invalid value for {field}: {message}")]
    InvalidValue {
        /// Name of the field with invalid value.
        field: String,
        /// Description of why the value is invalid.
        message: String,
    },

    /// Failed to create a directory the configuration points at.
    #[error("Failed to create directory at {path}: {message}")]
    DirectoryCreationError {
        /// Path where directory creation failed.
        path: PathBuf,
        /// Error message.
        message: String,
    },
}

/// Persisted classification of why a merge request is not (yet) merged.
///
/// Stored in [`crate::core::queue::RequestError`] so status surfaces can report
/// the failure class without parsing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// A lock was not granted within its timeout.
    LockTimeout,
    /// A non-blocking lock attempt found the lock held.
    LockBusy,
    /// The precheck found conflicts that need a human.
    ConflictDetected,
    /// Automatic rebase could not resolve the conflict.
    RebaseFailed,
    /// The atomic integrate-and-advance step failed.
    IntegrationFailed,
    /// A checkpoint failed validation.
    CheckpointCorrupt,
    /// A lock whose holder died was reclaimed.
    OrphanLock,
    /// The dry-run merge itself could not be computed.
    PrecheckFailed,
    /// The request conflicted more times than the retry ceiling allows.
    RetryCeilingExceeded,
    /// The request stayed in manual resolution longer than allowed.
    ManualResidencyExpired,
    /// The request failed validation at submission.
    ValidationFailed,
    /// The processor that owned the request died mid-flight.
    OwnerLost,
}

impl ErrorKind {
    /// Returns the stable upper-case name used in reports.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::LockTimeout => "LOCK_TIMEOUT",
            ErrorKind::LockBusy => "LOCK_BUSY",
            ErrorKind::ConflictDetected => "CONFLICT_DETECTED",
            ErrorKind::RebaseFailed => "REBASE_FAILED",
            ErrorKind::IntegrationFailed => "INTEGRATION_FAILED",
            ErrorKind::CheckpointCorrupt => "CHECKPOINT_CORRUPT",
            ErrorKind::OrphanLock => "ORPHAN_LOCK",
            ErrorKind::PrecheckFailed => "PRECHECK_FAILED",
            ErrorKind::RetryCeilingExceeded => "RETRY_CEILING_EXCEEDED",
            ErrorKind::ManualResidencyExpired => "MANUAL_RESIDENCY_EXPIRED",
            ErrorKind::ValidationFailed => "VALIDATION_FAILED",
            ErrorKind::OwnerLost => "OWNER_LOST",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TrunklineError {
    /// Taxonomy entry for errors that have one.
    pub fn kind(&self) -> Option<ErrorKind> {
        let lock = |e: &LockError| match e {
            LockError::Timeout { .. } => Some(ErrorKind::LockTimeout),
            LockError::Busy { .. } => Some(ErrorKind::LockBusy),
            _ => None,
        };
        match self {
            TrunklineError::Lock(e) | TrunklineError::Queue(QueueError::Lock(e)) => lock(e),
            TrunklineError::Queue(QueueError::ProcessorBusy { .. }) => Some(ErrorKind::LockBusy),
            TrunklineError::Queue(QueueError::Checkpoint(e)) | TrunklineError::Checkpoint(e)
                if e.is_corruption() =>
            {
                Some(ErrorKind::CheckpointCorrupt)
            }
            _ => None,
        }
    }
}

/// Type alias for Results using TrunklineError.
///
/// Note: This is not re-exported from the crate root to avoid shadowing `anyhow::Result`.
/// Use explicitly as `error::TrunklineResult<T>` when needed.
pub type TrunklineResult<T> = std::result::Result<T, TrunklineError>;

#[cfg(test)]
mod tests {
    use super::*;

    /// # Lock Error Display
    ///
    /// Tests that lock errors name the resource group and the relevant detail.
    ///
    /// ## Test Scenario
    /// - Creates timeout and busy errors
    ///
    /// ## Expected Outcome
    /// - Messages contain the group id, the wait time and the holder pid
    #[test]
    fn test_lock_error_display() {
        let timeout = LockError::Timeout {
            resource_group_id: "integration".to_string(),
            waited: Duration::from_millis(250),
        };
        let msg = timeout.to_string();
        assert!(msg.contains("integration"));
        assert!(msg.contains("250ms"));

        let busy = LockError::Busy {
            resource_group_id: "queue-processor".to_string(),
            holder_pid: 4242,
        };
        assert!(busy.to_string().contains("4242"));
    }

    /// # Guarded Error Keeps Causes Apart
    ///
    /// Tests that guarded errors distinguish lock failures from operation failures.
    ///
    /// ## Test Scenario
    /// - Wraps a lock timeout and an operation error
    ///
    /// ## Expected Outcome
    /// - The lock variant displays the lock message unchanged
    /// - The operation variant displays the operation's message
    #[test]
    fn test_guarded_error_display() {
        let lock: GuardedError<String> = GuardedError::Lock(LockError::Busy {
            resource_group_id: "g".to_string(),
            holder_pid: 1,
        });
        assert!(lock.to_string().starts_with("Lock on 'g'"));

        let op: GuardedError<String> = GuardedError::Operation("boom".to_string());
        assert_eq!(op.to_string(), "boom");
    }

    /// # Error Conversion
    ///
    /// Tests that errors convert correctly through the From trait.
    ///
    /// ## Test Scenario
    /// - Creates specific error types
    /// - Converts them to TrunklineError
    ///
    /// ## Expected Outcome
    /// - All error types convert seamlessly to TrunklineError
    #[test]
    fn test_error_conversion() {
        let err: TrunklineError = LockError::Busy {
            resource_group_id: "g".to_string(),
            holder_pid: 7,
        }
        .into();
        assert!(matches!(err, TrunklineError::Lock(_)));

        let err: TrunklineError = QueueError::NotFound {
            id: "mr-1".to_string(),
        }
        .into();
        assert!(matches!(err, TrunklineError::Queue(_)));

        let err: TrunklineError = CheckpointError::NoValidCheckpoint { examined: 2 }.into();
        assert!(matches!(err, TrunklineError::Checkpoint(_)));

        let err: TrunklineError = GitError::MergeTreeUnsupported.into();
        assert!(matches!(err, TrunklineError::Git(_)));
    }

    /// # Only Bad Checkpoints Are Labelled Corrupt
    ///
    /// ## Test Scenario
    /// - Asks for the kind of corrupt, missing-valid and I/O checkpoint errors, directly
    ///   and nested in a queue error
    ///
    /// ## Expected Outcome
    /// - `CHECKPOINT_CORRUPT` for the first two; an I/O failure has no kind
    #[test]
    fn test_checkpoint_kind_excludes_io() {
        let io = || CheckpointError::Io {
            path: PathBuf::from("/state/checkpoints"),
            message: "No space left on device".to_string(),
        };
        let corrupt = || CheckpointError::Corrupt {
            path: PathBuf::from("/state/checkpoints/checkpoint-3.json"),
            reason: "checksum mismatch".to_string(),
        };

        assert_eq!(
            TrunklineError::Checkpoint(corrupt()).kind(),
            Some(ErrorKind::CheckpointCorrupt)
        );
        assert_eq!(
            TrunklineError::Checkpoint(CheckpointError::NoValidCheckpoint { examined: 1 }).kind(),
            Some(ErrorKind::CheckpointCorrupt)
        );
        assert_eq!(
            TrunklineError::Queue(QueueError::Checkpoint(corrupt())).kind(),
            Some(ErrorKind::CheckpointCorrupt)
        );
        assert_eq!(TrunklineError::Checkpoint(io()).kind(), None);
        assert_eq!(TrunklineError::Queue(QueueError::Checkpoint(io())).kind(), None);
    }

    /// # Error Kind Serialization
    ///
    /// Verifies that the persisted taxonomy uses the upper-case names.
    ///
    /// ## Test Scenario
    /// - Serializes error kinds to JSON and back
    ///
    /// ## Expected Outcome
    /// - JSON strings match `as_str` and parse back to the same variant
    #[test]
    fn test_error_kind_serialization() {
        for kind in [
            ErrorKind::LockTimeout,
            ErrorKind::RebaseFailed,
            ErrorKind::RetryCeilingExceeded,
            ErrorKind::ManualResidencyExpired,
        ] {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
            let back: ErrorKind = serde_json::from_str(&json).unwrap();
            assert_eq!(back, kind);
        }
    }
}

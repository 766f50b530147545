//! Coordination engine.
//!
//! - [`lock`]: advisory locks over named resource groups, with a lifecycle registry
//! - [`monitor`]: background reclamation of orphaned and over-age locks
//! - [`conflict`]: static overlap classification and dynamic merge prechecks
//! - [`queue`]: the durable merge queue and its single-writer processor
//! - [`recovery`]: startup reconciliation after a crash
//! - [`state`]: state directory layout, atomic files and checkpoints
//! - [`output`]: text and JSON rendering for the CLI

pub mod conflict;
pub mod lock;
pub mod monitor;
pub mod output;
pub mod process;
pub mod queue;
pub mod recovery;
pub mod repository;
pub mod state;

use crate::core::queue::RequestStatus;
use crate::error::{LockError, QueueError, TrunklineError};

/// Exit codes for CLI commands.
///
/// These codes are designed for consumption by CI systems and worker scripts,
/// providing clear semantics for different outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExitCode {
    /// The command completed successfully.
    Success = 0,

    /// General error (configuration, git, storage, invalid input).
    GeneralError = 1,

    /// The request is waiting for manual conflict resolution.
    Conflict = 2,

    /// The request failed or was rejected.
    Failed = 3,

    /// No merge request with the given id.
    NotFound = 4,

    /// Durable state is corrupt and no valid checkpoint remains.
    CheckpointCorrupt = 5,

    /// A lock could not be acquired within its timeout.
    LockTimeout = 6,

    /// The lock or queue processor is held by someone else.
    Locked = 7,
}

impl ExitCode {
    /// Returns the numeric exit code value.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Returns a human-readable description of the exit code.
    pub fn description(self) -> &'static str {
        match self {
            ExitCode::Success => "Completed successfully",
            ExitCode::GeneralError => "General error occurred",
            ExitCode::Conflict => "Conflict detected - resolve it and run 'resolve'",
            ExitCode::Failed => "Merge request failed or was rejected",
            ExitCode::NotFound => "No such merge request",
            ExitCode::CheckpointCorrupt => "State is corrupt and no valid checkpoint exists",
            ExitCode::LockTimeout => "Timed out waiting for a lock",
            ExitCode::Locked => "Lock is held by another process",
        }
    }

    /// Exit code reporting where a merge request currently stands.
    pub fn for_status(status: RequestStatus) -> Self {
        match status {
            RequestStatus::ManualRequired => ExitCode::Conflict,
            RequestStatus::Failed | RequestStatus::Rejected => ExitCode::Failed,
            _ => ExitCode::Success,
        }
    }

    pub fn from_error(error: &TrunklineError) -> Self {
        fn lock(error: &LockError) -> ExitCode {
            match error {
                LockError::Timeout { .. } => ExitCode::LockTimeout,
                LockError::Busy { .. } => ExitCode::Locked,
                _ => ExitCode::GeneralError,
            }
        }

        match error {
            TrunklineError::Lock(e) => lock(e),
            TrunklineError::Queue(QueueError::NotFound { .. }) => ExitCode::NotFound,
            TrunklineError::Queue(QueueError::ProcessorBusy { .. }) => ExitCode::Locked,
            TrunklineError::Queue(QueueError::Lock(e)) => lock(e),
            TrunklineError::Queue(QueueError::Checkpoint(e)) | TrunklineError::Checkpoint(e)
                if e.is_corruption() =>
            {
                ExitCode::CheckpointCorrupt
            }
            TrunklineError::Queue(QueueError::Corrupt { .. }) => ExitCode::CheckpointCorrupt,
            _ => ExitCode::GeneralError,
        }
    }
}

impl From<ExitCode> for std::process::ExitCode {
    fn from(code: ExitCode) -> Self {
        std::process::ExitCode::from(code.code())
    }
}

impl std::fmt::Display for ExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CheckpointError;
    use std::time::Duration;

    /// # Exit Code Values
    ///
    /// Verifies that all exit codes have the correct numeric values.
    ///
    /// ## Test Scenario
    /// - Checks each exit code variant against its expected value
    ///
    /// ## Expected Outcome
    /// - All exit codes map to their documented numeric values
    #[test]
    fn test_exit_code_values() {
        assert_eq!(ExitCode::Success.code(), 0);
        assert_eq!(ExitCode::GeneralError.code(), 1);
        assert_eq!(ExitCode::Conflict.code(), 2);
        assert_eq!(ExitCode::Failed.code(), 3);
        assert_eq!(ExitCode::NotFound.code(), 4);
        assert_eq!(ExitCode::CheckpointCorrupt.code(), 5);
        assert_eq!(ExitCode::LockTimeout.code(), 6);
        assert_eq!(ExitCode::Locked.code(), 7);
    }

    /// # Exit Codes For Request Status
    ///
    /// ## Test Scenario
    /// - Maps every resting status
    ///
    /// ## Expected Outcome
    /// - Manual is a conflict, failed and rejected are failures, the rest succeed
    #[test]
    fn test_exit_code_for_status() {
        assert_eq!(ExitCode::for_status(RequestStatus::Merged), ExitCode::Success);
        assert_eq!(ExitCode::for_status(RequestStatus::Queued), ExitCode::Success);
        assert_eq!(
            ExitCode::for_status(RequestStatus::ManualRequired),
            ExitCode::Conflict
        );
        assert_eq!(ExitCode::for_status(RequestStatus::Failed), ExitCode::Failed);
        assert_eq!(ExitCode::for_status(RequestStatus::Rejected), ExitCode::Failed);
    }

    /// # Exit Codes For Errors
    ///
    /// ## Test Scenario
    /// - Maps lock, queue and checkpoint errors, directly and nested
    ///
    /// ## Expected Outcome
    /// - Timeouts, busy locks, missing requests and corrupt state get their own codes
    #[test]
    fn test_exit_code_from_error() {
        let timeout = || LockError::Timeout {
            resource_group_id: "build".to_string(),
            waited: Duration::from_secs(1),
        };
        assert_eq!(
            ExitCode::from_error(&TrunklineError::Lock(timeout())),
            ExitCode::LockTimeout
        );
        assert_eq!(
            ExitCode::from_error(&TrunklineError::Queue(QueueError::Lock(timeout()))),
            ExitCode::LockTimeout
        );
        assert_eq!(
            ExitCode::from_error(&TrunklineError::Queue(QueueError::ProcessorBusy {
                holder_pid: 42
            })),
            ExitCode::Locked
        );
        assert_eq!(
            ExitCode::from_error(&TrunklineError::Queue(QueueError::NotFound {
                id: "mr-9".to_string()
            })),
            ExitCode::NotFound
        );
        assert_eq!(
            ExitCode::from_error(&TrunklineError::Checkpoint(
                CheckpointError::NoValidCheckpoint { examined: 2 }
            )),
            ExitCode::CheckpointCorrupt
        );
        assert_eq!(
            ExitCode::from_error(&TrunklineError::Checkpoint(CheckpointError::Io {
                path: "/state/checkpoints".into(),
                message: "No space left on device".to_string(),
            })),
            ExitCode::GeneralError
        );
        assert_eq!(
            ExitCode::from_error(&TrunklineError::Other(anyhow::anyhow!("boom"))),
            ExitCode::GeneralError
        );
    }

    /// # Exit Code Display
    ///
    /// Verifies that exit codes can be displayed as strings.
    ///
    /// ## Test Scenario
    /// - Uses Display trait to format exit codes
    ///
    /// ## Expected Outcome
    /// - Exit codes format to their description strings
    #[test]
    fn test_exit_code_display() {
        assert_eq!(
            format!("{}", ExitCode::Locked),
            ExitCode::Locked.description()
        );
        let _: std::process::ExitCode = ExitCode::Conflict.into();
    }
}

//! Advisory mutex locks over named resource groups.
//!
//! A resource group is a caller-chosen name for a set of paths that must not be modified
//! concurrently. [`LockManager`] grants at most one holder per group, records every
//! acquisition and release in the [`Registry`], and releases guarded locks on every exit
//! path.
//!
//! # Storage Layout
//!
//! ```text
//! <state>/locks/<group>-<hash>.lock   current holder (empty when free)
//! <state>/registry.jsonl              lifecycle history, append-only
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use trunkline::core::lock::LockManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let locks = LockManager::file_backed(std::path::Path::new("/tmp/trunkline-state"))?;
//! let written = locks.execute_guarded("frontend", Duration::from_secs(5), |_handle| {
//!     std::fs::write("src/app.ts", "// edited")
//! })?;
//! # Ok(())
//! # }
//! ```

mod backend;
mod manager;
mod memory;
mod registry;
mod types;

pub use backend::{FileLockBackend, LockBackend};
pub use manager::{DEFAULT_POLL_INTERVAL, LOCKS_DIR, LockGuard, LockManager};
pub use memory::MemoryLockBackend;
pub use registry::{REGISTRY_FILE, Registry, RegistryEntry};
pub use types::{
    AcquireAttempt, INTEGRATION_GROUP, LockHandle, LockHolder, LockRecord, LockRequest,
    LockState, LockStatus, MAX_GROUP_ID_LEN, QUEUE_PROCESSOR_GROUP, check_group_id,
};

//! # Trunkline
//!
//! Coordinates concurrent workers that modify and integrate into one shared git
//! repository:
//!
//! - Advisory locks over named resource groups, with a lifecycle registry and a deadlock
//!   monitor that reclaims locks left by dead or stalled holders
//! - Conflict detection, statically over declared path patterns and dynamically with an
//!   in-memory three-way merge
//! - A durable FIFO merge queue with automatic rebase, manual resolution and bounded
//!   retries
//! - Checkpoints and crash recovery
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use trunkline::{Config, Coordinator};
//!
//! # fn main() -> anyhow::Result<()> {
//! let settings = Config::load_from_file()?
//!     .merge(Config::load_from_env())
//!     .resolve()?;
//! let coordinator = Coordinator::open(settings)?;
//!
//! coordinator.recover()?;
//! let request = coordinator.submit_merge("feature/payments", "main")?;
//! coordinator.process_queue(None)?;
//! println!("{}", coordinator.get_merge_outcome(&request.id)?.status);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod coordinator;
pub mod core;
pub mod error;
pub mod git;
pub mod logging;
pub mod models;
pub mod parsed_property;

// Re-export commonly used types for convenience
pub use config::Config;
pub use coordinator::{Coordinator, CoordinatorSettings};
pub use core::ExitCode;
pub use error::{ErrorKind, TrunklineError, TrunklineResult};
pub use models::Args;

/// Core result type used throughout the library
pub type Result<T> = anyhow::Result<T>;

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

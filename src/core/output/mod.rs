//! Command output.
//!
//! Every report the CLI prints implements both `Serialize` and [`TextReport`];
//! [`OutputWriter`] picks one rendering based on the selected [`OutputFormat`].
//!
//! [`OutputFormat`]: crate::models::OutputFormat

mod format;
mod report;

pub use format::{OutputWriter, TextReport};
pub use report::status_symbol;

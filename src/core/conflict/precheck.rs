//! Dynamic precheck: will this source merge cleanly into the current target tip?

use serde::{Deserialize, Serialize};

use crate::core::repository::{FileConflict, Repository};
use crate::error::GitError;

/// Default ceiling on conflicting files for an automatic rebase.
pub const DEFAULT_AUTO_REBASE_MAX_FILES: usize = 3;

/// How a conflicted request should proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Resolution {
    AutoRebase,
    ManualRequired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum PrecheckVerdict {
    /// Merges without conflicts.
    Clean,
    /// The source is already contained in the target.
    AlreadyIntegrated,
    Conflicted {
        files: Vec<FileConflict>,
        /// Whether any conflict changes the tree's shape.
        structural: bool,
        resolution: Resolution,
    },
}

impl PrecheckVerdict {
    pub fn is_clean(&self) -> bool {
        matches!(self, PrecheckVerdict::Clean)
    }
}

/// Picks a resolution for a set of conflicts.
///
/// Only a small number of plain content conflicts is left to an automatic rebase;
/// anything structural, or more files than `auto_rebase_max_files`, needs a person.
pub fn classify_conflicts(files: Vec<FileConflict>, auto_rebase_max_files: usize) -> PrecheckVerdict {
    if files.is_empty() {
        return PrecheckVerdict::Clean;
    }
    let structural = files.iter().any(|f| f.kind.is_structural());
    let resolution = if !structural && files.len() <= auto_rebase_max_files {
        Resolution::AutoRebase
    } else {
        Resolution::ManualRequired
    };
    PrecheckVerdict::Conflicted {
        files,
        structural,
        resolution,
    }
}

/// Simulates merging `source` into `target` and classifies the result.
///
/// Nothing is written to the repository.
pub fn precheck(
    repo: &dyn Repository,
    source: &str,
    target: &str,
    auto_rebase_max_files: usize,
) -> Result<PrecheckVerdict, GitError> {
    let source_commit = repo.resolve(source)?;
    let target_commit = repo.resolve(target)?;
    if repo.is_ancestor(&source_commit, &target_commit)? {
        return Ok(PrecheckVerdict::AlreadyIntegrated);
    }
    let merge = repo.dry_run_merge(source, target)?;
    Ok(classify_conflicts(merge.conflicts, auto_rebase_max_files))
}

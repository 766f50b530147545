//! The version-control operations the merge queue relies on.
//!
//! [`Repository`] is implemented for real repositories by [`crate::git::GitCli`]; the
//! queue, the precheck and the coordinator only ever see the trait.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::GitError;

/// Kind of a conflict reported by a dry-run merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Both sides changed the same lines of a file.
    Content,
    AddAdd,
    ModifyDelete,
    RenameDelete,
    RenameRename,
    FileDirectory,
    /// A path changed type (file, symlink, submodule) differently on each side.
    DistinctTypes,
    Submodule,
    /// Any other conflict git reports.
    Other,
}

impl ConflictKind {
    /// Maps the label git prints in `CONFLICT (<label>): ...`.
    pub fn from_label(label: &str) -> Self {
        match label.trim() {
            "content" => ConflictKind::Content,
            "add/add" => ConflictKind::AddAdd,
            "modify/delete" | "delete/modify" => ConflictKind::ModifyDelete,
            "rename/delete" | "delete/rename" => ConflictKind::RenameDelete,
            "rename/rename" | "rename/add" | "rename involved in collision" => {
                ConflictKind::RenameRename
            }
            "file/directory" | "directory/file" | "file location" => ConflictKind::FileDirectory,
            "distinct types" => ConflictKind::DistinctTypes,
            "submodule" | "modify/modify" => ConflictKind::Submodule,
            _ => ConflictKind::Other,
        }
    }

    /// Everything except line-level content conflicts changes the tree's shape.
    pub fn is_structural(self) -> bool {
        !matches!(self, ConflictKind::Content)
    }
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConflictKind::Content => "content",
            ConflictKind::AddAdd => "add/add",
            ConflictKind::ModifyDelete => "modify/delete",
            ConflictKind::RenameDelete => "rename/delete",
            ConflictKind::RenameRename => "rename/rename",
            ConflictKind::FileDirectory => "file/directory",
            ConflictKind::DistinctTypes => "distinct types",
            ConflictKind::Submodule => "submodule",
            ConflictKind::Other => "other",
        };
        f.write_str(label)
    }
}

/// One conflicting path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileConflict {
    pub path: String,
    pub kind: ConflictKind,
}

impl FileConflict {
    pub fn new(path: impl Into<String>, kind: ConflictKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

/// Result of merging two revisions without touching any ref or working tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DryRunMerge {
    pub conflicts: Vec<FileConflict>,
}

impl DryRunMerge {
    pub fn is_clean(&self) -> bool {
        self.conflicts.is_empty()
    }
}

/// Result of rebasing a source branch onto a new base.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RebaseOutcome {
    /// The branch now points at `new_head`.
    Rebased { new_head: String },
    /// Replaying hit conflicts; the branch is unchanged.
    Conflicted { files: Vec<String> },
}

/// Operations on the shared repository.
pub trait Repository: Send + Sync + fmt::Debug {
    /// Resolves a reference to a commit id.
    fn resolve(&self, reference: &str) -> Result<String, GitError>;

    /// Whether `ancestor` is reachable from `descendant`.
    fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool, GitError>;

    /// Three-way merges `source` into `target` in memory and reports conflicts.
    fn dry_run_merge(&self, source: &str, target: &str) -> Result<DryRunMerge, GitError>;

    /// Rebases branch `source` onto `onto`, moving the branch only on success.
    fn rebase(&self, source: &str, onto: &str) -> Result<RebaseOutcome, GitError>;

    /// Merges `source` into branch `target` and advances it in one step.
    ///
    /// The advance only happens if `target` still points at `expected_tip`. Returns the
    /// new tip.
    fn integrate(
        &self,
        source: &str,
        target: &str,
        expected_tip: &str,
        message: &str,
    ) -> Result<String, GitError>;
}

//! Git plumbing behind [`Repository`].
//!
//! Everything runs through the `git` binary. Merges are computed in memory with
//! `git merge-tree --write-tree` (git 2.38+), so neither the precheck nor the integration
//! touches a working tree. The trunk only moves through `git update-ref <ref> <new> <old>`,
//! which fails if someone else moved it first. Rebases run in a throwaway worktree.

use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::OnceLock;
use tempfile::TempDir;
use tracing::{debug, warn};

use crate::core::repository::{ConflictKind, DryRunMerge, FileConflict, RebaseOutcome, Repository};
use crate::error::GitError;

static CONFLICT_MESSAGE_REGEX: OnceLock<Regex> = OnceLock::new();

fn conflict_message_regex() -> &'static Regex {
    CONFLICT_MESSAGE_REGEX.get_or_init(|| {
        Regex::new(r"^CONFLICT \(([^)]+)\): (.*)$").expect("Failed to compile conflict regex")
    })
}

/// Rejects names that are not valid git references or could be read as options.
pub fn validate_reference(reference: &str) -> Result<(), GitError> {
    let invalid = || GitError::InvalidReference {
        reference: reference.to_string(),
    };
    if reference.is_empty()
        || reference.starts_with('-')
        || reference.starts_with('/')
        || reference.ends_with('/')
        || reference.ends_with('.')
        || reference.ends_with(".lock")
        || reference.contains("..")
        || reference.contains("@{")
        || reference.contains("//")
        || reference == "@"
    {
        return Err(invalid());
    }
    const FORBIDDEN: &[char] = &[
        '~', '^', ':', '?', '*', '[', '\\', ';', '|', '&', '$', '`', '<', '>', '\'', '"',
    ];
    if reference
        .chars()
        .any(|c| c.is_whitespace() || c.is_control() || FORBIDDEN.contains(&c))
    {
        return Err(invalid());
    }
    if reference.split('/').any(|part| part.starts_with('.')) {
        return Err(invalid());
    }
    Ok(())
}

/// Name and email recorded on integration commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitIdentity {
    pub name: String,
    pub email: String,
}

/// [`Repository`] backed by the `git` command line.
#[derive(Debug, Clone)]
pub struct GitCli {
    repo_path: PathBuf,
    identity: Option<CommitIdentity>,
}

impl GitCli {
    /// Opens the repository containing `path`.
    pub fn open(path: &Path) -> Result<Self, GitError> {
        if !path.exists() {
            return Err(GitError::PathNotFound {
                path: path.to_path_buf(),
            });
        }
        let output = Command::new("git")
            .current_dir(path)
            .args(["rev-parse", "--show-toplevel"])
            .output()
            .map_err(|e| GitError::CommandFailed {
                command: "git rev-parse --show-toplevel".to_string(),
                message: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(GitError::NotARepository {
                path: path.to_path_buf(),
            });
        }
        let root = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(Self {
            repo_path: PathBuf::from(root),
            identity: None,
        })
    }

    pub fn with_identity(mut self, identity: Option<CommitIdentity>) -> Self {
        self.identity = identity;
        self
    }

    /// Top-level directory of the working tree.
    pub fn path(&self) -> &Path {
        &self.repo_path
    }

    fn command(&self, dir: &Path, args: &[&str]) -> Command {
        let mut command = Command::new("git");
        command.current_dir(dir).args(args);
        if let Some(identity) = &self.identity {
            command
                .env("GIT_AUTHOR_NAME", &identity.name)
                .env("GIT_AUTHOR_EMAIL", &identity.email)
                .env("GIT_COMMITTER_NAME", &identity.name)
                .env("GIT_COMMITTER_EMAIL", &identity.email);
        }
        command
    }

    fn output_in(&self, dir: &Path, args: &[&str]) -> Result<Output, GitError> {
        debug!(args = ?args, "git");
        self.command(dir, args)
            .output()
            .map_err(|e| GitError::CommandFailed {
                command: format!("git {}", args.join(" ")),
                message: e.to_string(),
            })
    }

    /// Runs git in `dir` and returns trimmed stdout, failing on a non-zero exit.
    fn run_in(&self, dir: &Path, args: &[&str]) -> Result<String, GitError> {
        let output = self.output_in(dir, args)?;
        if !output.status.success() {
            return Err(GitError::CommandFailed {
                command: format!("git {}", args.join(" ")),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn run(&self, args: &[&str]) -> Result<String, GitError> {
        self.run_in(&self.repo_path, args)
    }

    /// Whether the installed git can merge without a working tree.
    pub fn supports_merge_tree(&self) -> bool {
        self.run(&["--version"])
            .ok()
            .and_then(|v| parse_git_version(&v))
            .is_some_and(|version| version >= (2, 38))
    }

    /// Full ref name (`refs/heads/main`) for a branch name.
    fn full_ref(&self, reference: &str) -> Result<String, GitError> {
        validate_reference(reference)?;
        let full = self
            .run(&["rev-parse", "--symbolic-full-name", reference])
            .unwrap_or_default();
        if full.starts_with("refs/") {
            Ok(full)
        } else {
            Err(GitError::UnknownReference {
                reference: reference.to_string(),
            })
        }
    }

    /// In-memory merge of two commits. `Ok(tree)` when clean, `Err(stdout)` when conflicted.
    fn merge_tree(&self, ours: &str, theirs: &str) -> Result<Result<String, String>, GitError> {
        let args = ["merge-tree", "--write-tree", "--name-only", ours, theirs];
        let output = self.output_in(&self.repo_path, &args)?;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        match output.status.code() {
            Some(0) => Ok(Ok(stdout.lines().next().unwrap_or_default().to_string())),
            Some(1) => Ok(Err(stdout)),
            _ => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                if stderr.contains("write-tree") || stderr.contains("usage:") {
                    return Err(GitError::MergeTreeUnsupported);
                }
                Err(GitError::CommandFailed {
                    command: args.join(" "),
                    message: stderr.trim().to_string(),
                })
            }
        }
    }
}

/// Parses `git version 2.43.0` into `(2, 43)`.
fn parse_git_version(output: &str) -> Option<(u32, u32)> {
    let version = output.split_whitespace().nth(2)?;
    let mut parts = version.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

/// Reads the conflicted-file section and the `CONFLICT (<kind>)` messages of
/// `git merge-tree --write-tree --name-only` output.
///
/// A file named by several messages keeps its most severe kind; a file named by none is
/// classified `Other`.
pub fn parse_merge_tree_conflicts(stdout: &str) -> Vec<FileConflict> {
    let mut lines = stdout.lines().skip(1);
    let mut files: BTreeMap<String, Option<ConflictKind>> = BTreeMap::new();
    for line in lines.by_ref() {
        if line.is_empty() {
            break;
        }
        files.insert(line.to_string(), None);
    }

    for line in lines {
        let Some(captures) = conflict_message_regex().captures(line) else {
            continue;
        };
        let kind = ConflictKind::from_label(&captures[1]);
        let message = &captures[2];
        for (path, slot) in files.iter_mut() {
            if !message.contains(path.as_str()) {
                continue;
            }
            match slot {
                Some(existing) if existing.is_structural() || !kind.is_structural() => {}
                _ => *slot = Some(kind),
            }
        }
    }

    files
        .into_iter()
        .map(|(path, kind)| FileConflict::new(path, kind.unwrap_or(ConflictKind::Other)))
        .collect()
}

/// Detached worktree removed on drop.
struct ScratchWorktree<'a> {
    git: &'a GitCli,
    _dir: TempDir,
    path: PathBuf,
}

impl<'a> ScratchWorktree<'a> {
    fn create(git: &'a GitCli, commit: &str) -> Result<Self, GitError> {
        let dir = TempDir::new().map_err(|e| GitError::CommandFailed {
            command: "create worktree directory".to_string(),
            message: e.to_string(),
        })?;
        let path = dir.path().join("rebase");
        let path_str = path.to_string_lossy().to_string();
        git.run(&["worktree", "add", "--detach", &path_str, commit])?;
        Ok(Self {
            git,
            _dir: dir,
            path,
        })
    }
}

impl Drop for ScratchWorktree<'_> {
    fn drop(&mut self) {
        let path = self.path.to_string_lossy().to_string();
        if let Err(e) = self.git.run(&["worktree", "remove", "--force", &path]) {
            warn!(path = %path, error = %e, "Failed to remove scratch worktree");
        }
        let _ = self.git.run(&["worktree", "prune"]);
    }
}

impl Repository for GitCli {
    fn resolve(&self, reference: &str) -> Result<String, GitError> {
        validate_reference(reference)?;
        let spec = format!("{}^{{commit}}", reference);
        self.run(&["rev-parse", "--verify", "--quiet", &spec])
            .map_err(|_| GitError::UnknownReference {
                reference: reference.to_string(),
            })
    }

    fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool, GitError> {
        let args = ["merge-base", "--is-ancestor", ancestor, descendant];
        let output = self.output_in(&self.repo_path, &args)?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(GitError::CommandFailed {
                command: format!("git {}", args.join(" ")),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }),
        }
    }

    fn dry_run_merge(&self, source: &str, target: &str) -> Result<DryRunMerge, GitError> {
        let conflicts = match self.merge_tree(target, source)? {
            Ok(_) => Vec::new(),
            Err(stdout) => parse_merge_tree_conflicts(&stdout),
        };
        Ok(DryRunMerge { conflicts })
    }

    fn rebase(&self, source: &str, onto: &str) -> Result<RebaseOutcome, GitError> {
        let source_ref = self.full_ref(source)?;
        if !source_ref.starts_with("refs/heads/") {
            return Err(GitError::CommandFailed {
                command: "rebase".to_string(),
                message: format!("'{}' is not a local branch", source),
            });
        }
        let old_head = self.resolve(source)?;
        let onto_commit = self.resolve(onto)?;

        let worktree = ScratchWorktree::create(self, &old_head)?;
        let output = self.output_in(&worktree.path, &["rebase", &onto_commit])?;
        if !output.status.success() {
            let conflicted = self
                .run_in(&worktree.path, &["diff", "--name-only", "--diff-filter=U"])
                .unwrap_or_default();
            let _ = self.run_in(&worktree.path, &["rebase", "--abort"]);
            if conflicted.is_empty() {
                return Err(GitError::CommandFailed {
                    command: format!("git rebase {}", onto_commit),
                    message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                });
            }
            return Ok(RebaseOutcome::Conflicted {
                files: conflicted.lines().map(str::to_string).collect(),
            });
        }

        let new_head = self.run_in(&worktree.path, &["rev-parse", "HEAD"])?;
        drop(worktree);
        self.run(&[
            "update-ref",
            "-m",
            &format!("trunkline: rebase onto {}", onto),
            &source_ref,
            &new_head,
            &old_head,
        ])
        .map_err(|e| GitError::RefUpdateRejected {
            reference: source_ref.clone(),
            message: e.to_string(),
        })?;
        Ok(RebaseOutcome::Rebased { new_head })
    }

    fn integrate(
        &self,
        source: &str,
        target: &str,
        expected_tip: &str,
        message: &str,
    ) -> Result<String, GitError> {
        let target_ref = self.full_ref(target)?;
        let source_commit = self.resolve(source)?;

        let new_tip = if self.is_ancestor(expected_tip, &source_commit)? {
            source_commit
        } else {
            let tree = match self.merge_tree(expected_tip, &source_commit)? {
                Ok(tree) => tree,
                Err(stdout) => {
                    let files: Vec<String> = parse_merge_tree_conflicts(&stdout)
                        .into_iter()
                        .map(|c| c.path)
                        .collect();
                    return Err(GitError::CommandFailed {
                        command: "git merge-tree".to_string(),
                        message: format!("conflicts appeared in {}", files.join(", ")),
                    });
                }
            };
            self.run(&[
                "commit-tree",
                &tree,
                "-p",
                expected_tip,
                "-p",
                &source_commit,
                "-m",
                message,
            ])?
        };

        self.run(&[
            "update-ref",
            "-m",
            &format!("trunkline: {}", message),
            &target_ref,
            &new_tip,
            expected_tip,
        ])
        .map_err(|e| GitError::RefUpdateRejected {
            reference: target_ref,
            message: e.to_string(),
        })?;
        Ok(new_tip)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ScratchRepo;
    use super::*;

    /// # Reference Validation
    ///
    /// ## Test Scenario
    /// - Checks ordinary branch names and a set of malformed or hostile ones
    ///
    /// ## Expected Outcome
    /// - Ordinary names pass; the rest are `InvalidReference`
    #[test]
    fn test_validate_reference() {
        for ok in ["main", "feature/login", "release-1.2", "refs/heads/main", "HEAD"] {
            assert!(validate_reference(ok).is_ok(), "{}", ok);
        }
        for bad in [
            "", "-rf", "a..b", "a b", "a;rm", "x.lock", "dir/", "/abs", "a@{1}", "a~1", "a^", ".hidden",
            "a/.b", "$(id)",
        ] {
            assert!(
                matches!(validate_reference(bad), Err(GitError::InvalidReference { .. })),
                "{}",
                bad
            );
        }
    }

    /// # Merge-Tree Output Parsing
    ///
    /// ## Test Scenario
    /// - Parses output with a content conflict and a modify/delete conflict
    ///
    /// ## Expected Outcome
    /// - Each file carries its kind; the content file is not structural
    #[test]
    fn test_parse_merge_tree_conflicts() {
        let stdout = "\
4b825dc642cb6eb9a060e54bf8d69288fbee4904
src/auth.ts
src/old.ts

Auto-merging src/auth.ts
CONFLICT (content): Merge conflict in src/auth.ts
CONFLICT (modify/delete): src/old.ts deleted in main and modified in feature.  Version feature of src/old.ts left in tree.
";
        let conflicts = parse_merge_tree_conflicts(stdout);
        assert_eq!(
            conflicts,
            vec![
                FileConflict::new("src/auth.ts", ConflictKind::Content),
                FileConflict::new("src/old.ts", ConflictKind::ModifyDelete),
            ]
        );
    }

    /// # Version Parsing
    ///
    /// ## Test Scenario
    /// - Parses plain and vendor-suffixed version strings
    ///
    /// ## Expected Outcome
    /// - Major and minor are extracted
    #[test]
    fn test_parse_git_version() {
        assert_eq!(parse_git_version("git version 2.43.0"), Some((2, 43)));
        assert_eq!(
            parse_git_version("git version 2.39.3 (Apple Git-146)"),
            Some((2, 39))
        );
        assert_eq!(parse_git_version("nonsense"), None);
    }

    /// # Dry Run Finds Content Conflict
    ///
    /// ## Test Scenario
    /// - `main` and `feature` both change README.md differently
    ///
    /// ## Expected Outcome
    /// - One content conflict on README.md; `main` itself is untouched
    #[test]
    fn test_dry_run_finds_content_conflict() {
        let Some(repo) = ScratchRepo::new() else {
            return;
        };
        repo.branch_with("feature", "README.md", "feature\n");
        repo.commit("README.md", "main\n", "main changes readme");
        let before = repo.git(&["rev-parse", "main"]);

        let merge = repo.cli().dry_run_merge("feature", "main").unwrap();

        assert_eq!(
            merge.conflicts,
            vec![FileConflict::new("README.md", ConflictKind::Content)]
        );
        assert_eq!(repo.git(&["rev-parse", "main"]), before);
    }

    /// # Integrate Creates Merge Commit And Advances Trunk
    ///
    /// ## Test Scenario
    /// - `main` and `feature` touch different files; integrates feature
    ///
    /// ## Expected Outcome
    /// - `main` points at a two-parent commit containing both files
    #[test]
    fn test_integrate_creates_merge_commit() {
        let Some(repo) = ScratchRepo::new() else {
            return;
        };
        repo.branch_with("feature", "src/a.rs", "a\n");
        repo.commit("docs/b.md", "b\n", "docs");
        let cli = repo.cli().with_identity(Some(CommitIdentity {
            name: "Queue".to_string(),
            email: "queue@example.com".to_string(),
        }));
        let tip = cli.resolve("main").unwrap();

        let merged = cli.integrate("feature", "main", &tip, "Merge feature").unwrap();

        assert_eq!(cli.resolve("main").unwrap(), merged);
        let parents = repo.git(&["rev-list", "--parents", "-n", "1", &merged]);
        assert_eq!(parents.split_whitespace().count(), 3);
        let files = repo.git(&["ls-tree", "-r", "--name-only", &merged]);
        assert!(files.contains("src/a.rs") && files.contains("docs/b.md"));
        assert!(cli.is_ancestor(&cli.resolve("feature").unwrap(), "main").unwrap());
    }

    /// # Integrate Refuses A Moved Trunk
    ///
    /// ## Test Scenario
    /// - Integrates with a stale expected tip
    ///
    /// ## Expected Outcome
    /// - `RefUpdateRejected` and `main` is unchanged
    #[test]
    fn test_integrate_refuses_moved_trunk() {
        let Some(repo) = ScratchRepo::new() else {
            return;
        };
        let stale = repo.git(&["rev-parse", "main"]);
        repo.branch_with("feature", "src/a.rs", "a\n");
        repo.commit("docs/b.md", "b\n", "docs");
        let current = repo.git(&["rev-parse", "main"]);

        let err = repo
            .cli()
            .integrate("feature", "main", &stale, "Merge feature")
            .unwrap_err();

        assert!(matches!(err, GitError::RefUpdateRejected { .. }));
        assert_eq!(repo.git(&["rev-parse", "main"]), current);
    }

    /// # Rebase Moves Branch Onto Trunk
    ///
    /// ## Test Scenario
    /// - `feature` branches off, `main` advances on another file; rebases feature
    ///
    /// ## Expected Outcome
    /// - `main` is an ancestor of the new feature head; no worktree is left behind
    #[test]
    fn test_rebase_moves_branch() {
        let Some(repo) = ScratchRepo::new() else {
            return;
        };
        repo.branch_with("feature", "src/a.rs", "a\n");
        repo.commit("docs/b.md", "b\n", "docs");
        let cli = repo.cli();

        let outcome = cli.rebase("feature", "main").unwrap();

        let RebaseOutcome::Rebased { new_head } = outcome else {
            panic!("expected a clean rebase, got {:?}", outcome);
        };
        assert_eq!(cli.resolve("feature").unwrap(), new_head);
        assert!(cli.is_ancestor(&cli.resolve("main").unwrap(), &new_head).unwrap());
        let worktrees = repo.git(&["worktree", "list"]);
        assert_eq!(worktrees.lines().count(), 1);
    }

    /// # Conflicting Rebase Leaves Branch Alone
    ///
    /// ## Test Scenario
    /// - `feature` and `main` change README.md differently; rebases feature
    ///
    /// ## Expected Outcome
    /// - `Conflicted` naming README.md; the feature head is unchanged
    #[test]
    fn test_conflicting_rebase_leaves_branch() {
        let Some(repo) = ScratchRepo::new() else {
            return;
        };
        repo.branch_with("feature", "README.md", "feature\n");
        repo.commit("README.md", "main\n", "main changes readme");
        let cli = repo.cli();
        let before = cli.resolve("feature").unwrap();

        let outcome = cli.rebase("feature", "main").unwrap();

        assert_eq!(
            outcome,
            RebaseOutcome::Conflicted {
                files: vec!["README.md".to_string()]
            }
        );
        assert_eq!(cli.resolve("feature").unwrap(), before);
    }

    /// # Open Rejects Non-Repositories
    ///
    /// ## Test Scenario
    /// - Opens a missing path and an empty directory
    ///
    /// ## Expected Outcome
    /// - `PathNotFound` and `NotARepository`
    #[test]
    fn test_open_rejects_non_repositories() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            GitCli::open(&dir.path().join("missing")),
            Err(GitError::PathNotFound { .. })
        ));
        assert!(matches!(
            GitCli::open(dir.path()),
            Err(GitError::NotARepository { .. })
        ));
    }
}

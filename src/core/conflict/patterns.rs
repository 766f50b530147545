//! Declared path patterns and pairwise classification.
//!
//! Patterns are repository-relative globs using `/` as separator. `*`, `?` and `[...]`
//! never cross a separator; a `**` component matches any number of directories. A trailing
//! `/` is shorthand for the whole subtree (`docs/` is `docs/**`).

use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::lock::check_group_id;
use crate::error::ConflictError;

use super::rules::Relationship;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

fn is_glob_component(component: &str) -> bool {
    component.contains(['*', '?', '['])
}

/// A validated, normalized path pattern.
#[derive(Debug, Clone)]
pub struct PathPattern {
    normalized: String,
    components: Vec<String>,
    /// Number of leading components without glob syntax.
    literal_len: usize,
    pattern: Pattern,
}

impl PathPattern {
    /// Parses and normalizes a pattern. Returns the rejection reason on failure.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err("pattern is empty".to_string());
        }
        if trimmed.starts_with('/') {
            return Err("pattern must be relative to the repository root".to_string());
        }
        if trimmed.contains('\\') {
            return Err("use '/' as path separator".to_string());
        }

        let mut components: Vec<String> = Vec::new();
        for component in trimmed.split('/') {
            match component {
                "" | "." => continue,
                ".." => return Err("pattern must not contain '..'".to_string()),
                c => components.push(c.to_string()),
            }
        }
        if trimmed.ends_with('/') {
            components.push("**".to_string());
        }
        if components.is_empty() {
            return Err("pattern names no path".to_string());
        }
        for component in &components {
            if component.contains("**") && component != "**" {
                return Err(format!("'**' must be a whole path component in '{}'", component));
            }
        }

        let normalized = components.join("/");
        let pattern = Pattern::new(&normalized).map_err(|e| e.to_string())?;
        let literal_len = components
            .iter()
            .take_while(|c| !is_glob_component(c))
            .count();

        Ok(Self {
            normalized,
            components,
            literal_len,
            pattern,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.normalized
    }

    /// Whether the pattern names exactly one path.
    pub fn is_literal(&self) -> bool {
        self.literal_len == self.components.len()
    }

    /// Leading components without glob syntax.
    pub fn anchor(&self) -> &[String] {
        &self.components[..self.literal_len]
    }

    pub fn matches(&self, path: &str) -> bool {
        self.pattern.matches_with(path, MATCH_OPTIONS)
    }

    /// Whether some path strictly below `dir` could match this pattern.
    fn could_match_below(&self, dir: &[String]) -> bool {
        fn walk(pattern: &[String], dir: &[String]) -> bool {
            let Some((head, rest)) = pattern.split_first() else {
                return false;
            };
            let Some((component, below)) = dir.split_first() else {
                // Any remaining pattern component can name something inside `dir`
                return true;
            };
            if head == "**" {
                return walk(rest, dir) || walk(pattern, below);
            }
            Pattern::new(head).is_ok_and(|p| p.matches_with(component, MATCH_OPTIONS))
                && walk(rest, below)
        }
        walk(&self.components, dir)
    }

    /// Parent directory of the files this pattern names, when they all share one.
    fn leaf_dir(&self) -> Option<&[String]> {
        let (last, parent) = self.components.split_last()?;
        let parent_is_literal = parent.iter().all(|c| !is_glob_component(c));
        (parent_is_literal && last != "**").then_some(parent)
    }
}

impl PartialEq for PathPattern {
    fn eq(&self, other: &Self) -> bool {
        self.normalized == other.normalized
    }
}

impl Eq for PathPattern {}

impl fmt::Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.normalized)
    }
}

fn is_prefix(prefix: &[String], of: &[String]) -> bool {
    prefix.len() <= of.len() && of[..prefix.len()] == *prefix
}

/// Classifies how two patterns relate.
///
/// Literal paths are compared exactly. Once glob syntax is involved the comparison
/// works on literal prefixes and errs towards `ParentChild`. Two globs naming files in
/// the same directory are `SameDirectory` only when their leaf names cannot collide.
pub fn classify_patterns(a: &PathPattern, b: &PathPattern) -> Relationship {
    if a == b {
        return Relationship::ExactOverlap;
    }
    match (a.is_literal(), b.is_literal()) {
        (true, true) => {
            if is_prefix(&a.components, &b.components) || is_prefix(&b.components, &a.components)
            {
                Relationship::ParentChild
            } else if a.leaf_dir() == b.leaf_dir() {
                Relationship::SameDirectory
            } else {
                Relationship::Disjoint
            }
        }
        (true, false) => classify_literal_glob(a, b),
        (false, true) => classify_literal_glob(b, a),
        (false, false) => match (a.leaf_dir(), b.leaf_dir()) {
            (Some(l), Some(g)) if l == g => {
                let (leaf_a, leaf_b) = (&a.components[l.len()], &b.components[g.len()]);
                if leaves_may_intersect(leaf_a, leaf_b) {
                    Relationship::ParentChild
                } else {
                    Relationship::SameDirectory
                }
            }
            _ if is_prefix(a.anchor(), b.anchor()) || is_prefix(b.anchor(), a.anchor()) => {
                Relationship::ParentChild
            }
            _ => Relationship::Disjoint,
        },
    }
}

/// Whether two single-component globs could name the same file.
///
/// Compares the literal text before the first wildcard and after the last one; if
/// either pair cannot line up, no file name satisfies both.
fn leaves_may_intersect(a: &str, b: &str) -> bool {
    let head = |s: &str| s.find(['*', '?', '[']).map_or(s.len(), |i| i);
    let tail = |s: &str| s.rfind(['*', '?', ']']).map_or(0, |i| i + 1);
    let (head_a, head_b) = (&a[..head(a)], &b[..head(b)]);
    let (tail_a, tail_b) = (&a[tail(a)..], &b[tail(b)..]);
    (head_a.starts_with(head_b) || head_b.starts_with(head_a))
        && (tail_a.ends_with(tail_b) || tail_b.ends_with(tail_a))
}

fn classify_literal_glob(literal: &PathPattern, glob: &PathPattern) -> Relationship {
    if glob.matches(literal.as_str())
        || is_prefix(&literal.components, glob.anchor())
        || glob.could_match_below(&literal.components)
    {
        return Relationship::ParentChild;
    }
    match (literal.leaf_dir(), glob.leaf_dir()) {
        (Some(l), Some(g)) if l == g => Relationship::SameDirectory,
        _ => Relationship::Disjoint,
    }
}

/// A named set of path patterns guarded together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceGroup {
    id: String,
    patterns: Vec<PathPattern>,
}

impl ResourceGroup {
    /// Validates the id and every pattern. Duplicate patterns collapse into one.
    pub fn new<I, S>(id: impl Into<String>, patterns: I) -> Result<Self, ConflictError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let id = id.into();
        check_group_id(&id).map_err(|reason| ConflictError::InvalidGroupId {
            id: id.clone(),
            reason,
        })?;

        let mut parsed: Vec<PathPattern> = Vec::new();
        for raw in patterns {
            let raw = raw.as_ref();
            let pattern = PathPattern::parse(raw).map_err(|message| ConflictError::InvalidPattern {
                group: id.clone(),
                pattern: raw.to_string(),
                message,
            })?;
            if !parsed.contains(&pattern) {
                parsed.push(pattern);
            }
        }
        if parsed.is_empty() {
            return Err(ConflictError::EmptyGroup { group: id });
        }

        Ok(Self {
            id,
            patterns: parsed,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn patterns(&self) -> &[PathPattern] {
        &self.patterns
    }

    /// Whether any declared pattern matches `path`.
    pub fn covers(&self, path: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(path))
    }
}

/// Serializable declaration form, as read from files or the command line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupDeclaration {
    pub id: String,
    pub patterns: Vec<String>,
}

impl TryFrom<GroupDeclaration> for ResourceGroup {
    type Error = ConflictError;

    fn try_from(declaration: GroupDeclaration) -> Result<Self, Self::Error> {
        ResourceGroup::new(declaration.id, declaration.patterns)
    }
}

impl From<&ResourceGroup> for GroupDeclaration {
    fn from(group: &ResourceGroup) -> Self {
        Self {
            id: group.id.clone(),
            patterns: group.patterns.iter().map(|p| p.to_string()).collect(),
        }
    }
}

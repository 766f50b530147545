//! Relationship, severity and action vocabulary, and the rule table linking them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// How two resource groups' paths relate, ordered from harmless to identical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Relationship {
    Disjoint,
    SameDirectory,
    ParentChild,
    ExactOverlap,
}

impl Relationship {
    pub fn as_str(self) -> &'static str {
        match self {
            Relationship::Disjoint => "DISJOINT",
            Relationship::SameDirectory => "SAME_DIRECTORY",
            Relationship::ParentChild => "PARENT_CHILD",
            Relationship::ExactOverlap => "EXACT_OVERLAP",
        }
    }
}

impl fmt::Display for Relationship {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Minor,
    Major,
    Fatal,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Minor => "MINOR",
            Severity::Major => "MAJOR",
            Severity::Fatal => "FATAL",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to do about a pair of groups, ordered from least to most restrictive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecommendedAction {
    Proceed,
    Mutex,
    Queue,
    DowngradeSerial,
    Abort,
}

impl RecommendedAction {
    pub fn as_str(self) -> &'static str {
        match self {
            RecommendedAction::Proceed => "PROCEED",
            RecommendedAction::Mutex => "MUTEX",
            RecommendedAction::Queue => "QUEUE",
            RecommendedAction::DowngradeSerial => "DOWNGRADE_SERIAL",
            RecommendedAction::Abort => "ABORT",
        }
    }
}

impl fmt::Display for RecommendedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a whole batch of groups should be executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStrategy {
    /// Every pair may run concurrently.
    Parallel,
    /// Concurrent, with the flagged pairs taking each other's locks.
    ParallelWithMutex,
    /// Run one group at a time.
    Serial,
    /// Do not run the batch.
    Abort,
}

impl ExecutionStrategy {
    /// Strategy implied by the most restrictive action in a batch.
    pub fn from_action(action: RecommendedAction) -> Self {
        match action {
            RecommendedAction::Proceed => ExecutionStrategy::Parallel,
            RecommendedAction::Mutex => ExecutionStrategy::ParallelWithMutex,
            RecommendedAction::Queue | RecommendedAction::DowngradeSerial => {
                ExecutionStrategy::Serial
            }
            RecommendedAction::Abort => ExecutionStrategy::Abort,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStrategy::Parallel => "PARALLEL",
            ExecutionStrategy::ParallelWithMutex => "PARALLEL_WITH_MUTEX",
            ExecutionStrategy::Serial => "SERIAL",
            ExecutionStrategy::Abort => "ABORT",
        }
    }
}

impl fmt::Display for ExecutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the rule table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    #[serde(default)]
    pub severity: Option<Severity>,
    pub action: RecommendedAction,
}

impl Rule {
    pub const fn new(severity: Option<Severity>, action: RecommendedAction) -> Self {
        Self { severity, action }
    }
}

/// Maps each relationship to a severity and an action.
///
/// Deserializes from the `[conflict_rules]` config table; rows left out keep their
/// defaults:
///
/// ```toml
/// [conflict_rules]
/// same_directory = { severity = "MINOR", action = "MUTEX" }
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuleTable {
    pub exact_overlap: Rule,
    pub parent_child: Rule,
    pub same_directory: Rule,
    pub disjoint: Rule,
}

impl Default for RuleTable {
    fn default() -> Self {
        Self {
            exact_overlap: Rule::new(Some(Severity::Major), RecommendedAction::DowngradeSerial),
            parent_child: Rule::new(Some(Severity::Major), RecommendedAction::DowngradeSerial),
            same_directory: Rule::new(Some(Severity::Minor), RecommendedAction::Proceed),
            disjoint: Rule::new(None, RecommendedAction::Proceed),
        }
    }
}

impl RuleTable {
    pub fn rule_for(&self, relationship: Relationship) -> Rule {
        match relationship {
            Relationship::ExactOverlap => self.exact_overlap,
            Relationship::ParentChild => self.parent_child,
            Relationship::SameDirectory => self.same_directory,
            Relationship::Disjoint => self.disjoint,
        }
    }
}

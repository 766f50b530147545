//! Conflict detection.
//!
//! Two modes share one vocabulary:
//!
//! - **Static**: before work starts, compare the path patterns each resource group
//!   declares and recommend how the batch may run ([`ConflictDetector::report`]).
//! - **Dynamic**: before integration, dry-run merge a source into the current target
//!   tip and decide between an automatic rebase and manual resolution
//!   ([`precheck::precheck`]).
//!
//! Every verdict is appended to the audit log when one is configured.
//!
//! # Example
//!
//! ```rust
//! use trunkline::core::conflict::{ConflictDetector, ExecutionStrategy, ResourceGroup};
//!
//! let detector = ConflictDetector::default();
//! let batch = vec![
//!     ResourceGroup::new("auth", ["src/auth.ts"]).unwrap(),
//!     ResourceGroup::new("payments", ["src/payments.ts"]).unwrap(),
//! ];
//! let report = detector.report(&batch).unwrap();
//! assert_eq!(report.strategy, ExecutionStrategy::Parallel);
//! ```

mod audit;
mod patterns;
pub mod precheck;
mod rules;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, warn};

use crate::error::ConflictError;

pub use audit::{AUDIT_FILE, AuditLog, AuditRecord};
pub use patterns::{GroupDeclaration, PathPattern, ResourceGroup, classify_patterns};
pub use precheck::{DEFAULT_AUTO_REBASE_MAX_FILES, PrecheckVerdict, Resolution};
pub use rules::{ExecutionStrategy, RecommendedAction, Relationship, Rule, RuleTable, Severity};

/// A pair of patterns that contributed to a verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternOverlap {
    pub left: String,
    pub right: String,
    pub relationship: Relationship,
}

/// Verdict for one pair of resource groups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictVerdict {
    pub left: String,
    pub right: String,
    pub relationship: Relationship,
    pub severity: Option<Severity>,
    pub recommended_action: RecommendedAction,
    /// Non-disjoint pattern pairs, most severe first.
    pub overlaps: Vec<PatternOverlap>,
}

/// Verdicts for a whole batch and the strategy they add up to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictReport {
    pub verdicts: Vec<ConflictVerdict>,
    pub strategy: ExecutionStrategy,
}

impl ConflictReport {
    /// Verdicts whose action is anything but `PROCEED`.
    pub fn blocking(&self) -> impl Iterator<Item = &ConflictVerdict> {
        self.verdicts
            .iter()
            .filter(|v| v.recommended_action != RecommendedAction::Proceed)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConflictDetector {
    rules: RuleTable,
    audit: Option<AuditLog>,
}

impl ConflictDetector {
    pub fn new(rules: RuleTable) -> Self {
        Self { rules, audit: None }
    }

    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn rules(&self) -> &RuleTable {
        &self.rules
    }

    pub fn audit(&self) -> Option<&AuditLog> {
        self.audit.as_ref()
    }

    /// Classifies one pair of groups by their most severe pattern pair.
    pub fn compare(&self, left: &ResourceGroup, right: &ResourceGroup) -> ConflictVerdict {
        let mut overlaps: Vec<PatternOverlap> = Vec::new();
        for a in left.patterns() {
            for b in right.patterns() {
                let relationship = classify_patterns(a, b);
                if relationship != Relationship::Disjoint {
                    overlaps.push(PatternOverlap {
                        left: a.to_string(),
                        right: b.to_string(),
                        relationship,
                    });
                }
            }
        }
        overlaps.sort_by(|x, y| y.relationship.cmp(&x.relationship));

        let relationship = overlaps
            .first()
            .map(|o| o.relationship)
            .unwrap_or(Relationship::Disjoint);
        let rule = self.rules.rule_for(relationship);

        ConflictVerdict {
            left: left.id().to_string(),
            right: right.id().to_string(),
            relationship,
            severity: rule.severity,
            recommended_action: rule.action,
            overlaps,
        }
    }

    /// Compares every pair in the batch and derives an execution strategy.
    ///
    /// Fails only if two groups share an id.
    pub fn report(&self, groups: &[ResourceGroup]) -> Result<ConflictReport, ConflictError> {
        let mut seen = HashSet::new();
        for group in groups {
            if !seen.insert(group.id()) {
                return Err(ConflictError::DuplicateGroup {
                    id: group.id().to_string(),
                });
            }
        }

        let mut verdicts = Vec::new();
        for (i, left) in groups.iter().enumerate() {
            for right in &groups[i + 1..] {
                let verdict = self.compare(left, right);
                self.log_verdict(&verdict);
                if let Some(audit) = &self.audit {
                    audit.record_static(&verdict);
                }
                verdicts.push(verdict);
            }
        }

        let strategy = ExecutionStrategy::from_action(
            verdicts
                .iter()
                .map(|v| v.recommended_action)
                .max()
                .unwrap_or(RecommendedAction::Proceed),
        );
        debug!(groups = groups.len(), %strategy, "Conflict report computed");

        Ok(ConflictReport { verdicts, strategy })
    }

    fn log_verdict(&self, verdict: &ConflictVerdict) {
        match (verdict.severity, verdict.recommended_action) {
            (None, _) => {}
            (Some(_), RecommendedAction::Proceed) => warn!(
                left = %verdict.left,
                right = %verdict.right,
                relationship = %verdict.relationship,
                "Proceeding despite overlapping resource groups"
            ),
            (Some(severity), action) => debug!(
                left = %verdict.left,
                right = %verdict.right,
                relationship = %verdict.relationship,
                %severity,
                %action,
                "Resource groups conflict"
            ),
        }
    }
}

//! Append-only record of every verdict the detector computes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

use super::ConflictVerdict;
use super::precheck::PrecheckVerdict;
use crate::core::state::{append_json_line, read_json_lines};

/// File name of the audit log inside the state directory.
pub const AUDIT_FILE: &str = "audit.jsonl";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AuditRecord {
    /// A pairwise verdict over declared resource groups.
    Static {
        at: DateTime<Utc>,
        verdict: ConflictVerdict,
    },
    /// A pre-integration dry-run merge.
    Dynamic {
        at: DateTime<Utc>,
        request_id: String,
        source_ref: String,
        target_ref: String,
        verdict: PrecheckVerdict,
    },
}

#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_dir(state_dir: &Path) -> Self {
        Self::new(state_dir.join(AUDIT_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends a record. A failed append is logged; verdicts are never withheld for it.
    pub fn record(&self, record: &AuditRecord) {
        if let Err(e) = append_json_line(&self.path, record) {
            warn!(path = %self.path.display(), error = %format!("{:#}", e), "Failed to append audit record");
        }
    }

    pub fn record_static(&self, verdict: &ConflictVerdict) {
        self.record(&AuditRecord::Static {
            at: Utc::now(),
            verdict: verdict.clone(),
        });
    }

    pub fn record_dynamic(
        &self,
        request_id: &str,
        source_ref: &str,
        target_ref: &str,
        verdict: &PrecheckVerdict,
    ) {
        self.record(&AuditRecord::Dynamic {
            at: Utc::now(),
            request_id: request_id.to_string(),
            source_ref: source_ref.to_string(),
            target_ref: target_ref.to_string(),
            verdict: verdict.clone(),
        });
    }

    /// Every readable record, oldest first.
    pub fn records(&self) -> anyhow::Result<Vec<AuditRecord>> {
        let (records, skipped) = read_json_lines(&self.path)?;
        if skipped > 0 {
            warn!(path = %self.path.display(), skipped, "Skipped unreadable audit lines");
        }
        Ok(records)
    }
}

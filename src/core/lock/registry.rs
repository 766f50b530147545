//! Append-only ledger of lock lifecycle events.
//!
//! Every acquisition appends an `ACTIVE` entry; every release or reclamation appends a
//! closing entry with the same token. The latest entry per token is the state of that
//! acquisition, so the set of open acquisitions is a fold over the log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::warn;

use super::types::{LockRecord, LockState};
use crate::core::state::{append_json_line, read_json_lines};
use crate::error::LockError;

/// File name of the registry inside the state directory.
pub const REGISTRY_FILE: &str = "registry.jsonl";

/// One line of the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    /// When the event was recorded.
    pub at: DateTime<Utc>,
    pub resource_group_id: String,
    pub token: String,
    pub holder_pid: u32,
    pub acquired_at: DateTime<Utc>,
    pub state: LockState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl RegistryEntry {
    pub fn for_record(record: &LockRecord, state: LockState, note: Option<String>) -> Self {
        Self {
            at: Utc::now(),
            resource_group_id: record.resource_group_id.clone(),
            token: record.token.clone(),
            holder_pid: record.holder_pid,
            acquired_at: record.acquired_at,
            state,
            note,
        }
    }

    /// Closing entry for this acquisition.
    pub fn closed(&self, state: LockState, note: Option<String>) -> Self {
        Self {
            at: Utc::now(),
            state,
            note,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone)]
pub struct Registry {
    path: PathBuf,
}

impl Registry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Registry at its standard location inside `state_dir`.
    pub fn in_dir(state_dir: &Path) -> Self {
        Self::new(state_dir.join(REGISTRY_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, entry: &RegistryEntry) -> Result<(), LockError> {
        append_json_line(&self.path, entry).map_err(|e| LockError::Registry {
            path: self.path.clone(),
            message: format!("{:#}", e),
        })
    }

    /// Every readable entry in append order.
    pub fn entries(&self) -> Result<Vec<RegistryEntry>, LockError> {
        let (entries, skipped) =
            read_json_lines::<RegistryEntry>(&self.path).map_err(|e| LockError::Registry {
                path: self.path.clone(),
                message: format!("{:#}", e),
            })?;
        if skipped > 0 {
            warn!(path = %self.path.display(), skipped, "Skipped unreadable registry lines");
        }
        Ok(entries)
    }

    /// Acquisitions whose latest entry is still `ACTIVE`, oldest first.
    pub fn active(&self) -> Result<Vec<RegistryEntry>, LockError> {
        let mut latest: HashMap<String, RegistryEntry> = HashMap::new();
        for entry in self.entries()? {
            latest.insert(entry.token.clone(), entry);
        }
        let mut active: Vec<RegistryEntry> = latest
            .into_values()
            .filter(|entry| entry.state == LockState::Active)
            .collect();
        active.sort_by(|a, b| a.acquired_at.cmp(&b.acquired_at));
        Ok(active)
    }

    /// Full history of one resource group.
    pub fn history(&self, resource_group_id: &str) -> Result<Vec<RegistryEntry>, LockError> {
        Ok(self
            .entries()?
            .into_iter()
            .filter(|entry| entry.resource_group_id == resource_group_id)
            .collect())
    }
}

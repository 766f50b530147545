//! Text renderings of the reports the CLI prints.

use std::io::{self, Write};

use super::format::TextReport;
use crate::core::conflict::{ConflictReport, PrecheckVerdict, RecommendedAction, Resolution};
use crate::core::lock::LockStatus;
use crate::core::monitor::ScanReport;
use crate::core::queue::{MergeRequest, QueueEntry, RequestStatus, RunSummary, StepOutcome};
use crate::core::recovery::RecoveryReport;

/// Formats a request status with a leading symbol.
pub fn status_symbol(status: RequestStatus) -> &'static str {
    match status {
        RequestStatus::Submitted | RequestStatus::Queued => "○",
        RequestStatus::ConflictCheck | RequestStatus::Merging | RequestStatus::RebasePending => {
            "◐"
        }
        RequestStatus::Merged => "✓",
        RequestStatus::Failed => "✗",
        RequestStatus::Rejected => "⊘",
        RequestStatus::ManualRequired => "⚠",
    }
}

fn action_symbol(action: RecommendedAction) -> &'static str {
    match action {
        RecommendedAction::Proceed => "✓",
        RecommendedAction::Abort => "✗",
        _ => "⚠",
    }
}

impl TextReport for LockStatus {
    fn write_text(&self, out: &mut dyn Write) -> io::Result<()> {
        match &self.holder {
            Some(holder) => writeln!(
                out,
                "◐ {}  held by pid {} for {}s  (token {})",
                self.resource_group_id, holder.pid, holder.age_secs, holder.token
            ),
            None => writeln!(out, "○ {}  free", self.resource_group_id),
        }
    }
}

impl TextReport for [LockStatus] {
    fn write_text(&self, out: &mut dyn Write) -> io::Result<()> {
        if self.is_empty() {
            return writeln!(out, "No locks held");
        }
        for status in self {
            status.write_text(out)?;
        }
        Ok(())
    }
}

impl TextReport for ConflictReport {
    fn write_text(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(out, "Strategy: {}", self.strategy)?;
        for verdict in &self.verdicts {
            let severity = verdict.severity.map_or("-", |s| s.as_str());
            writeln!(
                out,
                "{} {} <-> {}  {}  {}  {}",
                action_symbol(verdict.recommended_action),
                verdict.left,
                verdict.right,
                verdict.relationship,
                severity,
                verdict.recommended_action
            )?;
            for overlap in &verdict.overlaps {
                writeln!(
                    out,
                    "    {} ~ {}  ({})",
                    overlap.left, overlap.right, overlap.relationship
                )?;
            }
        }
        Ok(())
    }
}

impl TextReport for PrecheckVerdict {
    fn write_text(&self, out: &mut dyn Write) -> io::Result<()> {
        match self {
            PrecheckVerdict::Clean => writeln!(out, "✓ Merges cleanly"),
            PrecheckVerdict::AlreadyIntegrated => writeln!(out, "✓ Already integrated"),
            PrecheckVerdict::Conflicted {
                files,
                structural,
                resolution,
            } => {
                let resolution = match resolution {
                    Resolution::AutoRebase => "automatic rebase",
                    Resolution::ManualRequired => "manual resolution",
                };
                writeln!(
                    out,
                    "⚠ {} conflicting file(s){}, needs {}",
                    files.len(),
                    if *structural { " (structural)" } else { "" },
                    resolution
                )?;
                for file in files {
                    writeln!(out, "    {} ({})", file.path, file.kind)?;
                }
                Ok(())
            }
        }
    }
}

impl TextReport for MergeRequest {
    fn write_text(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(out, "Request:  {}", self.id)?;
        writeln!(out, "Source:   {} -> {}", self.source_ref, self.target_ref)?;
        writeln!(out, "Status:   {} {}", status_symbol(self.status), self.status)?;
        writeln!(out, "Attempts: {}", self.attempts)?;
        if let Some(commit) = &self.merged_commit {
            writeln!(out, "Commit:   {}", commit)?;
        }
        if let Some(error) = &self.last_error {
            writeln!(out, "Error:    {}", error)?;
        }
        Ok(())
    }
}

impl TextReport for [QueueEntry] {
    fn write_text(&self, out: &mut dyn Write) -> io::Result<()> {
        if self.is_empty() {
            return writeln!(out, "Merge queue is empty");
        }
        let waiting = self.iter().filter(|e| e.position.is_some()).count();
        writeln!(
            out,
            "Merge queue: {} waiting, {} other",
            waiting,
            self.len() - waiting
        )?;
        for entry in self {
            let request = &entry.request;
            let place = match entry.position {
                Some(position) => format!("{}.", position),
                None => "- ".to_string(),
            };
            let wait = entry
                .waiting_for
                .map(|d| format!("  waiting={}s", d.as_secs()))
                .unwrap_or_default();
            writeln!(
                out,
                "  {} {}  {} {}  attempts={}{}  {} -> {}",
                place,
                request.id,
                status_symbol(request.status),
                request.status,
                request.attempts,
                wait,
                request.source_ref,
                request.target_ref
            )?;
            if let Some(error) = &request.last_error {
                writeln!(out, "       {}", error)?;
            }
        }
        Ok(())
    }
}

impl TextReport for RunSummary {
    fn write_text(&self, out: &mut dyn Write) -> io::Result<()> {
        let steps: Vec<&StepOutcome> = self
            .steps
            .iter()
            .filter(|s| !matches!(s, StepOutcome::Idle))
            .collect();
        if steps.is_empty() && self.expired.is_empty() {
            return writeln!(out, "Nothing to process");
        }
        writeln!(out, "Processed {} request step(s)", steps.len())?;
        for step in steps {
            match step {
                StepOutcome::Idle => {}
                StepOutcome::Merged { id, commit } => {
                    writeln!(out, "  ✓ {} merged as {}", id, commit)?
                }
                StepOutcome::AlreadyIntegrated { id } => {
                    writeln!(out, "  ✓ {} already integrated", id)?
                }
                StepOutcome::Requeued { id, attempts } => {
                    writeln!(out, "  ◐ {} rebased and requeued (attempt {})", id, attempts)?
                }
                StepOutcome::ManualRequired { id, kind } => {
                    writeln!(out, "  ⚠ {} needs manual resolution ({})", id, kind)?
                }
                StepOutcome::Failed { id, kind } => writeln!(out, "  ✗ {} failed ({})", id, kind)?,
                StepOutcome::Deferred { id, reason } => {
                    writeln!(out, "  ○ {} deferred: {}", id, reason)?
                }
            }
        }
        for id in &self.expired {
            writeln!(out, "  ✗ {} expired in manual resolution", id)?;
        }
        if !self.compacted.is_empty() {
            writeln!(out, "Dropped {} finished request(s)", self.compacted.len())?;
        }
        writeln!(out, "Checkpoints written: {}", self.checkpoints_written)
    }
}

impl TextReport for RecoveryReport {
    fn write_text(&self, out: &mut dyn Write) -> io::Result<()> {
        let verdict = if self.is_clean() { "clean" } else { "repaired" };
        writeln!(out, "Recovery: {}", verdict)?;
        match self.checkpoint_generation {
            Some(generation) => writeln!(out, "  Started from checkpoint {}", generation)?,
            None => writeln!(out, "  No checkpoint found")?,
        }
        for skipped in &self.skipped_checkpoints {
            writeln!(
                out,
                "  ⚠ Skipped {}: {}",
                skipped.path.display(),
                skipped.reason
            )?;
        }
        if self.queue_restored {
            writeln!(out, "  ⚠ Queue restored from checkpoint")?;
        }
        for lock in &self.reclaimed_locks {
            writeln!(
                out,
                "  ✗ Reclaimed {} from pid {} ({})",
                lock.resource_group_id, lock.holder_pid, lock.state
            )?;
        }
        for request in &self.requeued_requests {
            writeln!(
                out,
                "  ◐ Requeued {} from {} (attempt {})",
                request.id, request.previous_status, request.attempts
            )?;
        }
        if let Some(generation) = self.new_checkpoint {
            writeln!(out, "  Wrote checkpoint {}", generation)?;
        }
        Ok(())
    }
}

impl TextReport for ScanReport {
    fn write_text(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(
            out,
            "Examined {} lock(s), reclaimed {}",
            self.examined,
            self.reclaimed.len()
        )?;
        for lock in &self.reclaimed {
            writeln!(
                out,
                "  ✗ {}  pid {}  {}  {}",
                lock.resource_group_id, lock.holder_pid, lock.state, lock.reason
            )?;
        }
        Ok(())
    }
}

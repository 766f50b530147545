//! On-disk primitives shared by every persisted structure.
//!
//! The queue file, lock records, registry, audit log and checkpoints all live under one
//! state directory per repository. This module resolves that directory and provides the
//! two write disciplines the coordinator relies on:
//!
//! - whole-file documents replaced with write-to-temp-then-rename, so a reader never
//!   observes a partial write;
//! - append-only JSON-lines logs, where each record is written with a single call while
//!   holding an exclusive advisory lock on the log file.

use anyhow::{Context, Result};
use fs2::FileExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// Current schema version for persisted documents.
/// Increment when making breaking changes to the queue or checkpoint format.
pub const SCHEMA_VERSION: u32 = 1;

/// Environment variable to override the state directory.
pub const STATE_DIR_ENV: &str = "TRUNKLINE_STATE_DIR";

/// Returns the root under which per-repository state directories are created.
///
/// Uses the XDG state directory on Linux, Application Support on macOS and
/// Local AppData on Windows.
pub fn state_root() -> Result<PathBuf> {
    let state_home = if cfg!(target_os = "macos") {
        dirs::data_local_dir().map(|p| p.join("trunkline"))
    } else if cfg!(target_os = "windows") {
        dirs::data_local_dir().map(|p| p.join("trunkline").join("state"))
    } else {
        dirs::state_dir().map(|p| p.join("trunkline")).or_else(|| {
            // Fallback to ~/.local/state/trunkline
            dirs::home_dir().map(|p| p.join(".local").join("state").join("trunkline"))
        })
    };

    state_home.context("Could not determine state directory")
}

/// Returns the state directory for a repository.
///
/// `TRUNKLINE_STATE_DIR` is used verbatim when set; otherwise the directory is
/// `<state_root>/<repo hash>`.
pub fn state_dir_for_repo(repo_path: &Path) -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(STATE_DIR_ENV) {
        return Ok(PathBuf::from(dir));
    }
    Ok(state_root()?.join(compute_repo_hash(repo_path)?))
}

/// Computes a hash of the repository path for unique directory naming.
///
/// Returns the first 16 characters of the SHA-256 hash of the canonicalized path.
pub fn compute_repo_hash(repo_path: &Path) -> Result<String> {
    let canonical = repo_path
        .canonicalize()
        .with_context(|| format!("Failed to canonicalize path: {}", repo_path.display()))?;

    Ok(short_hash(canonical.to_string_lossy().as_bytes()))
}

/// Hex-encoded SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// First 16 hex characters of the SHA-256 of `bytes`.
pub fn short_hash(bytes: &[u8]) -> String {
    let mut full = sha256_hex(bytes);
    full.truncate(16);
    full
}

/// Serializes `value` as pretty JSON and atomically replaces `path` with it.
///
/// Uses write-to-temp-then-rename; the temp name includes the pid so concurrent
/// writers never share a temp file.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp_path = path.with_file_name(format!("{}.tmp-{}", file_name, std::process::id()));
    let content = serde_json::to_string_pretty(value).context("Failed to serialize document")?;

    let mut file = fs::File::create(&temp_path)
        .with_context(|| format!("Failed to create temp file: {}", temp_path.display()))?;
    file.write_all(content.as_bytes())
        .with_context(|| format!("Failed to write temp file: {}", temp_path.display()))?;
    file.sync_all()
        .with_context(|| format!("Failed to sync temp file: {}", temp_path.display()))?;

    fs::rename(&temp_path, path)
        .with_context(|| format!("Failed to rename temp file to: {}", path.display()))?;

    Ok(())
}

/// Reads and parses a JSON document.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Appends one JSON record as a single line.
///
/// The file is opened in append mode and exclusively locked for the duration of the
/// write, so concurrent appenders from any process never interleave records.
pub fn append_json_line<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    let mut line = serde_json::to_string(value).context("Failed to serialize log record")?;
    line.push('\n');

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    file.lock_exclusive()
        .with_context(|| format!("Failed to lock {}", path.display()))?;
    let written = file
        .write_all(line.as_bytes())
        .and_then(|()| file.sync_data())
        .with_context(|| format!("Failed to append to {}", path.display()));
    let _ = FileExt::unlock(&file);
    written
}

/// Reads every record of a JSON-lines log.
///
/// Returns the parsed records and the number of lines that could not be parsed
/// (a torn final line left by a crashed writer is skipped rather than failing the
/// whole read). A missing file reads as empty.
pub fn read_json_lines<T: DeserializeOwned>(path: &Path) -> Result<(Vec<T>, usize)> {
    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to open {}", path.display()));
        }
    };
    file.lock_shared()
        .with_context(|| format!("Failed to lock {}", path.display()))?;

    let mut records = Vec::new();
    let mut skipped = 0;
    for line in BufReader::new(&file).lines() {
        let line = line.with_context(|| format!("Failed to read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(record) => records.push(record),
            Err(_) => skipped += 1,
        }
    }
    let _ = FileExt::unlock(&file);

    Ok((records, skipped))
}

//! Durable state.
//!
//! Everything the coordinator persists lives under one directory per repository:
//!
//! ```text
//! Default:  ~/.local/state/trunkline/{hash}/
//! Override: $TRUNKLINE_STATE_DIR/
//!
//! locks/<group>-<hash>.lock            current lock holders
//! registry.jsonl                       lock lifecycle history
//! queue.json, queue.lock               merge queue and its storage lock
//! checkpoints/checkpoint-<gen>.json    recovery snapshots
//! audit.jsonl                          conflict verdicts
//! ```
//!
//! Where `{hash}` is the first 16 characters of SHA-256 of the canonical repository path.

mod checkpoint;
mod file;

pub use checkpoint::{
    CHECKPOINTS_DIR, Checkpoint, CheckpointPayload, CheckpointStore, DEFAULT_RETENTION,
    LoadedCheckpoint, SkippedCheckpoint,
};
pub use file::{
    SCHEMA_VERSION, STATE_DIR_ENV, append_json_line, compute_repo_hash, read_json,
    read_json_lines, sha256_hex, short_hash, state_dir_for_repo, state_root, write_json_atomic,
};

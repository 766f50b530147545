//! Configuration management for trunkline.
//!
//! Settings are layered, highest precedence first:
//! - CLI arguments
//! - Environment variables (`TRUNKLINE_*`)
//! - TOML configuration file (`$XDG_CONFIG_HOME/trunkline/config.toml`)
//! - Built-in defaults
//!
//! Every value remembers where it came from through [`ParsedProperty`], and the merged
//! result is resolved into [`CoordinatorSettings`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use trunkline::Config;
//!
//! let config = Config::load_from_file()
//!     .unwrap()
//!     .merge(Config::load_from_env());
//! let settings = config.resolve().unwrap();
//! println!("State lives in {}", settings.state_dir.display());
//! ```

use crate::coordinator::CoordinatorSettings;
use crate::core::conflict::RuleTable;
use crate::core::state::state_dir_for_repo;
use crate::error::ConfigError;
use crate::git::CommitIdentity;
use crate::{models::SharedArgs, parsed_property::ParsedProperty};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Shape of the TOML configuration file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    pub state_dir: Option<String>,
    pub repo: Option<String>,
    pub lock_timeout_secs: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub stale_lock_age_secs: Option<u64>,
    pub monitor_interval_secs: Option<u64>,
    pub retry_ceiling: Option<u32>,
    pub manual_residency_secs: Option<u64>,
    pub checkpoint_retention: Option<usize>,
    pub checkpoint_interval_secs: Option<u64>,
    pub terminal_retention: Option<usize>,
    pub auto_rebase_max_files: Option<usize>,
    pub committer_name: Option<String>,
    pub committer_email: Option<String>,
    pub conflict_rules: Option<RuleTable>,
}

/// Configuration assembled from CLI arguments, environment variables, config file, and defaults.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Config {
    /// Directory holding locks, queue, checkpoints and audit log.
    pub state_dir: Option<ParsedProperty<String>>,
    /// Repository the coordinator manages.
    pub repo: Option<ParsedProperty<String>>,
    pub lock_timeout_secs: Option<ParsedProperty<u64>>,
    pub poll_interval_ms: Option<ParsedProperty<u64>>,
    /// Age after which the monitor reclaims an unrenewed lock.
    pub stale_lock_age_secs: Option<ParsedProperty<u64>>,
    pub monitor_interval_secs: Option<ParsedProperty<u64>>,
    pub retry_ceiling: Option<ParsedProperty<u32>>,
    pub manual_residency_secs: Option<ParsedProperty<u64>>,
    pub checkpoint_retention: Option<ParsedProperty<usize>>,
    pub checkpoint_interval_secs: Option<ParsedProperty<u64>>,
    /// Finished requests kept in the queue file.
    pub terminal_retention: Option<ParsedProperty<usize>>,
    pub auto_rebase_max_files: Option<ParsedProperty<usize>>,
    pub committer_name: Option<ParsedProperty<String>>,
    pub committer_email: Option<ParsedProperty<String>>,
    /// Relationship-to-action table; file only.
    pub conflict_rules: Option<ParsedProperty<RuleTable>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_dir: None,
            repo: None,
            lock_timeout_secs: Some(ParsedProperty::builtin(30)),
            poll_interval_ms: Some(ParsedProperty::builtin(50)),
            stale_lock_age_secs: Some(ParsedProperty::builtin(3600)),
            monitor_interval_secs: Some(ParsedProperty::builtin(30)),
            retry_ceiling: Some(ParsedProperty::builtin(3)),
            manual_residency_secs: Some(ParsedProperty::builtin(86_400)),
            checkpoint_retention: Some(ParsedProperty::builtin(5)),
            checkpoint_interval_secs: Some(ParsedProperty::builtin(60)),
            terminal_retention: Some(ParsedProperty::builtin(200)),
            auto_rebase_max_files: Some(ParsedProperty::builtin(3)),
            committer_name: None,
            committer_email: None,
            conflict_rules: Some(ParsedProperty::builtin(RuleTable::default())),
        }
    }
}

/// An empty layer: every field unset.
fn empty() -> Config {
    Config {
        state_dir: None,
        repo: None,
        lock_timeout_secs: None,
        poll_interval_ms: None,
        stale_lock_age_secs: None,
        monitor_interval_secs: None,
        retry_ceiling: None,
        manual_residency_secs: None,
        checkpoint_retention: None,
        checkpoint_interval_secs: None,
        terminal_retention: None,
        auto_rebase_max_files: None,
        committer_name: None,
        committer_email: None,
        conflict_rules: None,
    }
}

fn env_string(name: &str) -> Option<ParsedProperty<String>> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .map(|v| ParsedProperty::env(v.clone(), name, v))
}

fn env_parsed<T: FromStr>(name: &str) -> Option<ParsedProperty<T>> {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok().map(|v| ParsedProperty::env(v, name, s)))
}

fn cli<T: Clone + ToString>(flag: &str, value: &Option<T>) -> Option<ParsedProperty<T>> {
    value
        .as_ref()
        .map(|v| ParsedProperty::cli(v.clone(), format!("--{} {}", flag, v.to_string())))
}

impl Config {
    /// Loads the file at the standard location, or defaults when there is none.
    #[must_use = "this returns the loaded configuration which should be used"]
    pub fn load_from_file() -> Result<Self> {
        Self::load_from_path(&Self::get_config_path()?)
    }

    /// Loads a specific configuration file layered over the defaults.
    pub fn load_from_path(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content =
            fs::read_to_string(config_path).map_err(|e| ConfigError::FileReadError {
                path: config_path.to_path_buf(),
                message: e.to_string(),
            })?;
        let file: ConfigFile = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: config_path.to_path_buf(),
            message: e.to_string(),
        })?;

        let path = config_path.to_path_buf();
        let prop = |value: String, raw: String| ParsedProperty::file(value, path.clone(), raw);
        let num = |key: &str, value: Option<u64>| {
            value.map(|v| ParsedProperty::file(v, path.clone(), format!("{} = {}", key, v)))
        };

        let layer = Config {
            state_dir: file
                .state_dir
                .map(|v| prop(v.clone(), format!("state_dir = \"{}\"", v))),
            repo: file.repo.map(|v| prop(v.clone(), format!("repo = \"{}\"", v))),
            lock_timeout_secs: num("lock_timeout_secs", file.lock_timeout_secs),
            poll_interval_ms: num("poll_interval_ms", file.poll_interval_ms),
            stale_lock_age_secs: num("stale_lock_age_secs", file.stale_lock_age_secs),
            monitor_interval_secs: num("monitor_interval_secs", file.monitor_interval_secs),
            retry_ceiling: file.retry_ceiling.map(|v| {
                ParsedProperty::file(v, path.clone(), format!("retry_ceiling = {}", v))
            }),
            manual_residency_secs: num("manual_residency_secs", file.manual_residency_secs),
            checkpoint_retention: file.checkpoint_retention.map(|v| {
                ParsedProperty::file(v, path.clone(), format!("checkpoint_retention = {}", v))
            }),
            checkpoint_interval_secs: num(
                "checkpoint_interval_secs",
                file.checkpoint_interval_secs,
            ),
            terminal_retention: file.terminal_retention.map(|v| {
                ParsedProperty::file(v, path.clone(), format!("terminal_retention = {}", v))
            }),
            auto_rebase_max_files: file.auto_rebase_max_files.map(|v| {
                ParsedProperty::file(v, path.clone(), format!("auto_rebase_max_files = {}", v))
            }),
            committer_name: file
                .committer_name
                .map(|v| prop(v.clone(), format!("committer_name = \"{}\"", v))),
            committer_email: file
                .committer_email
                .map(|v| prop(v.clone(), format!("committer_email = \"{}\"", v))),
            conflict_rules: file
                .conflict_rules
                .map(|v| ParsedProperty::file(v, path.clone(), "[conflict_rules]".to_string())),
        };
        Ok(Self::default().merge(layer))
    }

    /// Reads `TRUNKLINE_*` variables. Unparseable numbers are ignored.
    pub fn load_from_env() -> Self {
        Self {
            state_dir: env_string("TRUNKLINE_STATE_DIR"),
            repo: env_string("TRUNKLINE_REPO"),
            lock_timeout_secs: env_parsed("TRUNKLINE_LOCK_TIMEOUT_SECS"),
            poll_interval_ms: env_parsed("TRUNKLINE_POLL_INTERVAL_MS"),
            stale_lock_age_secs: env_parsed("TRUNKLINE_STALE_LOCK_AGE_SECS"),
            monitor_interval_secs: env_parsed("TRUNKLINE_MONITOR_INTERVAL_SECS"),
            retry_ceiling: env_parsed("TRUNKLINE_RETRY_CEILING"),
            manual_residency_secs: env_parsed("TRUNKLINE_MANUAL_RESIDENCY_SECS"),
            checkpoint_retention: env_parsed("TRUNKLINE_CHECKPOINT_RETENTION"),
            checkpoint_interval_secs: env_parsed("TRUNKLINE_CHECKPOINT_INTERVAL_SECS"),
            terminal_retention: env_parsed("TRUNKLINE_TERMINAL_RETENTION"),
            auto_rebase_max_files: env_parsed("TRUNKLINE_AUTO_REBASE_MAX_FILES"),
            committer_name: env_string("TRUNKLINE_COMMITTER_NAME"),
            committer_email: env_string("TRUNKLINE_COMMITTER_EMAIL"),
            // conflict_rules is configured via file only
            conflict_rules: None,
        }
    }

    /// Layer built from command-line flags.
    pub fn from_shared_args(shared: &SharedArgs) -> Self {
        Self {
            state_dir: cli("state-dir", &shared.state_dir),
            repo: cli("repo", &shared.repo),
            lock_timeout_secs: cli("lock-timeout-secs", &shared.lock_timeout_secs),
            poll_interval_ms: cli("poll-interval-ms", &shared.poll_interval_ms),
            stale_lock_age_secs: cli("stale-lock-age-secs", &shared.stale_lock_age_secs),
            monitor_interval_secs: cli("monitor-interval-secs", &shared.monitor_interval_secs),
            retry_ceiling: cli("retry-ceiling", &shared.retry_ceiling),
            manual_residency_secs: cli("manual-residency-secs", &shared.manual_residency_secs),
            checkpoint_retention: cli("checkpoint-retention", &shared.checkpoint_retention),
            checkpoint_interval_secs: cli(
                "checkpoint-interval-secs",
                &shared.checkpoint_interval_secs,
            ),
            terminal_retention: cli("terminal-retention", &shared.terminal_retention),
            auto_rebase_max_files: cli("auto-rebase-max-files", &shared.auto_rebase_max_files),
            committer_name: cli("committer-name", &shared.committer_name),
            committer_email: cli("committer-email", &shared.committer_email),
            ..empty()
        }
    }

    /// `$XDG_CONFIG_HOME/trunkline/config.toml`, falling back to `~/.config`.
    fn get_config_path() -> Result<PathBuf> {
        let config_dir = match std::env::var("XDG_CONFIG_HOME") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => dirs::home_dir()
                .context("Could not determine home directory")?
                .join(".config"),
        };
        Ok(config_dir.join("trunkline").join("config.toml"))
    }

    /// Merge this config with another, preferring values from other when they exist
    pub fn merge(self, other: Self) -> Self {
        Self {
            state_dir: other.state_dir.or(self.state_dir),
            repo: other.repo.or(self.repo),
            lock_timeout_secs: other.lock_timeout_secs.or(self.lock_timeout_secs),
            poll_interval_ms: other.poll_interval_ms.or(self.poll_interval_ms),
            stale_lock_age_secs: other.stale_lock_age_secs.or(self.stale_lock_age_secs),
            monitor_interval_secs: other.monitor_interval_secs.or(self.monitor_interval_secs),
            retry_ceiling: other.retry_ceiling.or(self.retry_ceiling),
            manual_residency_secs: other.manual_residency_secs.or(self.manual_residency_secs),
            checkpoint_retention: other.checkpoint_retention.or(self.checkpoint_retention),
            checkpoint_interval_secs: other
                .checkpoint_interval_secs
                .or(self.checkpoint_interval_secs),
            terminal_retention: other.terminal_retention.or(self.terminal_retention),
            auto_rebase_max_files: other.auto_rebase_max_files.or(self.auto_rebase_max_files),
            committer_name: other.committer_name.or(self.committer_name),
            committer_email: other.committer_email.or(self.committer_email),
            conflict_rules: other.conflict_rules.or(self.conflict_rules),
        }
    }

    /// Validates the merged layers and turns them into settings.
    ///
    /// The repository defaults to the current directory and the state directory to the
    /// per-repository location under the user's state dir.
    pub fn resolve(self) -> Result<CoordinatorSettings, ConfigError> {
        let repo_path = match &self.repo {
            Some(repo) => PathBuf::from(repo.value()),
            None => std::env::current_dir().map_err(|e| ConfigError::InvalidValue {
                field: "repo".to_string(),
                message: e.to_string(),
            })?,
        };
        if !repo_path.exists() {
            return Err(ConfigError::InvalidValue {
                field: "repo".to_string(),
                message: format!("{} does not exist", repo_path.display()),
            });
        }

        let state_dir = match &self.state_dir {
            Some(dir) => PathBuf::from(dir.value()),
            None => state_dir_for_repo(&repo_path).map_err(|e| ConfigError::InvalidValue {
                field: "state_dir".to_string(),
                message: format!("{:#}", e),
            })?,
        };

        let positive = |field: &str, prop: Option<ParsedProperty<u64>>, default: u64| {
            let prop = prop.unwrap_or_else(|| ParsedProperty::builtin(default));
            if *prop.value() == 0 {
                Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    message: format!("must be greater than zero (set by {})", prop.origin()),
                })
            } else {
                Ok(prop.into_value())
            }
        };
        let get = |prop: &Option<ParsedProperty<u64>>, default: u64| {
            prop.as_ref().map_or(default, |p| *p.value())
        };

        let poll_interval_ms = positive("poll_interval_ms", self.poll_interval_ms.clone(), 50)?;
        let monitor_interval_secs =
            positive("monitor_interval_secs", self.monitor_interval_secs.clone(), 30)?;
        let stale_lock_age_secs =
            positive("stale_lock_age_secs", self.stale_lock_age_secs.clone(), 3600)?;
        let checkpoint_interval_secs =
            positive("checkpoint_interval_secs", self.checkpoint_interval_secs.clone(), 60)?;
        let checkpoint_retention = positive(
            "checkpoint_retention",
            self.checkpoint_retention.clone().map(|p| p.map(|v| v as u64)),
            5,
        )? as usize;

        let identity = match (&self.committer_name, &self.committer_email) {
            (Some(name), Some(email)) => Some(CommitIdentity {
                name: name.value().clone(),
                email: email.value().clone(),
            }),
            (None, None) => None,
            (Some(_), None) => return Err(ConfigError::MissingRequired {
                field: "committer_email".to_string(),
                env_var: "TRUNKLINE_COMMITTER_EMAIL".to_string(),
            }),
            (None, Some(_)) => return Err(ConfigError::MissingRequired {
                field: "committer_name".to_string(),
                env_var: "TRUNKLINE_COMMITTER_NAME".to_string(),
            }),
        };

        let mut settings = CoordinatorSettings::new(repo_path, state_dir);
        settings.lock_timeout = Duration::from_secs(get(&self.lock_timeout_secs, 30));
        settings.poll_interval = Duration::from_millis(poll_interval_ms);
        settings.stale_lock_age = Duration::from_secs(stale_lock_age_secs);
        settings.monitor_interval = Duration::from_secs(monitor_interval_secs);
        settings.checkpoint_retention = checkpoint_retention;
        settings.identity = identity;
        if let Some(rules) = &self.conflict_rules {
            settings.rules = *rules.value();
        }
        settings.processor.integration_timeout = settings.lock_timeout;
        settings.processor.checkpoint_interval = Duration::from_secs(checkpoint_interval_secs);
        if let Some(ceiling) = &self.retry_ceiling {
            settings.processor.retry_ceiling = *ceiling.value();
        }
        settings.processor.manual_residency =
            Duration::from_secs(get(&self.manual_residency_secs, 86_400));
        if let Some(max) = &self.auto_rebase_max_files {
            settings.processor.auto_rebase_max_files = *max.value();
        }
        if let Some(retain) = &self.terminal_retention {
            settings.processor.terminal_retention = *retain.value();
        }
        Ok(settings)
    }

    /// Create a sample config file for user reference
    #[must_use = "this operation can fail and the result should be checked"]
    pub fn create_sample_config() -> Result<PathBuf> {
        let config_path = Self::get_config_path()?;

        // Don't overwrite existing config
        if config_path.exists() {
            return Ok(config_path);
        }
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let sample_config = r#"# Trunkline Configuration File
# Location: ~/.config/trunkline/config.toml (or $XDG_CONFIG_HOME/trunkline/config.toml)
# Every key can also be set with a TRUNKLINE_<KEY> environment variable or a --<key> flag.

# Repository to coordinate (optional, defaults to the current directory)
# repo = "/path/to/repo"

# Where locks, queue and checkpoints live (optional, defaults to a per-repository state dir)
# state_dir = "/var/lib/trunkline/my-repo"

# Seconds to wait for a lock, including the integration lock
lock_timeout_secs = 30

# Milliseconds between attempts while waiting for a lock
poll_interval_ms = 50

# Seconds a lock may go unrenewed before the monitor reclaims it
stale_lock_age_secs = 3600

# Seconds between monitor scans
monitor_interval_secs = 30

# Conflicting attempts before a merge request fails
retry_ceiling = 3

# Seconds a request may wait for manual resolution before it fails
manual_residency_secs = 86400

# Checkpoints kept on disk, and seconds between them while processing
checkpoint_retention = 5
checkpoint_interval_secs = 60

# Finished merge requests kept for outcome lookups
terminal_retention = 200

# Largest content-only conflict that is rebased automatically
auto_rebase_max_files = 3

# Identity on integration commits (optional, defaults to git config)
# committer_name = "Merge Queue"
# committer_email = "merge-queue@example.com"

# How each overlap between resource groups is treated (optional)
# [conflict_rules]
# exact_overlap = { severity = "MAJOR", action = "DOWNGRADE_SERIAL" }
# parent_child = { severity = "MAJOR", action = "DOWNGRADE_SERIAL" }
# same_directory = { severity = "MINOR", action = "PROCEED" }
# disjoint = { action = "PROCEED" }
"#;

        fs::write(&config_path, sample_config).with_context(|| {
            format!(
                "Failed to write sample config to: {}",
                config_path.display()
            )
        })?;
        Ok(config_path)
    }
}

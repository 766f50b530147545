use crate::core::conflict::GroupDeclaration;
use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Options accepted by every command.
#[derive(ClapArgs, Clone, Default, Debug)]
pub struct SharedArgs {
    /// Repository the coordinator manages [default: current directory]
    #[arg(long, global = true, help_heading = "Repository")]
    pub repo: Option<String>,

    /// Directory holding locks, queue and checkpoints [default: per-repository state dir]
    #[arg(long, global = true, help_heading = "Repository")]
    pub state_dir: Option<String>,

    /// Seconds to wait for a lock before giving up [default: 30]
    #[arg(long, global = true, help_heading = "Timing")]
    pub lock_timeout_secs: Option<u64>,

    /// Milliseconds between attempts while waiting for a lock [default: 50]
    #[arg(long, global = true, help_heading = "Timing")]
    pub poll_interval_ms: Option<u64>,

    /// Seconds a lock may go unrenewed before the monitor reclaims it [default: 3600]
    #[arg(long, global = true, help_heading = "Timing")]
    pub stale_lock_age_secs: Option<u64>,

    /// Seconds between monitor scans [default: 30]
    #[arg(long, global = true, help_heading = "Timing")]
    pub monitor_interval_secs: Option<u64>,

    /// Conflicting attempts before a request fails [default: 3]
    #[arg(long, global = true, help_heading = "Queue Policy")]
    pub retry_ceiling: Option<u32>,

    /// Seconds a request may wait for manual resolution [default: 86400]
    #[arg(long, global = true, help_heading = "Queue Policy")]
    pub manual_residency_secs: Option<u64>,

    /// Largest content-only conflict rebased automatically [default: 3]
    #[arg(long, global = true, help_heading = "Queue Policy")]
    pub auto_rebase_max_files: Option<usize>,

    /// Checkpoints kept on disk [default: 5]
    #[arg(long, global = true, help_heading = "Queue Policy")]
    pub checkpoint_retention: Option<usize>,

    /// Finished requests kept for outcome lookups [default: 200]
    #[arg(long, global = true, help_heading = "Queue Policy")]
    pub terminal_retention: Option<usize>,

    /// Seconds between checkpoints while processing [default: 60]
    #[arg(long, global = true, help_heading = "Queue Policy")]
    pub checkpoint_interval_secs: Option<u64>,

    /// Name recorded on integration commits [default: git config]
    #[arg(long, global = true, help_heading = "Identity")]
    pub committer_name: Option<String>,

    /// Email recorded on integration commits [default: git config]
    #[arg(long, global = true, help_heading = "Identity")]
    pub committer_email: Option<String>,

    /// Log level: trace, debug, info, warn, error [default: off]
    #[arg(long, global = true, help_heading = "Logging")]
    pub log_level: Option<String>,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true, help_heading = "Logging")]
    pub log_file: Option<String>,

    /// Log format: text or json
    #[arg(long, global = true, help_heading = "Logging")]
    pub log_format: Option<String>,

    /// Output format: text or json
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Text, help_heading = "Output Options")]
    pub output: OutputFormat,
}

/// Output format for command results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// One JSON document.
    Json,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Text => write!(f, "text"),
            OutputFormat::Json => write!(f, "json"),
        }
    }
}

#[derive(Subcommand, Clone, Debug)]
pub enum LockCommand {
    /// Show who holds a resource group, or every held lock
    Status {
        /// Resource group id; omit to list all held locks
        group: Option<String>,
    },

    /// Run a command while holding a resource group's lock
    #[command(
        long_about = "Acquire the lock on a resource group, run a command, and release the lock\n\
            whether the command succeeds or not. Exits with 6 if the lock is not granted\n\
            within the timeout.",
        after_help = "EXAMPLES:\n    \
            trunkline lock run build -- cargo build --release"
    )]
    Run {
        /// Resource group id
        group: String,

        /// Seconds to wait for the lock [default: --lock-timeout-secs]
        #[arg(long)]
        timeout_secs: Option<u64>,

        /// Command and arguments to run
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
}

/// Arguments for the `conflicts` command.
#[derive(ClapArgs, Clone, Debug, Default)]
pub struct ConflictsArgs {
    /// Resource group as ID=PATTERN[,PATTERN...] (repeatable)
    #[arg(long = "group", value_name = "ID=PATTERNS")]
    pub groups: Vec<String>,

    /// TOML or JSON file with [[group]] declarations
    #[arg(long)]
    pub file: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct GroupFile {
    #[serde(rename = "group", default)]
    groups: Vec<GroupDeclaration>,
}

impl ConflictsArgs {
    /// Collects declarations from `--file` first, then each `--group`.
    pub fn declarations(&self) -> Result<Vec<GroupDeclaration>> {
        let mut declarations = match &self.file {
            Some(path) => load_group_file(path)?,
            None => Vec::new(),
        };
        for spec in &self.groups {
            declarations.push(parse_group_spec(spec)?);
        }
        if declarations.is_empty() {
            anyhow::bail!("No resource groups given; use --group or --file");
        }
        Ok(declarations)
    }
}

/// Parses `ID=PATTERN[,PATTERN...]`.
pub fn parse_group_spec(spec: &str) -> Result<GroupDeclaration> {
    let (id, patterns) = spec
        .split_once('=')
        .with_context(|| format!("Expected ID=PATTERNS, got '{}'", spec))?;
    Ok(GroupDeclaration {
        id: id.trim().to_string(),
        patterns: patterns
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect(),
    })
}

fn load_group_file(path: &Path) -> Result<Vec<GroupDeclaration>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let file: GroupFile = if path.extension().is_some_and(|e| e == "json") {
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?
    } else {
        toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))?
    };
    Ok(file.groups)
}

/// Available commands
#[derive(Subcommand, Clone, Debug)]
pub enum Commands {
    /// Inspect or hold resource group locks
    #[command(subcommand)]
    Lock(LockCommand),

    /// Classify overlap between resource groups
    #[command(
        long_about = "Compare every pair of resource groups by their declared path patterns and\n\
            recommend how the batch can run. Exits with 2 if any pair must not run in parallel.",
        after_help = "EXAMPLES:\n    \
            trunkline conflicts --group a=src/auth.ts --group b=src/payments.ts --group c=src/auth.ts\n    \
            trunkline conflicts --file groups.toml --output json"
    )]
    Conflicts(ConflictsArgs),

    /// Dry-run merge a branch into a target and report conflicting files
    Check {
        /// Branch to merge
        source: String,
        /// Branch to merge into
        target: String,
    },

    /// Submit a branch for integration into a target
    Submit {
        /// Branch to integrate
        source: String,
        /// Branch to integrate into
        target: String,
    },

    /// Show the queue with positions and wait times
    Status,

    /// Show the outcome of one merge request
    Outcome {
        /// Request id, e.g. mr-12
        id: String,
    },

    /// Return a manually resolved request to the queue
    Resolve {
        /// Request id
        id: String,
    },

    /// Run the queue processor
    #[command(
        long_about = "Dequeue and integrate waiting merge requests one at a time until the queue is\n\
            empty. Only one processor runs at a time; a second exits with 7."
    )]
    Process {
        /// Stop after this many requests
        #[arg(long)]
        max_steps: Option<usize>,
    },

    /// Reconcile state after a crash
    Recover,

    /// Reclaim orphaned and stale locks
    Monitor {
        /// Run a single scan instead of watching until interrupted
        #[arg(long)]
        once: bool,
    },
}

#[derive(Parser, Clone, Debug)]
#[command(
    name = "trunkline",
    author,
    version,
    long_version = concat!(env!("CARGO_PKG_VERSION"), " (", env!("GIT_HASH"), ")"),
    about = "Coordinate parallel workers sharing one git repository",
    long_about = "Advisory locks over resource groups, conflict classification for declared path\n\
        patterns, and a crash-safe merge queue that integrates finished work into a shared trunk.\n\n\
        Configuration can be provided via CLI arguments, environment variables (TRUNKLINE_*),\n\
        or the config file (~/.config/trunkline/config.toml).",
    after_help = "EXAMPLES:\n    \
        trunkline submit feature/login main\n    \
        trunkline process\n    \
        trunkline status --output json\n    \
        trunkline lock run build -- make\n    \
        trunkline --create-config"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[command(flatten)]
    pub shared: SharedArgs,

    /// Create a sample configuration file at ~/.config/trunkline/config.toml
    #[arg(long)]
    pub create_config: bool,
}

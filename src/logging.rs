//! Logging setup for the `trunkline` binary.
//!
//! Logging is off unless a level is given. Events go to stderr, or to a file when one
//! is configured, as compact text or JSON lines. Only the `trunkline` target is enabled,
//! so dependency noise never reaches the output.
//!
//! Stdout is reserved for command output; logs never go there.

use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

pub const LOG_LEVEL_ENV: &str = "TRUNKLINE_LOG_LEVEL";
pub const LOG_FILE_ENV: &str = "TRUNKLINE_LOG_FILE";
pub const LOG_FORMAT_ENV: &str = "TRUNKLINE_LOG_FORMAT";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "trace" => Some(Self::Trace),
            "debug" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "warn" | "warning" => Some(Self::Warn),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_filter_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

impl LogFormat {
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "text" => Some(Self::Text),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct LogConfig {
    /// `None` disables logging.
    pub level: Option<LogLevel>,
    /// `None` logs to stderr.
    pub file: Option<PathBuf>,
    pub format: LogFormat,
}

/// Keeps the background log writer alive; pending events are flushed when it drops.
pub struct LogGuard {
    _writer_guard: WorkerGuard,
}

/// Installs the global subscriber.
///
/// Returns `None` when logging is disabled or the log file cannot be opened.
///
/// # Example
///
/// ```rust,no_run
/// use trunkline::logging::{LogConfig, LogFormat, LogLevel, init_logging};
///
/// let _guard = init_logging(LogConfig {
///     level: Some(LogLevel::Debug),
///     file: None,
///     format: LogFormat::Json,
/// });
/// ```
#[must_use = "the returned guard must be held until application exit"]
pub fn init_logging(config: LogConfig) -> Option<LogGuard> {
    let level = config.level?;
    let filter = EnvFilter::new(format!("trunkline={}", level.as_filter_str()));

    let (writer, guard) = match &config.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .ok()?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };
    let to_file = config.file.is_some();

    match config.format {
        LogFormat::Json => {
            let layer = fmt::layer()
                .with_writer(writer)
                .json()
                .with_span_events(FmtSpan::CLOSE)
                .with_file(to_file)
                .with_line_number(to_file);
            tracing_subscriber::registry()
                .with(filter)
                .with(layer)
                .init();
        }
        LogFormat::Text if to_file => {
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .with_file(true)
                .with_line_number(true);
            tracing_subscriber::registry()
                .with(filter)
                .with(layer)
                .init();
        }
        LogFormat::Text => {
            let layer = fmt::layer()
                .with_writer(writer)
                .with_target(true)
                .compact();
            tracing_subscriber::registry()
                .with(filter)
                .with(layer)
                .init();
        }
    }

    Some(LogGuard {
        _writer_guard: guard,
    })
}

/// Reads logging flags before clap runs, so parse errors can be logged too.
///
/// CLI flags win over environment variables.
#[must_use]
pub fn parse_early_log_config(args: &[String]) -> LogConfig {
    let pick = |flag: &str, env: &str| extract_arg_value(args, flag).or_else(|| std::env::var(env).ok());

    LogConfig {
        level: pick("--log-level", LOG_LEVEL_ENV).and_then(|s| LogLevel::parse(&s)),
        file: pick("--log-file", LOG_FILE_ENV).map(PathBuf::from),
        format: pick("--log-format", LOG_FORMAT_ENV)
            .and_then(|s| LogFormat::parse(&s))
            .unwrap_or_default(),
    }
}

/// Value of `--flag value` or `--flag=value`.
fn extract_arg_value(args: &[String], flag: &str) -> Option<String> {
    let prefix = format!("{}=", flag);
    args.iter()
        .find_map(|a| a.strip_prefix(&prefix).map(str::to_string))
        .or_else(|| args.windows(2).find(|w| w[0] == flag).map(|w| w[1].clone()))
}

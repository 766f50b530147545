use std::{fmt, ops::Deref, path::PathBuf};

use serde::{Deserialize, Serialize};

/// Configuration layer a setting was read from, highest precedence first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum Origin {
    /// Command line flag, e.g. `--retry-ceiling 5`.
    Cli { raw: String },
    Env { var: String, raw: String },
    /// Key in a config file, e.g. `retry_ceiling = 5`.
    File { path: PathBuf, raw: String },
    Default,
}

impl Origin {
    pub fn name(&self) -> &'static str {
        match self {
            Origin::Cli { .. } => "cli",
            Origin::Env { .. } => "env",
            Origin::File { .. } => "file",
            Origin::Default => "default",
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Cli { raw } => write!(f, "`{}` on the command line", raw),
            Origin::Env { var, raw } => write!(f, "{}={}", var, raw),
            Origin::File { path, raw } => write!(f, "`{}` in {}", raw, path.display()),
            Origin::Default => f.write_str("built-in default"),
        }
    }
}

/// A setting together with where it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedProperty<T> {
    value: T,
    origin: Origin,
}

impl<T> ParsedProperty<T> {
    pub fn cli(value: T, raw: impl Into<String>) -> Self {
        Self {
            value,
            origin: Origin::Cli { raw: raw.into() },
        }
    }

    pub fn env(value: T, var: impl Into<String>, raw: impl Into<String>) -> Self {
        Self {
            value,
            origin: Origin::Env {
                var: var.into(),
                raw: raw.into(),
            },
        }
    }

    pub fn file(value: T, path: impl Into<PathBuf>, raw: impl Into<String>) -> Self {
        Self {
            value,
            origin: Origin::File {
                path: path.into(),
                raw: raw.into(),
            },
        }
    }

    pub fn builtin(value: T) -> Self {
        Self {
            value,
            origin: Origin::Default,
        }
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn into_value(self) -> T {
        self.value
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    pub fn source_name(&self) -> &'static str {
        self.origin.name()
    }

    /// Raw text the value was parsed from; `None` for built-in defaults.
    pub fn original(&self) -> Option<&str> {
        match &self.origin {
            Origin::Cli { raw } | Origin::Env { raw, .. } | Origin::File { raw, .. } => Some(raw),
            Origin::Default => None,
        }
    }

    pub fn is_from_source(&self, source: &str) -> bool {
        self.source_name() == source
    }

    /// Same origin, transformed value.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ParsedProperty<U> {
        ParsedProperty {
            value: f(self.value),
            origin: self.origin,
        }
    }
}

impl<T> Deref for ParsedProperty<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.value
    }
}

impl<T: fmt::Display> fmt::Display for ParsedProperty<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.value.fmt(f)
    }
}

impl<T: AsRef<str>> AsRef<str> for ParsedProperty<T> {
    fn as_ref(&self) -> &str {
        self.value.as_ref()
    }
}

impl<T> From<T> for ParsedProperty<T> {
    fn from(value: T) -> Self {
        ParsedProperty::builtin(value)
    }
}

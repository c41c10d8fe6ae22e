//! Pipeline configuration.
//!
//! Two halves:
//! - [`ManagerConfig`]: runtime knobs for the pipeline manager (builder style)
//! - [`Declaration`]s: the ordered `key value` lines of a pipeline file

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;

use crate::channel::DEFAULT_CAPACITY;
use crate::entity::{DEFAULT_TICK, Tuning};

/// Identity the pipeline manager uses unless configured otherwise.
pub const DEFAULT_IDENTITY: &str = "pipeline_manager";

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub identity: String,
    pub tick: Duration,
    pub capacity: usize,
    /// How long to wait for operations to finish after `stop` was sent.
    pub shutdown_grace: Duration,
    /// Directory holding each operation's `<identity>.conf`.
    pub config_dir: PathBuf,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            identity: DEFAULT_IDENTITY.to_string(),
            tick: DEFAULT_TICK,
            capacity: DEFAULT_CAPACITY,
            shutdown_grace: Duration::from_secs(2),
            config_dir: PathBuf::from("."),
        }
    }
}

impl ManagerConfig {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            ..Self::default()
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_config_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config_dir = dir.into();
        self
    }

    pub fn tuning(&self) -> Tuning {
        Tuning {
            tick: self.tick,
            capacity: self.capacity,
        }
    }

    pub fn operation_config_path(&self, identity: &str) -> PathBuf {
        self.config_dir.join(format!("{identity}.conf"))
    }
}

/// One line of a pipeline file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "key", content = "value", rename_all = "snake_case")]
pub enum Declaration {
    /// Instantiate the operation with this identity.
    Operation(String),
    /// A signal the manager may emit.
    Signal(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("line {line}: expected '<key> <value>', got '{text}'")]
    Malformed { line: usize, text: String },
    #[error("line {line}: unknown key '{key}'")]
    UnknownKey { line: usize, key: String },
}

/// Parse pipeline declarations.
///
/// Keys are `operation` and `signal` (the Italian `operazione` and `segnale`
/// are accepted too). Blank lines and `#` comments are skipped.
pub fn parse(text: &str) -> Result<Vec<Declaration>, ConfigError> {
    let mut declarations = Vec::new();
    for (index, raw) in text.lines().enumerate() {
        let line = index + 1;
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let Some((key, value)) = trimmed.split_once(char::is_whitespace) else {
            return Err(ConfigError::Malformed {
                line,
                text: trimmed.to_string(),
            });
        };
        let value = value.trim();
        if value.is_empty() || value.contains(char::is_whitespace) {
            return Err(ConfigError::Malformed {
                line,
                text: trimmed.to_string(),
            });
        }

        let declaration = match key {
            "operation" | "operazione" => Declaration::Operation(value.to_string()),
            "signal" | "segnale" => Declaration::Signal(value.to_string()),
            other => {
                return Err(ConfigError::UnknownKey {
                    line,
                    key: other.to_string(),
                });
            }
        };
        declarations.push(declaration);
    }
    Ok(declarations)
}

/// Read and parse a pipeline file.
pub fn load(path: &Path) -> Result<Vec<Declaration>, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse(&text)
}

use std::path::PathBuf;

use thiserror::Error;

use crate::model::EntryStatus;

/// Fatal problems that stop a scan before (or while) it runs.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("invalid scan root {}: {reason}", path.display())]
    InvalidRoot { path: PathBuf, reason: String },
    #[error("scan cancelled")]
    Cancelled,
}

/// Outcome of a single failed strategy attempt.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StrategyError {
    /// The target is already gone; callers treat this as success.
    #[error("path no longer exists")]
    NotFound,
    /// The attempt failed but another mechanism may still remove the target.
    #[error("{strategy} failed: {message}")]
    Recoverable { strategy: String, message: String },
    /// No other strategy should be tried for this target.
    #[error("{strategy} failed fatally: {message}")]
    Fatal { strategy: String, message: String },
}

impl StrategyError {
    pub fn recoverable(strategy: &str, message: impl Into<String>) -> Self {
        Self::Recoverable {
            strategy: strategy.to_string(),
            message: message.into(),
        }
    }

    pub fn fatal(strategy: &str, message: impl Into<String>) -> Self {
        Self::Fatal {
            strategy: strategy.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum DeleteError {
    #[error("refusing to delete {}: {reason}", path.display())]
    Unsafe { path: PathBuf, reason: String },
    #[error("all deletion strategies failed for {}: {}", path.display(), attempts.join("; "))]
    Exhausted { path: PathBuf, attempts: Vec<String> },
    #[error("no deletion strategy is available on this system")]
    NoStrategyAvailable,
    #[error("deletion of {} not started: run was cancelled", path.display())]
    Cancelled { path: PathBuf },
    #[error(transparent)]
    Status(#[from] StatusError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StatusError {
    #[error("no entry registered for {}", path.display())]
    UnknownEntry { path: PathBuf },
    #[error("entry already registered for {}", path.display())]
    DuplicateEntry { path: PathBuf },
    #[error("invalid transition for {}: {from:?} -> {to:?}", path.display())]
    InvalidTransition {
        path: PathBuf,
        from: EntryStatus,
        to: EntryStatus,
    },
    #[error("size already recorded for {}", path.display())]
    SizeAlreadySet { path: PathBuf },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("custom config file not found: {}", path.display())]
    NotFound { path: PathBuf },
    #[error("failed to parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid value for {property}: {message}")]
    InvalidValue { property: String, message: String },
    #[error("unknown profile: {0}")]
    UnknownProfile(String),
    #[error("invalid boolean value '{0}' (expected true/false, yes/no, on/off or 1/0)")]
    InvalidBool(String),
}

impl ConfigError {
    pub fn invalid(property: &str, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            property: property.to_string(),
            message: message.into(),
        }
    }
}

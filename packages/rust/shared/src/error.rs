//! Error types for citeflow.
//!
//! Library crates use [`CiteflowError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all citeflow operations.
#[derive(Debug, thiserror::Error)]
pub enum CiteflowError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error during fetch or notification delivery.
    #[error("network error: {0}")]
    Network(String),

    /// HTML parsing, seed file, or payload decoding error.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Trigger expression (interval, cron, one-time) could not be parsed.
    #[error("schedule error: {message}")]
    Schedule { message: String },

    /// A pipeline stage's unit of work failed.
    #[error("stage error: {0}")]
    Stage(String),

    /// Illegal pipeline run state transition.
    #[error("invalid run transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// No scheduled task with the given id.
    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// An operation exceeded its time budget.
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// An operation was cancelled before it completed.
    #[error("cancelled: {0}")]
    Cancelled(String),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, CiteflowError>;

impl CiteflowError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a schedule error from any displayable message.
    pub fn schedule(msg: impl Into<String>) -> Self {
        Self::Schedule {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = CiteflowError::config("missing database path");
        assert_eq!(err.to_string(), "config error: missing database path");

        let err = CiteflowError::schedule("unsupported interval unit 'w'");
        assert!(err.to_string().contains("unit 'w'"));

        let err = CiteflowError::InvalidTransition {
            from: "COMPLETED".into(),
            to: "RUNNING".into(),
        };
        assert_eq!(
            err.to_string(),
            "invalid run transition from COMPLETED to RUNNING"
        );
    }
}

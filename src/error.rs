//! Crate-wide error types
//!
//! This module provides:
//! - The `CoreError` enum covering every failure class in the core
//! - The `CoreResult` alias used throughout the crate
//!
//! Cache read paths deliberately do not surface these errors to callers:
//! reads are speculative and return `None` on any failure. Errors exist for
//! write paths, lock acquisition, and scheduler-managed tasks, where the
//! retry and dead-letter layers need a closed set of kinds to classify.

use std::path::PathBuf;
use thiserror::Error;

/// Errors produced by the packvault core
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("corrupt data: {0}")]
    Corrupt(String),

    #[error("file is locked for writing: {path}")]
    LockedForWriting { path: PathBuf },

    #[error("write lock timeout on {path} ({active_readers} active readers)")]
    WriteTimeout {
        path: PathBuf,
        active_readers: usize,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("resource exhaustion: {0}")]
    ResourceExhaustion(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid argument or state: {0}")]
    Permanent(String),

    #[error("external service failure: {0}")]
    ExternalService(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("controller disposed")]
    Disposed,
}

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    /// Short stable name of the error kind, used in dead-letter entries
    /// and formatted reports.
    pub fn kind_name(&self) -> &'static str {
        match self {
            CoreError::NotFound(_) => "NotFound",
            CoreError::Corrupt(_) => "Corrupt",
            CoreError::LockedForWriting { .. } => "LockedForWriting",
            CoreError::WriteTimeout { .. } => "WriteTimeout",
            CoreError::Cancelled => "Cancelled",
            CoreError::ResourceExhaustion(_) => "ResourceExhaustion",
            CoreError::Io(_) => "Io",
            CoreError::Permanent(_) => "Permanent",
            CoreError::ExternalService(_) => "ExternalService",
            CoreError::Configuration(_) => "Configuration",
            CoreError::Transient(_) => "Transient",
            CoreError::Disposed => "Disposed",
        }
    }

    /// Whether a retry can plausibly succeed without operator intervention.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            CoreError::Permanent(_)
                | CoreError::Configuration(_)
                | CoreError::Cancelled
                | CoreError::Disposed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_are_stable() {
        let err = CoreError::WriteTimeout {
            path: PathBuf::from("/tmp/a.var"),
            active_readers: 3,
        };
        assert_eq!(err.kind_name(), "WriteTimeout");
        assert_eq!(CoreError::Cancelled.kind_name(), "Cancelled");
    }

    #[test]
    fn test_retryability() {
        assert!(CoreError::Transient("flaky".into()).is_retryable());
        assert!(CoreError::Io(std::io::Error::other("disk")).is_retryable());
        assert!(!CoreError::Permanent("bad arg".into()).is_retryable());
        assert!(!CoreError::Cancelled.is_retryable());
    }
}

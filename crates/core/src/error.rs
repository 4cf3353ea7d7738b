use std::fmt::Display;
use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BackendError>;

/// Errors surfaced by every backend operation.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("{key}: not found")]
    NotFound { key: String },

    #[error(
        "missing credentials: configure them explicitly or set {account_var} and {secret_var}"
    )]
    MissingCredentials {
        account_var: &'static str,
        secret_var: &'static str,
    },

    #[error("{key}: content mismatch: expected {expected} bytes, remote object has {actual}")]
    ContentMismatch {
        key: String,
        expected: u64,
        actual: u64,
    },

    #[error("{key}: transfer failed: {message}")]
    TransferFailed {
        key: String,
        message: String,
        retryable: bool,
    },

    #[error("{key}: cancelled")]
    Cancelled { key: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid part path {path:?}: {reason}")]
    InvalidPath { path: String, reason: &'static str },

    #[error("BUG: {0}")]
    Misuse(String),
}

impl BackendError {
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    pub fn transfer(key: impl Into<String>, err: impl Display, retryable: bool) -> Self {
        Self::TransferFailed {
            key: key.into(),
            message: err.to_string(),
            retryable,
        }
    }

    pub fn mismatch(key: impl Into<String>, expected: u64, actual: u64) -> Self {
        Self::ContentMismatch {
            key: key.into(),
            expected,
            actual,
        }
    }

    /// Short read/write against the declared part size.
    pub fn truncated(key: impl Into<String>, expected: u64, actual: u64) -> Self {
        Self::transfer(
            key,
            format!("stream ended after {actual} of {expected} bytes"),
            true,
        )
    }

    /// Maps a local I/O error, keeping "not found" distinct from transfer failures.
    pub fn io(key: impl Into<String>, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::not_found(key),
            kind => Self::transfer(key, &err, is_transient_io(kind)),
        }
    }

    /// Whether retrying the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransferFailed {
                retryable: true,
                ..
            }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

fn is_transient_io(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::Interrupted
            | io::ErrorKind::TimedOut
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}

/// HTTP statuses worth retrying with backoff: timeouts, throttling and server errors.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429) || (500..600).contains(&status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_not_found_maps_to_not_found() {
        let err = BackendError::io("a/b", io::Error::from(io::ErrorKind::NotFound));
        assert!(err.is_not_found());
        assert!(!err.is_retryable());
    }

    #[test]
    fn transient_io_is_retryable() {
        let err = BackendError::io("a/b", io::Error::from(io::ErrorKind::TimedOut));
        assert!(err.is_retryable());
        let err = BackendError::io("a/b", io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(!err.is_retryable());
    }

    #[test]
    fn logical_errors_are_not_retryable() {
        assert!(!BackendError::mismatch("k", 1, 2).is_retryable());
        assert!(!BackendError::not_found("k").is_retryable());
        assert!(!BackendError::Misuse("stopped".into()).is_retryable());
    }

    #[test]
    fn status_classification() {
        assert!(is_retryable_status(503));
        assert!(is_retryable_status(429));
        assert!(is_retryable_status(408));
        assert!(!is_retryable_status(403));
        assert!(!is_retryable_status(404));
    }

    #[test]
    fn messages_name_the_key() {
        let err = BackendError::transfer("dir/part1", "connection reset", true);
        assert_eq!(err.to_string(), "dir/part1: transfer failed: connection reset");
    }
}

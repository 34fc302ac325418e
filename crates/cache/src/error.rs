//! Cache Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};
use std::path::PathBuf;

/// A cache error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for cache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// A [`ProcessLock`](crate::ProcessLock) was released more times than it
    /// was acquired. Programmer error.
    #[display("lock released without a matching acquire: {}", _0.display())]
    ImbalancedLock(#[error(not(source))] PathBuf),
    /// A [`DurableStore`](crate::DurableStore) was closed more times than it
    /// was opened. Programmer error.
    #[display("store closed without a matching open: {}", _0.display())]
    ImbalancedOpen(#[error(not(source))] PathBuf),
    /// The lock file could not be created or locked.
    #[display("could not lock: {}", _0.display())]
    Lock(#[error(not(source))] PathBuf),
    #[display("database error")]
    Database,
    #[display("database migration error")]
    Migration,
    /// Serialization/deserialization error.
    #[display("invalid cache data: {_0}")]
    InvalidData(#[error(not(source))] &'static str),
    /// Path is absolute, contains null bytes or escapes its root.
    #[display("invalid path: {}", _0.display())]
    InvalidPath(#[error(not(source))] PathBuf),
    /// Filesystem operation on a referenced or owned file failed.
    #[display("I/O error: {}", _0.display())]
    Io(#[error(not(source))] PathBuf),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Lock(_) | Self::Database | Self::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn imbalance_is_never_retryable() {
        assert!(!ErrorKind::ImbalancedLock(PathBuf::from("a.lck")).is_retryable());
        assert!(!ErrorKind::ImbalancedOpen(PathBuf::from("a.db")).is_retryable());
        assert!(ErrorKind::Database.is_retryable());
    }

    #[test]
    fn error_kind_display() {
        assert_eq!(
            ErrorKind::ImbalancedLock(PathBuf::from("/tmp/issue.db.lck")).to_string(),
            "lock released without a matching acquire: /tmp/issue.db.lck"
        );
        assert_eq!(ErrorKind::InvalidData("value").to_string(), "invalid cache data: value");
    }
}

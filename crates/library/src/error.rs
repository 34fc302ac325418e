//! Library Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};

/// A library error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for library operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// The issue has no valid downloaded images; it has to be crawled again.
    #[display("source images missing for issue: {_0}")]
    SourceMissing(#[error(not(source))] String),
    /// Staging, compiling or caching the documents failed.
    #[display("document build failed")]
    Build,
    /// The documents were built but could not be sent.
    #[display("delivery failed")]
    Delivery,
    #[display("{_0} timed out")]
    Timeout(#[error(not(source))] &'static str),
    #[display("cache error")]
    Cache,
    #[display("catalog error")]
    Catalog,
    #[display("unknown user: {_0}")]
    UnknownUser(#[error(not(source))] String),
    #[display("unknown issue: {_0}")]
    UnknownIssue(#[error(not(source))] String),
    /// No manga in the catalog was crawled by this spider.
    #[display("unknown spider: {_0}")]
    UnknownSpider(#[error(not(source))] String),
    #[display("invalid argument: {_0}")]
    InvalidArgument(#[error(not(source))] String),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Build | Self::Delivery | Self::Timeout(_) | Self::Cache | Self::Catalog)
    }

    /// Errors caused by how the command was invoked rather than by a build.
    pub fn is_usage(&self) -> bool {
        matches!(
            self,
            Self::UnknownUser(_) | Self::UnknownIssue(_) | Self::UnknownSpider(_) | Self::InvalidArgument(_)
        )
    }
}

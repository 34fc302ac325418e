//! Mobi Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};
use std::path::PathBuf;

/// A document building error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for document building operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// Staging directory already has content; pick another path or clean it.
    #[display("container already exists: {}", _0.display())]
    ContainerExists(#[error(not(source))] PathBuf),
    /// Refused to clean a container holding files it never staged.
    #[display("unexpected content in container: {}", _0.display())]
    UnexpectedContent(#[error(not(source))] PathBuf),
    /// The container has no pages to split or build.
    #[display("container has no pages: {}", _0.display())]
    NoPages(#[error(not(source))] PathBuf),
    /// An image could not be decoded, transformed or encoded.
    #[display("image error: {}", _0.display())]
    Image(#[error(not(source))] PathBuf),
    #[display("I/O error: {}", _0.display())]
    Io(#[error(not(source))] PathBuf),
    /// Template for a generated descriptor file failed to compile or render.
    #[display("template error: {_0}")]
    Template(#[error(not(source))] &'static str),
    /// An embedded asset is missing from the binary.
    #[display("asset not found: {_0}")]
    AssetNotFound(#[error(not(source))] String),
    #[display("kindlegen not detected on your system")]
    CompilerNotFound,
    /// The compiler exited with an error code (or `-1` if killed by signal).
    #[display("kindlegen exited with code: {_0}")]
    CompilerFailed(#[error(not(source))] i32),
    /// The compiler reported success but produced no document.
    #[display("kindlegen produced no output: {}", _0.display())]
    CompilerOutputMissing(#[error(not(source))] PathBuf),
    /// The build ran past its deadline; a running compiler has been killed.
    #[display("build deadline exceeded")]
    Timeout,
    /// The compiled document is not a structurally valid MOBI file.
    #[display("invalid MOBI document: {_0}")]
    InvalidFormat(#[error(not(source))] &'static str),
    /// The compiled document carries no SRCS records to strip.
    #[display("document has no SRCS records")]
    NoSources,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_) | Self::CompilerFailed(_) | Self::CompilerOutputMissing(_) | Self::Timeout)
    }
}

//! CLI Error Types

use derive_more::{Display, Error};
use std::process::ExitCode;

pub type Error = exn::Exn<ErrorKind>;
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// The configuration couldn't be loaded or names something unusable.
    #[display("invalid configuration")]
    Config,
    /// The command refers to something that doesn't exist or its arguments
    /// contradict each other.
    #[display("invalid command")]
    Usage,
    #[display("command failed")]
    Runtime,
}

impl ErrorKind {
    /// Wraps a library error, classifying it by what caused it.
    #[track_caller]
    pub fn library(err: kmanga_library::error::Error) -> Error {
        let kind = match err.is_usage() {
            true => Self::Usage,
            false => Self::Runtime,
        };
        err.raise(kind)
    }

    pub fn exit_code(&self) -> ExitCode {
        match self {
            Self::Config | Self::Usage => ExitCode::from(2),
            Self::Runtime => ExitCode::FAILURE,
        }
    }
}

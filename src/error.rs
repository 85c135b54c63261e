//! Errors.
//!
//! Every fallible operation in the crate returns [`Result`]. Failures are fatal to the current
//! training run and are propagated to the caller; the only exceptions are callback side effects,
//! which log and continue.
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Malformed or inconsistent command line or configuration input.
    #[error("configuration error: {0}")]
    Config(String),
    /// A prototext file could not be parsed.
    #[error("failed to parse {path:?} at {line}:{column}: {message}")]
    Parse {
        /// The offending file.
        path: PathBuf,
        /// Line, starting at 1.
        line: usize,
        /// Column, starting at 1.
        column: usize,
        /// What went wrong.
        message: String,
    },
    /// A device only operation was invoked without device support.
    #[error("unsupported operation: {0}")]
    Unsupported(String),
    /// Allocation or device failures.
    #[error("resource error: {0}")]
    Resource(String),
    /// Filesystem failures.
    #[error("i/o error on {path:?}: {source}")]
    Io {
        /// The file or directory.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
    pub(crate) fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported(message.into())
    }
    pub(crate) fn resource(message: impl Into<String>) -> Self {
        Self::Resource(message.into())
    }
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
    /// Whether this is a configuration or parse error.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Parse { .. })
    }
}

/// Returns early with a [`Error::Config`].
macro_rules! config_bail {
    ($($arg:tt)*) => {
        return Err($crate::error::Error::Config(format!($($arg)*)))
    };
}
pub(crate) use config_bail;

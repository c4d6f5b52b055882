//! Error types for tskv.

use std::io;
use thiserror::Error;

/// Result type alias for tskv operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for storage engine operations.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// I/O error from file operations (create, write, close, mmap).
    #[error("I/O error: {0}")]
    Io(String),

    /// Data corruption detected.
    #[error("Corruption detected: {0}")]
    Corruption(String),

    /// Invalid file format or magic number.
    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    /// A table builder was closed without any record.
    #[error("no keys were added to the table")]
    EmptyKeys,

    /// Store directory is locked by another instance.
    #[error("Lock error: {0}")]
    LockError(String),

    /// Manifest error.
    #[error("Manifest error: {0}")]
    ManifestError(String),

    /// A registered merger failed.
    #[error("Merge error: {0}")]
    MergeError(String),

    /// No merger registered under the requested type.
    #[error("Unknown merger type: {0}")]
    UnknownMerger(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Family not found in the store.
    #[error("Family not found: {0}")]
    FamilyNotFound(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Rollup could not be performed.
    #[error("Rollup error: {0}")]
    Rollup(String),

    /// Store or flusher is closed.
    #[error("{0} is closed")]
    Closed(String),

    /// Internal error (should not happen).
    #[error("Internal error: {0}")]
    Internal(String),

    /// Error annotated with the operation that produced it.
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::InvalidFormat(err.to_string())
    }
}

impl Error {
    /// Create a corruption error with the given message.
    pub fn corruption<S: Into<String>>(msg: S) -> Self {
        Error::Corruption(msg.into())
    }

    /// Create an invalid format error.
    pub fn invalid_format<S: Into<String>>(msg: S) -> Self {
        Error::InvalidFormat(msg.into())
    }

    /// Create a manifest error.
    pub fn manifest<S: Into<String>>(msg: S) -> Self {
        Error::ManifestError(msg.into())
    }

    /// Create a merge error.
    pub fn merge<S: Into<String>>(msg: S) -> Self {
        Error::MergeError(msg.into())
    }

    /// Create an internal error.
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Error::Internal(msg.into())
    }

    /// Wrap this error with the operation (and family) it came from.
    pub fn context<S: Into<String>>(self, context: S) -> Self {
        Error::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, with all context layers removed.
    pub fn root(&self) -> &Error {
        match self {
            Error::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Check if this error indicates corruption.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self.root(),
            Error::Corruption(_) | Error::InvalidFormat(_) | Error::ManifestError(_)
        )
    }

    /// Check if this error is a not-found lookup.
    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), Error::NotFound(_) | Error::FamilyNotFound(_))
    }
}

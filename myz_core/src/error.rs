//! Error types for myz_core.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using myz_core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during archive operations.
///
/// `SourceNotFound`, `DuplicateEntry` and `NotFound` are per-entry notices
/// rather than failures: operations collect them into a
/// [`Report`](crate::Report) and carry on.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error occurred during file operations.
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// I/O error tied to a specific path.
    #[error("I/O error on {path}: {source}")]
    PathIo {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Archive is malformed: bad magic, truncated header or record.
    #[error("Invalid archive format: {reason}")]
    Format { reason: String },

    /// Source entry could not be inspected while walking.
    #[error("Source not found: {path}: {reason}")]
    SourceNotFound { path: PathBuf, reason: String },

    /// Path is already covered by an entry in the archive.
    #[error("Duplicate entry: {path}")]
    DuplicateEntry { path: String },

    /// Path is not present in the archive.
    #[error("Not found in archive: {path}")]
    NotFound { path: String },

    /// Payload compression or decompression failed.
    #[error("Compression error: {reason}")]
    Compression { reason: String },

    /// Node record carries an invalid field.
    #[error("Invalid node: {reason}")]
    InvalidNode { reason: String },
}

impl Error {
    /// Create a PathIo error.
    pub fn path_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::PathIo {
            path: path.into(),
            source,
        }
    }

    /// Create a Format error.
    pub fn format(reason: impl Into<String>) -> Self {
        Error::Format {
            reason: reason.into(),
        }
    }

    /// Create a SourceNotFound error.
    pub fn source_not_found(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::SourceNotFound {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a DuplicateEntry error.
    pub fn duplicate_entry(path: impl Into<String>) -> Self {
        Error::DuplicateEntry { path: path.into() }
    }

    /// Create a NotFound error.
    pub fn not_found(path: impl Into<String>) -> Self {
        Error::NotFound { path: path.into() }
    }

    /// Create a Compression error.
    pub fn compression(reason: impl Into<String>) -> Self {
        Error::Compression {
            reason: reason.into(),
        }
    }

    /// Create an InvalidNode error.
    pub fn invalid_node(reason: impl Into<String>) -> Self {
        Error::InvalidNode {
            reason: reason.into(),
        }
    }
}

// Additional From implementations for external error types

impl From<tempfile::PersistError> for Error {
    fn from(err: tempfile::PersistError) -> Self {
        let path = err.file.path().to_path_buf();
        Error::path_io(path, err.error)
    }
}

impl From<ignore::Error> for Error {
    fn from(err: ignore::Error) -> Self {
        // ignore::Error can wrap an io::Error or be a path error
        match err.io_error() {
            Some(io_err) => Error::Io {
                source: std::io::Error::new(io_err.kind(), io_err.to_string()),
            },
            None => Error::Io {
                source: std::io::Error::other(err.to_string()),
            },
        }
    }
}

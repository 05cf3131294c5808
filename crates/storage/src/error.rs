//! Storage engine errors
//!
//! Engine failures are reported as [`StorageError`] and converted into the
//! session layer's [`RealmError`] at the crate boundary.

use shoal_core::RealmError;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Result type alias for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Errors raised by a storage engine connection
#[derive(Debug, Error)]
pub enum StorageError {
    /// Filesystem refused the requested access mode
    #[error("permission denied: {path}")]
    PermissionDenied {
        /// File path
        path: PathBuf,
    },

    /// Exclusive creation requested but the file exists
    #[error("file already exists: {path}")]
    FileExists {
        /// File path
        path: PathBuf,
    },

    /// File missing and creation not allowed
    #[error("file not found: {path}")]
    FileNotFound {
        /// File path
        path: PathBuf,
    },

    /// Any other I/O failure
    #[error("I/O error on {path}: {source}")]
    Io {
        /// File path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// Lock file written by a process with a different architecture
    #[error("incompatible lock file {path}: found '{found}', expected '{expected}'")]
    IncompatibleLockFile {
        /// Lock file path
        path: PathBuf,
        /// Tag found in the lock file
        found: String,
        /// Tag this process writes
        expected: String,
    },

    /// File header or payload is not a valid database file
    #[error("invalid database file {path}: {message}")]
    Format {
        /// File path
        path: PathBuf,
        /// What was wrong
        message: String,
    },

    /// The file was written with a different encryption key
    #[error("encryption key does not match {path}")]
    EncryptionKeyMismatch {
        /// File path
        path: PathBuf,
    },

    /// Write attempted through a read-only connection
    #[error("connection to {path} is read-only")]
    ReadOnly {
        /// File path
        path: PathBuf,
    },

    /// Operation invalid in the connection's current transaction state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Value does not fit the column
    #[error("column {table}.{column}: {message}")]
    ColumnType {
        /// Table name
        table: String,
        /// Column name
        column: String,
        /// Description of the mismatch
        message: String,
    },

    /// Table does not exist
    #[error("no such table: {0}")]
    NoSuchTable(String),

    /// Column does not exist
    #[error("no such column: {table}.{column}")]
    NoSuchColumn {
        /// Table name
        table: String,
        /// Column name
        column: String,
    },
}

impl StorageError {
    /// Classify an I/O error raised while touching `path`
    pub fn from_io(path: &Path, err: io::Error) -> Self {
        let path = path.to_path_buf();
        match err.kind() {
            io::ErrorKind::PermissionDenied => StorageError::PermissionDenied { path },
            io::ErrorKind::NotFound => StorageError::FileNotFound { path },
            io::ErrorKind::AlreadyExists => StorageError::FileExists { path },
            _ => StorageError::Io { path, source: err },
        }
    }

    /// Build a `Format` error
    pub fn format(path: &Path, message: impl Into<String>) -> Self {
        StorageError::Format {
            path: path.to_path_buf(),
            message: message.into(),
        }
    }
}

impl From<StorageError> for RealmError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::PermissionDenied { path } => RealmError::FilePermissionDenied { path },
            StorageError::FileExists { path } => RealmError::FileExists { path },
            StorageError::FileNotFound { path } => RealmError::FileNotFound { path },
            StorageError::Io { path, source } => RealmError::FileAccessError {
                message: source.to_string(),
                path,
                source: Some(source),
            },
            StorageError::IncompatibleLockFile {
                path,
                found,
                expected,
            } => RealmError::IncompatibleLockFile {
                path,
                message: format!("found '{}', expected '{}'", found, expected),
            },
            StorageError::Format { path, message } => RealmError::file_access(path, message),
            StorageError::EncryptionKeyMismatch { path } => {
                RealmError::file_access(path, "encryption key does not match the file")
            }
            StorageError::ReadOnly { path } => RealmError::invalid_transaction(format!(
                "cannot write to read-only realm at '{}'",
                path.display()
            )),
            StorageError::InvalidState(msg) => RealmError::InvalidTransaction(msg),
            StorageError::ColumnType {
                table,
                column,
                message,
            } => RealmError::InvalidValue {
                object_type: table,
                property: column,
                message,
            },
            StorageError::NoSuchTable(table) => RealmError::ObjectTypeNotFound(table),
            StorageError::NoSuchColumn { table, column } => RealmError::InvalidValue {
                object_type: table,
                property: column,
                message: "no such column".to_string(),
            },
        }
    }
}

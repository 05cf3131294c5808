//! Error types for Shoal
//!
//! Every failure the session layer can report is a [`RealmError`]. All of
//! them are terminal for the operation that raised them: nothing here is
//! retried internally. [`RealmError::kind`] gives a `Copy` discriminant for
//! callers that only care about the category.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for realm operations
pub type RealmResult<T> = std::result::Result<T, RealmError>;

/// Category of a [`RealmError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Options conflict with another handle open on the same path
    MismatchedConfig,
    /// Generic I/O failure opening the file
    FileAccessError,
    /// Access mode disallowed by filesystem permissions
    FilePermissionDenied,
    /// Exclusive create requested but the file exists
    FileExists,
    /// Must-exist (or read-only) open but the file is missing
    FileNotFound,
    /// Another process uses an incompatible locking architecture
    IncompatibleLockFile,
    /// Transaction operation invoked in the wrong state
    InvalidTransaction,
    /// Operation invoked off the handle's affinity thread
    IncorrectThread,
    /// Backwards migration, or a schema change that needs a migration
    InvalidSchemaVersion,
    /// Object creation omitted a required property
    MissingPropertyValue,
    /// Configuration is not valid on its own
    InvalidConfig,
    /// Handle was invalidated and released its connection
    Invalidated,
    /// Value does not fit the property it is assigned to
    InvalidValue,
    /// Object type is not part of the schema
    ObjectTypeNotFound,
}

/// Error types for realm handles
#[derive(Debug, Error)]
pub enum RealmError {
    /// Options specified in the config do not match another handle for the path
    #[error("Mismatched config for '{path}': {message}")]
    MismatchedConfig {
        /// File path
        path: PathBuf,
        /// What disagreed
        message: String,
    },

    /// I/O related failure while opening or writing the file
    #[error("File access error for '{path}': {message}")]
    FileAccessError {
        /// File path
        path: PathBuf,
        /// Description of the failure
        message: String,
        /// Underlying I/O error, when there is one
        #[source]
        source: Option<io::Error>,
    },

    /// No permission to open or create the file in the requested mode
    #[error("Permission denied for '{path}'")]
    FilePermissionDenied {
        /// File path
        path: PathBuf,
    },

    /// The file already exists and exclusive creation was requested
    #[error("File already exists: '{path}'")]
    FileExists {
        /// File path
        path: PathBuf,
    },

    /// The file does not exist and creation was not allowed
    #[error("File not found: '{path}'")]
    FileNotFound {
        /// File path
        path: PathBuf,
    },

    /// The file is in use by a process with an incompatible lock layout
    #[error("Incompatible lock file for '{path}': {message}")]
    IncompatibleLockFile {
        /// File path
        path: PathBuf,
        /// Description of the mismatch
        message: String,
    },

    /// Transaction operation in the wrong state
    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),

    /// Handle accessed from a thread other than the one that created it
    #[error("Realm accessed from incorrect thread")]
    IncorrectThread,

    /// Schema version went backwards or a migration is missing
    #[error("Invalid schema version: {0}")]
    InvalidSchemaVersion(String),

    /// Object creation omitted a required property
    #[error("Missing value for property '{object_type}.{property}'")]
    MissingPropertyValue {
        /// Object type name
        object_type: String,
        /// Property name
        property: String,
    },

    /// Configuration rejected before touching the file
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// Handle was invalidated and can no longer be used
    #[error("Realm at '{path}' has been invalidated")]
    Invalidated {
        /// File path
        path: PathBuf,
    },

    /// Value does not match the property's declared type
    #[error("Invalid value for property '{object_type}.{property}': {message}")]
    InvalidValue {
        /// Object type name
        object_type: String,
        /// Property name
        property: String,
        /// Description of the mismatch
        message: String,
    },

    /// Object type is not declared in the schema
    #[error("Object type '{0}' not found in schema")]
    ObjectTypeNotFound(String),
}

impl RealmError {
    /// Category of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            RealmError::MismatchedConfig { .. } => ErrorKind::MismatchedConfig,
            RealmError::FileAccessError { .. } => ErrorKind::FileAccessError,
            RealmError::FilePermissionDenied { .. } => ErrorKind::FilePermissionDenied,
            RealmError::FileExists { .. } => ErrorKind::FileExists,
            RealmError::FileNotFound { .. } => ErrorKind::FileNotFound,
            RealmError::IncompatibleLockFile { .. } => ErrorKind::IncompatibleLockFile,
            RealmError::InvalidTransaction(_) => ErrorKind::InvalidTransaction,
            RealmError::IncorrectThread => ErrorKind::IncorrectThread,
            RealmError::InvalidSchemaVersion(_) => ErrorKind::InvalidSchemaVersion,
            RealmError::MissingPropertyValue { .. } => ErrorKind::MissingPropertyValue,
            RealmError::InvalidConfig(_) => ErrorKind::InvalidConfig,
            RealmError::Invalidated { .. } => ErrorKind::Invalidated,
            RealmError::InvalidValue { .. } => ErrorKind::InvalidValue,
            RealmError::ObjectTypeNotFound(_) => ErrorKind::ObjectTypeNotFound,
        }
    }

    /// Build a `MismatchedConfig` error
    pub fn mismatched_config(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        RealmError::MismatchedConfig {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Build an `InvalidTransaction` error
    pub fn invalid_transaction(message: impl Into<String>) -> Self {
        RealmError::InvalidTransaction(message.into())
    }

    /// Build an `InvalidSchemaVersion` error
    pub fn invalid_schema_version(message: impl Into<String>) -> Self {
        RealmError::InvalidSchemaVersion(message.into())
    }

    /// Build a `FileAccessError` without an underlying I/O error
    pub fn file_access(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        RealmError::FileAccessError {
            path: path.into(),
            message: message.into(),
            source: None,
        }
    }
}

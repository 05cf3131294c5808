//! Storage engine seam
//!
//! The session layer talks to storage only through these two traits. A
//! [`StorageEngine`] opens [`Connection`]s; each connection has its own read
//! view of the file and can promote it to a write transaction. Connections
//! are never shared between handles.
//!
//! ## Transaction model
//!
//! ```text
//!   (no view) --begin_read/group--> Reading(v) --begin_write--> Writing
//!        ^                             |   ^                      |
//!        +---------end_read------------+   +--commit / rollback---+
//! ```
//!
//! `begin_write` always moves the view to the latest committed version.
//! A failed `commit` discards the write, exactly like `rollback`.

use crate::error::StorageResult;
use crate::group::Group;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// How the file is created or required on open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpenMode {
    /// Open the file, creating it if missing
    #[default]
    OpenOrCreate,
    /// Fail with `FileNotFound` if the file is missing
    MustExist,
    /// Fail with `FileExists` if the file already exists
    CreateNew,
}

/// Options handed to [`StorageEngine::open`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineOptions {
    /// Open without write access; the file must exist
    pub read_only: bool,
    /// Keep the data in process memory only
    pub in_memory: bool,
    /// Creation policy
    pub open_mode: OpenMode,
    /// Opaque key the file is bound to
    pub encryption_key: Option<Vec<u8>>,
}

/// Opens connections to database files
pub trait StorageEngine: Send + Sync {
    /// Open a new, independent connection to `path`
    fn open(&self, path: &Path, options: &EngineOptions) -> StorageResult<Box<dyn Connection>>;
}

/// One connection's view of a database file
pub trait Connection: Send {
    /// Path the connection was opened with
    fn path(&self) -> &Path;

    /// Pin the latest committed version as the read view (no-op if pinned)
    fn begin_read(&mut self) -> StorageResult<()>;

    /// Release the read view
    fn end_read(&mut self);

    /// Whether a newer version than the read view has been committed
    fn has_changed(&self) -> bool;

    /// Move the read view to the latest committed version
    ///
    /// Returns whether the view moved. Invalid during a write transaction.
    fn advance_read(&mut self) -> StorageResult<bool>;

    /// Start a write transaction, waiting for any other writer to finish
    fn begin_write(&mut self) -> StorageResult<()>;

    /// Commit the write transaction; returns the new commit version
    fn commit(&mut self) -> StorageResult<u64>;

    /// Discard the write transaction
    fn rollback(&mut self) -> StorageResult<()>;

    /// Whether a write transaction is open
    fn is_in_write(&self) -> bool;

    /// The group visible to this connection (pins a read view if needed)
    fn group(&mut self) -> StorageResult<&Group>;

    /// The group being written; fails outside a write transaction
    fn group_mut(&mut self) -> StorageResult<&mut Group>;

    /// Persisted schema version of the current view
    fn schema_version(&mut self) -> StorageResult<Option<u64>> {
        Ok(self.group()?.schema_version())
    }

    /// Rewrite the file without slack space
    ///
    /// Returns `false` when other connections hold the file open.
    fn compact(&mut self) -> StorageResult<bool>;
}

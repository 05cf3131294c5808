//! Storage layer for shoal
//!
//! This crate implements the storage engine the session layer runs on:
//! - `StorageEngine` / `Connection`: the seam the session layer talks through
//! - `Group` / `Table`: the in-memory image of a database file
//! - `FileEngine`: default engine, one file per path, shared in-process state
//! - File format with CRC32 trailer and atomic whole-file rewrite
//! - Lock file guarding against incompatible processes
//!
//! # Concurrency
//!
//! Any number of connections may read a file; one writes at a time. Each
//! connection reads from an immutable snapshot pinned at `begin_read`, so
//! readers never block the writer.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod engine;
pub mod error;
pub mod file;
pub mod format;
pub mod group;
pub mod lock;

pub use engine::{Connection, EngineOptions, OpenMode, StorageEngine};
pub use error::{StorageError, StorageResult};
pub use file::{default_engine, FileConnection, FileEngine};
pub use group::{Column, Group, Table};
pub use lock::LockFile;

//! ShoalDB - thread-confined session handles over an embedded single-file store
//!
//! A [`Realm`] is a handle to one database file, bound to the thread that
//! opened it. Opening the same file twice on one thread returns the same
//! handle; other threads get their own. Opening with a newer schema version
//! runs the configured migration inside a single write transaction.
//!
//! # Quick Start
//!
//! ```ignore
//! use shoaldb::{ObjectSchema, Property, PropertyType, Realm, RealmConfig, Value};
//!
//! let schema = vec![ObjectSchema::new(
//!     "Person",
//!     vec![Property::new("name", PropertyType::String)],
//! )];
//! let realm = Realm::get_shared_realm(
//!     RealmConfig::new("people.shoal").schema(schema.into()).schema_version(1),
//! )?;
//!
//! realm.begin_transaction()?;
//! realm.create_object("Person", [("name".to_string(), Value::from("Ada"))].into(), false)?;
//! realm.commit_transaction()?;
//! ```
//!
//! # Architecture
//!
//! - `shoal-core`: values, schemas and the error taxonomy
//! - `shoal-storage`: the file engine, snapshots and the single-writer gate
//! - `shoal-engine`: handle cache, migrations, transactions and notifications

pub use shoal_core::{
    is_additive, ErrorKind, ObjectSchema, Property, PropertyType, RealmError, RealmResult,
    Schema, SchemaChange, Value,
};
pub use shoal_engine::*;
pub use shoal_storage::{default_engine, Connection, EngineOptions, OpenMode, StorageEngine};

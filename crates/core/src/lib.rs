//! Core types for Shoal
//!
//! This crate defines the foundational types shared by the storage engine
//! and the session layer:
//! - Value / PropertyType: cell values and column types
//! - Schema / ObjectSchema / Property: declared object types and their diff
//! - RealmError / ErrorKind: error taxonomy of the session layer

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod schema;
pub mod value;

pub use error::{ErrorKind, RealmError, RealmResult};
pub use schema::{is_additive, ObjectSchema, Property, Schema, SchemaChange};
pub use value::{PropertyType, Value};

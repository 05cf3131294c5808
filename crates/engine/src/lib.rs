//! Session layer for shoal
//!
//! This crate sits on top of the storage engine and provides:
//! - Realm: thread-confined handle on one database file
//! - RealmCache: process-wide `path -> thread -> Weak<Realm>` registry
//! - Schema migration on open or on demand (`update_schema`)
//! - Write transactions with change notifications
//! - RealmConfig: builder and TOML configuration
//!
//! The storage engine is reached only through the `StorageEngine` and
//! `Connection` traits of `shoal-storage`.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod notification;
pub mod realm;

pub use notification::{
    ExternalNotifier, Listener, NotificationHub, NotificationToken, RealmEvent,
    DID_CHANGE_NOTIFICATION, REFRESH_REQUIRED_NOTIFICATION,
};
pub use realm::{
    Migration, MigrationFn, Object, Realm, RealmCache, RealmConfig, SharedRealm,
    TransactionState, ENCRYPTION_KEY_LEN,
};

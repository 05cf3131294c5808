//! Realm handles
//!
//! A [`Realm`] is a thread-confined session bound to one database file. It
//! owns its own storage connection, its transaction state and its listener
//! registry. Handles are obtained through [`Realm::get_shared_realm`], which
//! hands out the same `Arc` for repeated requests on one thread.
//!
//! ## Thread confinement
//!
//! The process-wide cache stores `Weak<Realm>` in a static, so `Realm` is
//! `Send + Sync`; its mutable parts sit behind uncontended mutexes. Every
//! public operation still starts with [`Realm::verify_thread`] and fails
//! with `IncorrectThread` off the affinity thread. No lock is held while a
//! listener, the external notifier or a migration callback runs.
//!
//! ## Opening
//!
//! 1. Validate the config on its own.
//! 2. Same-thread cache hit: check compatibility and return it.
//! 3. Check compatibility with any live handle on another thread.
//! 4. Take the per-path creation lock and re-check the cache.
//! 5. Open the storage connection.
//! 6. Resolve the schema against the file: adopt it, verify it
//!    (read-only), or migrate.
//! 7. Cache the handle.

mod cache;
mod config;
mod migration;
mod objects;
mod transactions;

pub use cache::RealmCache;
pub use config::{MigrationFn, RealmConfig, ENCRYPTION_KEY_LEN};
pub use migration::Migration;
pub use objects::Object;
pub use transactions::TransactionState;

use crate::notification::{ExternalNotifier, Listener, NotificationHub, NotificationToken, RealmEvent};
use parking_lot::{Mutex, MutexGuard};
use shoal_core::{RealmError, RealmResult, Schema};
use shoal_storage::Connection;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tracing::{debug, info, warn};

/// Reference-counted realm handle
pub type SharedRealm = Arc<Realm>;

/// Mutable per-handle state
struct RealmState {
    /// `None` once invalidated, or while a migration has it checked out
    connection: Option<Box<dyn Connection>>,
    tx_state: TransactionState,
    auto_refresh: bool,
    invalidated: bool,
}

impl RealmState {
    fn connection(&mut self, path: &Path) -> RealmResult<&mut dyn Connection> {
        if self.invalidated {
            return Err(RealmError::Invalidated {
                path: path.to_path_buf(),
            });
        }
        match self.connection.as_deref_mut() {
            Some(conn) => Ok(conn),
            None => Err(RealmError::invalid_transaction(
                "a schema migration is in progress on this realm",
            )),
        }
    }
}

/// Thread-confined session on one database file
pub struct Realm {
    path: PathBuf,
    thread_id: ThreadId,
    read_only: bool,
    config: Mutex<RealmConfig>,
    state: Mutex<RealmState>,
    notifications: NotificationHub,
}

impl fmt::Debug for Realm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Realm")
            .field("path", &self.path)
            .field("thread_id", &self.thread_id)
            .field("read_only", &self.read_only)
            .finish_non_exhaustive()
    }
}

impl Realm {
    /// Get the realm for `config` on the calling thread
    ///
    /// Returns the cached handle when one is alive for this path and
    /// thread, otherwise opens the file, resolves the schema (running a
    /// migration if needed) and caches the new handle.
    ///
    /// # Errors
    ///
    /// - `InvalidConfig` if the config is invalid on its own
    /// - `MismatchedConfig` if it conflicts with a live handle for the path
    /// - `FileAccessError`, `FilePermissionDenied`, `FileExists`,
    ///   `FileNotFound`, `IncompatibleLockFile` from opening the file
    /// - `InvalidSchemaVersion` if the schema cannot be reached
    pub fn get_shared_realm(config: RealmConfig) -> RealmResult<SharedRealm> {
        config.validate()?;
        let thread = thread::current().id();

        if let Some(realm) = RealmCache::get_realm(&config.path, thread) {
            realm.check_compatible(&config, true)?;
            debug!(target: "shoal::cache", path = %config.path.display(), "Returning cached realm");
            return Ok(realm);
        }
        if let Some(other) = RealmCache::get_any_realm(&config.path) {
            other.check_compatible(&config, false)?;
        }

        let init_lock = RealmCache::init_lock(&config.path);
        let _guard = init_lock.lock();

        // Another open on this thread may have completed while we waited.
        if let Some(realm) = RealmCache::get_realm(&config.path, thread) {
            realm.check_compatible(&config, true)?;
            return Ok(realm);
        }
        if let Some(other) = RealmCache::get_any_realm(&config.path) {
            other.check_compatible(&config, false)?;
        }

        let realm = Arc::new(Realm::open(&config)?);
        realm.resolve_schema(&config)?;

        RealmCache::cache_realm(&realm);
        info!(
            target: "shoal::realm",
            path = %realm.path.display(),
            read_only = realm.read_only,
            schema_version = ?realm.schema_version(),
            "Opened realm"
        );
        Ok(realm)
    }

    fn open(config: &RealmConfig) -> RealmResult<Self> {
        let connection = config.engine.open(&config.path, &config.engine_options())?;
        Ok(Self {
            path: config.path.clone(),
            thread_id: thread::current().id(),
            read_only: config.read_only,
            config: Mutex::new(config.clone()),
            state: Mutex::new(RealmState {
                connection: Some(connection),
                tx_state: TransactionState::Idle,
                auto_refresh: true,
                invalidated: false,
            }),
            notifications: NotificationHub::new(),
        })
    }

    /// Bring the handle's schema in line with the requested one
    fn resolve_schema(&self, requested: &RealmConfig) -> RealmResult<()> {
        let (persisted, persisted_version) = self.persisted_schema()?;

        let Some(target) = requested.schema.clone() else {
            let mut config = self.config.lock();
            config.schema = Some(persisted);
            config.schema_version = persisted_version;
            return Ok(());
        };
        let version = requested.schema_version.or(persisted_version).unwrap_or(0);

        if self.read_only {
            if persisted_version != Some(version) || !persisted.diff(&target).is_empty() {
                return Err(RealmError::invalid_schema_version(format!(
                    "read-only realm at '{}' is at version {:?}, which does not match the requested schema at version {}",
                    self.path.display(),
                    persisted_version,
                    version
                )));
            }
            let mut target = target;
            target.adopt_columns(&persisted);
            let mut config = self.config.lock();
            config.schema = Some(target);
            config.schema_version = Some(version);
            return Ok(());
        }

        // Always planned against the file; a live handle's config may be stale.
        self.update_schema(target, version)?;
        Ok(())
    }

    /// Schema and version of the current view
    fn persisted_schema(&self) -> RealmResult<(Schema, Option<u64>)> {
        let mut state = self.state.lock();
        let conn = state.connection(&self.path)?;
        let group = conn.group()?;
        Ok((group.schema(), group.schema_version()))
    }

    fn check_compatible(&self, requested: &RealmConfig, same_thread: bool) -> RealmResult<()> {
        let current = self.config.lock();
        if current.read_only != requested.read_only {
            return Err(RealmError::mismatched_config(
                &self.path,
                "realm is already open with different read permissions",
            ));
        }
        if current.in_memory != requested.in_memory {
            return Err(RealmError::mismatched_config(
                &self.path,
                "realm is already open with different in-memory settings",
            ));
        }
        if current.encryption_key != requested.encryption_key {
            return Err(RealmError::mismatched_config(
                &self.path,
                "realm is already open with a different encryption key",
            ));
        }
        if same_thread
            && requested.schema_version.is_some()
            && requested.schema_version != current.schema_version
        {
            return Err(RealmError::mismatched_config(
                &self.path,
                format!(
                    "realm is already open at schema version {:?}, requested {:?}",
                    current.schema_version, requested.schema_version
                ),
            ));
        }
        Ok(())
    }

    /// Fail with `IncorrectThread` unless called on the affinity thread
    pub fn verify_thread(&self) -> RealmResult<()> {
        if thread::current().id() != self.thread_id {
            return Err(RealmError::IncorrectThread);
        }
        Ok(())
    }

    fn lock_state(&self) -> MutexGuard<'_, RealmState> {
        self.state.lock()
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    /// Effective configuration, including the schema after migration
    pub fn config(&self) -> RealmConfig {
        self.config.lock().clone()
    }

    /// Affinity thread
    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    /// File path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current schema version (`None` if unversioned)
    pub fn schema_version(&self) -> Option<u64> {
        self.config.lock().schema_version
    }

    /// Current schema
    pub fn schema(&self) -> Option<Schema> {
        self.config.lock().schema.clone()
    }

    /// Whether the handle was opened read-only
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Whether the handle has been invalidated
    pub fn is_invalidated(&self) -> bool {
        self.lock_state().invalidated
    }

    // ========================================================================
    // Notifications
    // ========================================================================

    /// Register a local listener
    pub fn add_notification(&self, listener: Listener) -> RealmResult<NotificationToken> {
        self.verify_thread()?;
        Ok(self.notifications.add(listener))
    }

    /// Remove a local listener; no-op if the token is unknown
    pub fn remove_notification(&self, token: NotificationToken) -> RealmResult<()> {
        self.verify_thread()?;
        self.notifications.remove(token);
        Ok(())
    }

    /// Install (or clear, with `None`) the hook run after every commit
    pub fn set_external_notifier(&self, notifier: Option<ExternalNotifier>) -> RealmResult<()> {
        self.verify_thread()?;
        self.notifications.set_external(notifier);
        Ok(())
    }

    /// Deliver `event` to every local listener
    pub fn send_local_notifications(&self, event: RealmEvent) -> RealmResult<()> {
        self.verify_thread()?;
        self.notifications.send_local(event);
        Ok(())
    }

    /// Run the external notifier, if installed
    pub fn send_external_notifications(&self) -> RealmResult<()> {
        self.verify_thread()?;
        self.notifications.send_external();
        Ok(())
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Release the storage connection now
    ///
    /// An open write transaction is cancelled first. The handle is evicted
    /// from the cache; every later operation on it fails with `Invalidated`
    /// and the next `get_shared_realm` opens a fresh handle.
    pub fn invalidate(&self) -> RealmResult<()> {
        self.verify_thread()?;
        {
            let mut state = self.lock_state();
            if state.invalidated {
                return Ok(());
            }
            if state.tx_state == TransactionState::InTransaction {
                if let Some(conn) = state.connection.as_deref_mut() {
                    conn.rollback()?;
                }
                state.tx_state = TransactionState::Idle;
            }
            state.connection = None;
            state.invalidated = true;
        }
        RealmCache::remove(&self.path, self.thread_id);
        info!(target: "shoal::realm", path = %self.path.display(), "Invalidated realm");
        Ok(())
    }

    /// Ask the storage engine to reclaim unused file space
    ///
    /// Returns `false` when other connections hold the file open.
    pub fn compact(&self) -> RealmResult<bool> {
        self.verify_thread()?;
        let mut state = self.lock_state();
        if state.tx_state == TransactionState::InTransaction {
            return Err(RealmError::invalid_transaction(
                "cannot compact while a write transaction is open",
            ));
        }
        let compacted = state.connection(&self.path)?.compact()?;
        debug!(target: "shoal::realm", path = %self.path.display(), compacted, "Compact requested");
        Ok(compacted)
    }
}

impl Drop for Realm {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.tx_state == TransactionState::InTransaction {
            warn!(
                target: "shoal::realm",
                path = %self.path.display(),
                "Realm dropped inside a write transaction; rolling back"
            );
            if let Some(conn) = state.connection.as_deref_mut() {
                if let Err(e) = conn.rollback() {
                    warn!(target: "shoal::realm", error = %e, "Rollback on drop failed");
                }
            }
        }
        RealmCache::prune(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_core::ErrorKind;
    use tempfile::TempDir;

    #[test]
    fn test_open_unversioned_file() {
        let dir = TempDir::new().unwrap();
        let realm = Realm::get_shared_realm(RealmConfig::new(dir.path().join("a.shoal"))).unwrap();
        assert_eq!(realm.schema_version(), None);
        assert!(realm.schema().unwrap().is_empty());
        assert_eq!(realm.thread_id(), thread::current().id());
    }

    #[test]
    fn test_same_thread_schema_version_mismatch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.shoal");
        let _realm = Realm::get_shared_realm(
            RealmConfig::new(&path).schema(Schema::new()).schema_version(1),
        )
        .unwrap();
        let err = Realm::get_shared_realm(RealmConfig::new(&path).schema_version(2)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MismatchedConfig);

        // Omitting the version matches any.
        assert!(Realm::get_shared_realm(RealmConfig::new(&path)).is_ok());
    }

    #[test]
    fn test_encryption_key_must_match_live_handle() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.shoal");
        let _realm = Realm::get_shared_realm(RealmConfig::new(&path).encryption_key(vec![1u8; 64]))
            .unwrap();
        let err = Realm::get_shared_realm(RealmConfig::new(&path).encryption_key(vec![2u8; 64]))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MismatchedConfig);
    }

    #[test]
    fn test_invalid_config_rejected_before_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.shoal");
        let err = Realm::get_shared_realm(RealmConfig::new(&path).encryption_key(vec![0u8; 3]))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
        assert!(!path.exists());
    }

    #[test]
    fn test_invalidate_evicts_and_blocks_use() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.shoal");
        let realm = Realm::get_shared_realm(RealmConfig::new(&path)).unwrap();
        realm.invalidate().unwrap();
        realm.invalidate().unwrap();

        assert!(realm.is_invalidated());
        assert_eq!(
            realm.begin_transaction().unwrap_err().kind(),
            ErrorKind::Invalidated
        );
        assert_eq!(realm.refresh().unwrap_err().kind(), ErrorKind::Invalidated);

        let fresh = Realm::get_shared_realm(RealmConfig::new(&path)).unwrap();
        assert!(!Arc::ptr_eq(&realm, &fresh));
        assert!(!fresh.is_invalidated());
    }

    #[test]
    fn test_invalidate_cancels_open_transaction() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.shoal");
        let realm = Realm::get_shared_realm(RealmConfig::new(&path)).unwrap();
        realm.begin_transaction().unwrap();
        realm.invalidate().unwrap();
        assert!(!realm.is_in_transaction());

        // The writer slot was released.
        let fresh = Realm::get_shared_realm(RealmConfig::new(&path)).unwrap();
        fresh.begin_transaction().unwrap();
        fresh.commit_transaction().unwrap();
    }

    #[test]
    fn test_compact() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.shoal");
        let realm = Realm::get_shared_realm(RealmConfig::new(&path)).unwrap();

        realm.begin_transaction().unwrap();
        assert_eq!(
            realm.compact().unwrap_err().kind(),
            ErrorKind::InvalidTransaction
        );
        realm.cancel_transaction().unwrap();
        assert!(realm.compact().unwrap());
    }

    #[test]
    fn test_compact_refused_while_other_thread_holds_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.shoal");
        let realm = Realm::get_shared_realm(RealmConfig::new(&path)).unwrap();

        let (opened_tx, opened_rx) = std::sync::mpsc::channel();
        let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();
        let p = path.clone();
        let handle = thread::spawn(move || {
            let _other = Realm::get_shared_realm(RealmConfig::new(&p)).unwrap();
            opened_tx.send(()).unwrap();
            done_rx.recv().unwrap();
        });

        opened_rx.recv().unwrap();
        assert!(!realm.compact().unwrap());
        done_tx.send(()).unwrap();
        handle.join().unwrap();
        assert!(realm.compact().unwrap());
    }

    #[test]
    fn test_drop_inside_transaction_rolls_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.shoal");
        {
            let realm = Realm::get_shared_realm(RealmConfig::new(&path)).unwrap();
            realm.begin_transaction().unwrap();
        }
        let realm = Realm::get_shared_realm(RealmConfig::new(&path)).unwrap();
        realm.begin_transaction().unwrap();
        realm.cancel_transaction().unwrap();
    }
}

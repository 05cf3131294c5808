//! Process-wide realm cache
//!
//! Maps `path -> thread -> Weak<Realm>` so that asking twice for the same
//! file on the same thread yields the same handle while it is alive, without
//! the cache itself keeping any file open.
//!
//! Entries are validated (upgraded) on every lookup and pruned when the
//! upgrade fails. A dropping realm also prunes its path eagerly.

use super::{Realm, SharedRealm};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, ReentrantMutex};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::thread::ThreadId;
use tracing::debug;

// =============================================================================
// Global Realm Cache
// =============================================================================
//
// The mutex guards map bookkeeping only. It is never held across a file
// open or a migration, and no `Arc<Realm>` is dropped while it is held:
// dropping the last strong reference runs `Realm::drop`, which re-enters
// the cache.

type ThreadMap = HashMap<ThreadId, Weak<Realm>>;

/// Global registry of live realms (path -> thread -> weak reference)
static REALM_CACHE: Lazy<Mutex<HashMap<PathBuf, ThreadMap>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Per-path creation locks, serializing first open and migration of a path
static INIT_LOCKS: Lazy<Mutex<HashMap<PathBuf, Weak<ReentrantMutex<()>>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Accessors for the process-wide realm cache
#[derive(Debug, Clone, Copy)]
pub struct RealmCache;

impl RealmCache {
    /// Live realm for `path` on `thread`, if any
    pub fn get_realm(path: &Path, thread: ThreadId) -> Option<SharedRealm> {
        let mut cache = REALM_CACHE.lock();
        let threads = cache.get_mut(path)?;
        match threads.get(&thread).map(Weak::upgrade) {
            Some(Some(realm)) => Some(realm),
            Some(None) => {
                threads.remove(&thread);
                if threads.is_empty() {
                    cache.remove(path);
                }
                debug!(target: "shoal::cache", path = %path.display(), "Pruned dead cache entry");
                None
            }
            None => None,
        }
    }

    /// Any live realm for `path`, regardless of thread
    pub fn get_any_realm(path: &Path) -> Option<SharedRealm> {
        let mut cache = REALM_CACHE.lock();
        let threads = cache.get_mut(path)?;
        threads.retain(|_, weak| weak.strong_count() > 0);
        let found = threads.values().find_map(Weak::upgrade);
        if threads.is_empty() {
            cache.remove(path);
        }
        found
    }

    /// Record `realm` under its own path and affinity thread
    ///
    /// Replaces any previous entry for that slot.
    pub fn cache_realm(realm: &SharedRealm) {
        let mut cache = REALM_CACHE.lock();
        cache
            .entry(realm.path().to_path_buf())
            .or_default()
            .insert(realm.thread_id(), Arc::downgrade(realm));
        debug!(
            target: "shoal::cache",
            path = %realm.path().display(),
            thread = ?realm.thread_id(),
            "Cached realm"
        );
    }

    /// Evict the entry for `path` on `thread`
    pub fn remove(path: &Path, thread: ThreadId) {
        let mut cache = REALM_CACHE.lock();
        if let Some(threads) = cache.get_mut(path) {
            threads.remove(&thread);
            if threads.is_empty() {
                cache.remove(path);
            }
        }
    }

    /// Drop dead entries for `path`
    pub(crate) fn prune(path: &Path) {
        let mut cache = REALM_CACHE.lock();
        if let Some(threads) = cache.get_mut(path) {
            threads.retain(|_, weak| weak.strong_count() > 0);
            if threads.is_empty() {
                cache.remove(path);
            }
        }
    }

    /// Creation lock for `path`
    ///
    /// Reentrant, so a thread already initializing `path` can open it again
    /// (for instance from inside a migration callback) without deadlocking.
    pub fn init_lock(path: &Path) -> Arc<ReentrantMutex<()>> {
        let mut locks = INIT_LOCKS.lock();
        if let Some(lock) = locks.get(path).and_then(Weak::upgrade) {
            return lock;
        }
        locks.retain(|_, weak| weak.strong_count() > 0);
        let lock = Arc::new(ReentrantMutex::new(()));
        locks.insert(path.to_path_buf(), Arc::downgrade(&lock));
        lock
    }

    /// Number of live entries across all paths
    pub fn len() -> usize {
        REALM_CACHE
            .lock()
            .values()
            .flat_map(HashMap::values)
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Whether the cache holds no live entry
    pub fn is_empty() -> bool {
        Self::len() == 0
    }

    /// Number of entries (live or not yet pruned) recorded for `path`
    pub fn thread_count(path: &Path) -> usize {
        REALM_CACHE.lock().get(path).map_or(0, HashMap::len)
    }
}

//! Change notification dispatch
//!
//! Each realm owns a [`NotificationHub`]: a set of local listeners invoked
//! synchronously on the affinity thread, plus one optional external notifier
//! used to wake observers elsewhere after a commit.
//!
//! Firing takes a snapshot of the listener set and releases the lock before
//! invoking anything, so listeners may add or remove registrations (or call
//! back into the realm) while an event is being delivered.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Event sent when newer commits are available but the view was not advanced
pub const REFRESH_REQUIRED_NOTIFICATION: &str = "RefreshRequiredNotification";

/// Event sent after the realm's view changed (commit or refresh)
pub const DID_CHANGE_NOTIFICATION: &str = "DidChangeNotification";

/// Local listener, called with the event name
pub type Listener = Arc<dyn Fn(&str) + Send + Sync>;

/// External notifier hook, called after every commit
pub type ExternalNotifier = Box<dyn Fn() + Send + Sync>;

/// Events delivered to local listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RealmEvent {
    /// Newer data exists; call `refresh` to see it
    RefreshRequired,
    /// The realm's view changed
    DidChange,
}

impl RealmEvent {
    /// Wire name of the event
    pub fn as_str(self) -> &'static str {
        match self {
            RealmEvent::RefreshRequired => REFRESH_REQUIRED_NOTIFICATION,
            RealmEvent::DidChange => DID_CHANGE_NOTIFICATION,
        }
    }
}

impl fmt::Display for RealmEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque handle identifying one listener registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NotificationToken(u64);

impl NotificationToken {
    /// Numeric value of the token
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

#[derive(Default)]
struct Registry {
    next_token: u64,
    listeners: Vec<(NotificationToken, Listener)>,
    external: Option<Arc<dyn Fn() + Send + Sync>>,
}

/// Listener registry of one realm
#[derive(Default)]
pub struct NotificationHub {
    inner: Mutex<Registry>,
}

impl fmt::Debug for NotificationHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("NotificationHub")
            .field("listeners", &inner.listeners.len())
            .field("external", &inner.external.is_some())
            .finish()
    }
}

impl NotificationHub {
    /// Create an empty hub
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener
    ///
    /// Registering the same `Arc` twice returns the existing token.
    pub fn add(&self, listener: Listener) -> NotificationToken {
        let mut inner = self.inner.lock();
        if let Some((token, _)) = inner
            .listeners
            .iter()
            .find(|(_, existing)| same_listener(existing, &listener))
        {
            return *token;
        }
        inner.next_token += 1;
        let token = NotificationToken(inner.next_token);
        inner.listeners.push((token, listener));
        token
    }

    /// Remove a registration; no-op if absent
    pub fn remove(&self, token: NotificationToken) {
        self.inner.lock().listeners.retain(|(t, _)| *t != token);
    }

    /// Install or clear the external notifier
    pub fn set_external(&self, notifier: Option<ExternalNotifier>) {
        self.inner.lock().external = notifier.map(Arc::from);
    }

    /// Number of registered listeners
    pub fn len(&self) -> usize {
        self.inner.lock().listeners.len()
    }

    /// Whether no listener is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke every local listener with `event`
    pub fn send_local(&self, event: RealmEvent) {
        let snapshot: Vec<Listener> = self
            .inner
            .lock()
            .listeners
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        debug!(target: "shoal::realm", event = event.as_str(), listeners = snapshot.len(), "Sending local notifications");
        for listener in snapshot {
            listener(event.as_str());
        }
    }

    /// Invoke the external notifier, if one is installed
    pub fn send_external(&self) {
        let external = self.inner.lock().external.clone();
        if let Some(notify) = external {
            notify();
        }
    }

    /// Drop every registration
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.listeners.clear();
        inner.external = None;
    }
}

fn same_listener(a: &Listener, b: &Listener) -> bool {
    // Compare data pointers only; vtable pointers may differ across codegen units.
    std::ptr::eq(
        Arc::as_ptr(a) as *const u8,
        Arc::as_ptr(b) as *const u8,
    )
}

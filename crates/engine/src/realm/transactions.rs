//! Write transactions and view advancement
//!
//! ```text
//!          begin_transaction
//!   Idle -------------------> InTransaction
//!    ^                             |
//!    +---- commit / cancel --------+
//! ```
//!
//! Notifications are sent after the state lock is released.

use super::Realm;
use crate::notification::RealmEvent;
use shoal_core::{RealmError, RealmResult};
use tracing::debug;

/// Write-transaction state of a realm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionState {
    /// No write transaction open
    #[default]
    Idle,
    /// A write transaction is open
    InTransaction,
}

impl Realm {
    /// Start a write transaction
    ///
    /// Sends `DidChangeNotification` afterwards if starting the write moved
    /// the view past commits made elsewhere.
    ///
    /// # Errors
    ///
    /// `IncorrectThread`, `Invalidated`, or `InvalidTransaction` when a
    /// transaction is already open or the realm is read-only. If the engine
    /// fails to start the write, the realm stays `Idle`.
    pub fn begin_transaction(&self) -> RealmResult<()> {
        self.verify_thread()?;
        let advanced = {
            let mut state = self.state.lock();
            if state.tx_state == TransactionState::InTransaction {
                return Err(RealmError::invalid_transaction(
                    "the realm is already in a write transaction",
                ));
            }
            if self.read_only {
                return Err(RealmError::invalid_transaction(
                    "cannot perform transactions on a read-only realm",
                ));
            }
            let conn = state.connection(&self.path)?;
            let advanced = conn.has_changed();
            conn.begin_write()?;
            state.tx_state = TransactionState::InTransaction;
            advanced
        };
        debug!(target: "shoal::txn", path = %self.path.display(), advanced, "Began write transaction");

        if advanced {
            self.notifications.send_local(RealmEvent::DidChange);
        }
        Ok(())
    }

    /// Commit the open write transaction
    ///
    /// On success the external notifier runs, then every local listener
    /// receives `DidChangeNotification`. A failed commit leaves the realm
    /// `Idle` with the write discarded and sends nothing.
    pub fn commit_transaction(&self) -> RealmResult<()> {
        self.verify_thread()?;
        let version = {
            let mut state = self.state.lock();
            if state.tx_state != TransactionState::InTransaction {
                return Err(RealmError::invalid_transaction(
                    "cannot commit: no write transaction is open",
                ));
            }
            let result = state.connection(&self.path)?.commit();
            state.tx_state = TransactionState::Idle;
            result?
        };
        debug!(target: "shoal::txn", path = %self.path.display(), version, "Committed write transaction");

        self.notifications.send_external();
        self.notifications.send_local(RealmEvent::DidChange);
        Ok(())
    }

    /// Discard the open write transaction; sends no notification
    pub fn cancel_transaction(&self) -> RealmResult<()> {
        self.verify_thread()?;
        let mut state = self.state.lock();
        if state.tx_state != TransactionState::InTransaction {
            return Err(RealmError::invalid_transaction(
                "cannot cancel: no write transaction is open",
            ));
        }
        let result = state.connection(&self.path)?.rollback();
        state.tx_state = TransactionState::Idle;
        result?;
        debug!(target: "shoal::txn", path = %self.path.display(), "Cancelled write transaction");
        Ok(())
    }

    /// Whether a write transaction is open
    pub fn is_in_transaction(&self) -> bool {
        self.state.lock().tx_state == TransactionState::InTransaction
    }

    /// Move the view to the latest commit
    ///
    /// Returns whether the view changed; if it did, local listeners receive
    /// `RefreshRequiredNotification`.
    ///
    /// # Errors
    ///
    /// `InvalidTransaction` while a write transaction is open.
    pub fn refresh(&self) -> RealmResult<bool> {
        self.verify_thread()?;
        let changed = {
            let mut state = self.state.lock();
            if state.tx_state == TransactionState::InTransaction {
                return Err(RealmError::invalid_transaction(
                    "cannot refresh inside a write transaction",
                ));
            }
            state.connection(&self.path)?.advance_read()?
        };
        if changed {
            debug!(target: "shoal::txn", path = %self.path.display(), "Advanced read view");
            self.notifications.send_local(RealmEvent::RefreshRequired);
        }
        Ok(changed)
    }

    /// React to an external "something changed" signal
    ///
    /// Inside a write transaction this does nothing. With auto-refresh on it
    /// refreshes; otherwise, when newer commits exist, listeners receive
    /// `RefreshRequiredNotification` and the view stays where it is.
    pub fn notify(&self) -> RealmResult<()> {
        self.verify_thread()?;
        let pending = {
            let mut state = self.state.lock();
            if state.tx_state == TransactionState::InTransaction {
                return Ok(());
            }
            if state.auto_refresh {
                None
            } else {
                Some(state.connection(&self.path)?.has_changed())
            }
        };
        match pending {
            None => {
                self.refresh()?;
            }
            Some(true) => self.notifications.send_local(RealmEvent::RefreshRequired),
            Some(false) => {}
        }
        Ok(())
    }

    /// Enable or disable auto-refresh
    pub fn set_auto_refresh(&self, auto_refresh: bool) -> RealmResult<()> {
        self.verify_thread()?;
        self.state.lock().auto_refresh = auto_refresh;
        Ok(())
    }

    /// Whether auto-refresh is enabled
    pub fn auto_refresh(&self) -> bool {
        self.state.lock().auto_refresh
    }
}

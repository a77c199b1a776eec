//! Reference-counted presence tracking per user identity.
//!
//! Each identity entry holds two counters:
//!
//! - `ref_count`: one hold per authenticated connection plus one per
//!   registered listener. The entry exists only while this is non-zero.
//! - `connected_count`: authenticated connections only. The identity is
//!   online while this is non-zero.
//!
//! Listeners are invoked with the online flag after every mutation of
//! `connected_count`, outside the tracker lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error};

/// Presence contract violations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PresenceError {
    /// Decrement of an identity that holds no connection reference.
    #[error("user not found: {user_id}")]
    UserNotFound {
        /// Identity that was decremented.
        user_id: String,
    },
}

/// Callback invoked with `true` when the identity is online.
pub type PresenceListener = Arc<dyn Fn(bool) + Send + Sync>;

#[derive(Default)]
struct IdentityEntry {
    ref_count: usize,
    connected_count: usize,
    listeners: Vec<(u64, PresenceListener)>,
}

impl IdentityEntry {
    fn change(&self) -> PresenceChange {
        PresenceChange {
            online: self.connected_count > 0,
            listeners: self.listeners.iter().map(|(_, l)| l.clone()).collect(),
        }
    }
}

/// A recorded presence mutation whose listeners have not run yet.
#[must_use = "listeners only run when `notify` is called"]
pub struct PresenceChange {
    online: bool,
    listeners: Vec<PresenceListener>,
}

impl PresenceChange {
    /// Online state after the mutation.
    pub fn online(&self) -> bool {
        self.online
    }

    /// Invoke the listeners captured when the change was recorded.
    pub fn notify(self) {
        for listener in &self.listeners {
            listener(self.online);
        }
    }
}

#[derive(Default)]
struct Inner {
    entries: Mutex<HashMap<String, IdentityEntry>>,
    next_listener: AtomicU64,
}

/// Tracks which identities have at least one authenticated connection.
///
/// Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct PresenceTracker {
    inner: Arc<Inner>,
}

impl PresenceTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a newly authenticated connection for `user_id`.
    pub fn connected(&self, user_id: &str) {
        self.record_connected(user_id).notify();
    }

    /// Release one authenticated connection of `user_id`.
    ///
    /// Fails with [`PresenceError::UserNotFound`] when `user_id` holds no
    /// connection reference. That is a caller bug, not a runtime condition;
    /// callers log it at `error`.
    pub fn disconnected(&self, user_id: &str) -> Result<(), PresenceError> {
        self.record_disconnected(user_id).map(PresenceChange::notify)
    }

    /// Like [`PresenceTracker::connected`], but leaves listener delivery to
    /// the caller so it can release its own locks first.
    pub fn record_connected(&self, user_id: &str) -> PresenceChange {
        let mut entries = self.inner.entries.lock();
        let entry = entries.entry(user_id.to_owned()).or_default();
        entry.ref_count += 1;
        entry.connected_count += 1;
        debug!(
            user_id,
            connected = entry.connected_count,
            refs = entry.ref_count,
            "presence connected"
        );
        entry.change()
    }

    /// Like [`PresenceTracker::disconnected`], but leaves listener delivery
    /// to the caller.
    pub fn record_disconnected(&self, user_id: &str) -> Result<PresenceChange, PresenceError> {
        let mut entries = self.inner.entries.lock();
        let Some(entry) = entries
            .get_mut(user_id)
            .filter(|e| e.connected_count > 0)
        else {
            return Err(PresenceError::UserNotFound {
                user_id: user_id.to_owned(),
            });
        };
        entry.ref_count -= 1;
        entry.connected_count -= 1;
        debug!(
            user_id,
            connected = entry.connected_count,
            refs = entry.ref_count,
            "presence disconnected"
        );
        let change = entry.change();
        if entry.ref_count == 0 {
            let _ = entries.remove(user_id);
        }
        Ok(change)
    }

    /// Watch `user_id`'s online state.
    ///
    /// The listener holds a reference on the identity entry until
    /// [`PresenceSubscription::unsubscribe`] is called, and is invoked once
    /// immediately with the current state. Dropping the subscription does not
    /// unsubscribe.
    pub fn add_listener<F>(&self, user_id: &str, listener: F) -> PresenceSubscription
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        let listener: PresenceListener = Arc::new(listener);
        let online = {
            let mut entries = self.inner.entries.lock();
            let entry = entries.entry(user_id.to_owned()).or_default();
            entry.ref_count += 1;
            entry.listeners.push((id, listener.clone()));
            entry.connected_count > 0
        };
        listener(online);
        PresenceSubscription {
            tracker: self.clone(),
            user_id: user_id.to_owned(),
            id,
            active: AtomicBool::new(true),
        }
    }

    /// Whether `user_id` has at least one authenticated connection.
    pub fn is_online(&self, user_id: &str) -> bool {
        self.connected_count(user_id) > 0
    }

    /// Number of authenticated connections for `user_id`.
    pub fn connected_count(&self, user_id: &str) -> usize {
        self.inner
            .entries
            .lock()
            .get(user_id)
            .map_or(0, |e| e.connected_count)
    }

    /// Number of live holds (connections plus listeners) on `user_id`.
    pub fn ref_count(&self, user_id: &str) -> usize {
        self.inner
            .entries
            .lock()
            .get(user_id)
            .map_or(0, |e| e.ref_count)
    }

    /// Number of identity entries currently held.
    pub fn identity_count(&self) -> usize {
        self.inner.entries.lock().len()
    }

    /// Identities that are online, sorted.
    pub fn online_users(&self) -> Vec<String> {
        let mut users: Vec<String> = self
            .inner
            .entries
            .lock()
            .iter()
            .filter(|(_, e)| e.connected_count > 0)
            .map(|(id, _)| id.clone())
            .collect();
        users.sort();
        users
    }

    fn remove_listener(&self, user_id: &str, id: u64) -> bool {
        let mut entries = self.inner.entries.lock();
        let Some(entry) = entries.get_mut(user_id) else {
            error!(user_id, "presence listener removed from unknown user");
            return false;
        };
        let before = entry.listeners.len();
        entry.listeners.retain(|(lid, _)| *lid != id);
        if entry.listeners.len() == before {
            return false;
        }
        entry.ref_count -= 1;
        if entry.ref_count == 0 {
            let _ = entries.remove(user_id);
        }
        true
    }
}

/// Handle returned by [`PresenceTracker::add_listener`].
#[must_use = "the listener stays registered until `unsubscribe` is called"]
pub struct PresenceSubscription {
    tracker: PresenceTracker,
    user_id: String,
    id: u64,
    active: AtomicBool,
}

impl PresenceSubscription {
    /// Identity being watched.
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Remove the listener and release its hold on the identity entry.
    ///
    /// Idempotent; returns `true` only on the call that removed it.
    pub fn unsubscribe(&self) -> bool {
        if !self.active.swap(false, Ordering::AcqRel) {
            return false;
        }
        self.tracker.remove_listener(&self.user_id, self.id)
    }
}

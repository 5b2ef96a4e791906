//! Presence tracking for Parley.
//!
//! A user is online while at least one of their connections is open. The
//! tracker keeps one counter per user and reports the 0→1 and 1→0 transitions
//! through a callback that runs under the user's entry lock, so that the
//! announcements for one user are never reordered.

use dashmap::DashMap;
use parley_protocol::{PresenceStatus, UserId};
use tracing::debug;

/// Per-user active-connection counts.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    counts: DashMap<UserId, usize>,
}

impl PresenceTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new connection for `user_id`.
    ///
    /// `on_transition` is called with [`PresenceStatus::Online`] when this is
    /// the user's first connection. It runs while the user's entry is locked
    /// and must not call back into the tracker.
    ///
    /// Returns the user's connection count after the increment.
    pub fn connect<F>(&self, user_id: UserId, on_transition: F) -> usize
    where
        F: FnOnce(PresenceStatus),
    {
        let mut count = self.counts.entry(user_id).or_insert(0);
        *count += 1;
        if *count == 1 {
            debug!(user = %user_id, "Presence: user online");
            on_transition(PresenceStatus::Online);
        }
        *count
    }

    /// Record a closed connection for `user_id`.
    ///
    /// `on_transition` is called with [`PresenceStatus::Offline`] when the
    /// last connection goes away. Disconnecting a user with no recorded
    /// connections does nothing and returns `None`.
    pub fn disconnect<F>(&self, user_id: UserId, on_transition: F) -> Option<usize>
    where
        F: FnOnce(PresenceStatus),
    {
        let remaining = {
            let mut count = self.counts.get_mut(&user_id)?;
            if *count == 0 {
                return None;
            }
            *count -= 1;
            if *count == 0 {
                debug!(user = %user_id, "Presence: user offline");
                on_transition(PresenceStatus::Offline);
            }
            *count
        };

        if remaining == 0 {
            // A reconnect may have raced in since the lock was dropped.
            self.counts.remove_if(&user_id, |_, count| *count == 0);
        }
        Some(remaining)
    }

    /// Number of open connections for a user.
    #[must_use]
    pub fn connection_count(&self, user_id: UserId) -> usize {
        self.counts.get(&user_id).map(|c| *c).unwrap_or(0)
    }

    #[must_use]
    pub fn status(&self, user_id: UserId) -> PresenceStatus {
        PresenceStatus::from_connections(self.connection_count(user_id))
    }

    #[must_use]
    pub fn is_online(&self, user_id: UserId) -> bool {
        self.status(user_id) == PresenceStatus::Online
    }

    /// Users with at least one open connection.
    #[must_use]
    pub fn online_users(&self) -> Vec<UserId> {
        self.counts
            .iter()
            .filter(|entry| *entry.value() > 0)
            .map(|entry| *entry.key())
            .collect()
    }

    #[must_use]
    pub fn online_count(&self) -> usize {
        self.counts.iter().filter(|entry| *entry.value() > 0).count()
    }
}

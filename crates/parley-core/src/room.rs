//! Room abstraction for Parley.
//!
//! Rooms are broadcast scopes that connections join. A chat room carries the
//! chat's live traffic; a personal room carries events aimed at one user on
//! all of their devices.

use crate::connection::{ConnectionHandle, ConnectionId, DeliveryReport, Outbound};
use parley_protocol::{ChatId, UserId};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, trace, warn};

/// A room identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RoomId {
    /// Every connection of a chat's participants.
    Chat(ChatId),
    /// Every connection of a single user.
    User(UserId),
}

impl RoomId {
    #[must_use]
    pub fn is_chat(&self) -> bool {
        matches!(self, Self::Chat(_))
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Chat(id) => write!(f, "chat:{id}"),
            Self::User(id) => write!(f, "user:{id}"),
        }
    }
}

/// A room and its current members.
#[derive(Debug)]
pub struct Room {
    id: RoomId,
    members: HashMap<ConnectionId, ConnectionHandle>,
}

impl Room {
    /// Create an empty room.
    #[must_use]
    pub fn new(id: RoomId) -> Self {
        Self {
            id,
            members: HashMap::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> RoomId {
        self.id
    }

    #[must_use]
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    #[must_use]
    pub fn is_member(&self, connection_id: &ConnectionId) -> bool {
        self.members.contains_key(connection_id)
    }

    /// Add a connection. Returns `false` if it was already a member.
    pub fn join(&mut self, handle: ConnectionHandle) -> bool {
        let id = handle.id().clone();
        let added = self.members.insert(id.clone(), handle).is_none();
        if added {
            debug!(room = %self.id, connection = %id, "Connection joined room");
        }
        added
    }

    /// Remove a connection. Returns `true` if it was a member.
    pub fn leave(&mut self, connection_id: &ConnectionId) -> bool {
        let removed = self.members.remove(connection_id).is_some();
        if removed {
            debug!(room = %self.id, connection = %connection_id, "Connection left room");
        }
        removed
    }

    /// Queue an event for every member except `exclude`.
    pub fn deliver(&self, event: &Outbound, exclude: Option<&ConnectionId>) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        for (id, handle) in &self.members {
            if exclude == Some(id) {
                continue;
            }
            let result = handle.try_deliver(event);
            if let Err(e) = result {
                warn!(
                    room = %self.id,
                    connection = %id,
                    event = event.name(),
                    error = %e,
                    "Dropped delivery"
                );
            }
            report.record(result);
        }
        trace!(room = %self.id, delivered = report.delivered, "Delivered event");
        report
    }

    /// Handles of all members.
    pub fn members(&self) -> impl Iterator<Item = &ConnectionHandle> {
        self.members.values()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

//! Room broadcast router for Parley.
//!
//! The router owns the room table and the connection registry. Each room
//! entry is locked individually (sharded map), so joins, leaves and
//! broadcasts on different rooms never contend. When both maps are touched
//! the connection entry is always locked before the room entry.

use crate::connection::{ConnectionHandle, ConnectionId, DeliveryReport, Outbound};
use crate::room::{Room, RoomId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parley_protocol::ServerEvent;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Router errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouterError {
    /// The connection was never registered or has been released.
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    /// Connection ID registered twice.
    #[error("Connection already registered: {0}")]
    AlreadyRegistered(ConnectionId),

    /// Not a member of the room.
    #[error("Not joined to room: {0}")]
    NotJoined(RoomId),

    /// Maximum rooms per connection reached.
    #[error("Maximum rooms per connection reached")]
    MaxRoomsPerConnection,

    /// Maximum number of rooms reached.
    #[error("Maximum number of rooms reached")]
    MaxRooms,
}

/// Router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Maximum number of rooms.
    pub max_rooms: usize,
    /// Maximum rooms a single connection may join.
    pub max_rooms_per_connection: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_rooms: 100_000,
            max_rooms_per_connection: 1_000,
        }
    }
}

/// A registered connection and the rooms it has joined.
struct Membership {
    handle: ConnectionHandle,
    rooms: HashSet<RoomId>,
}

/// The central room router.
pub struct RoomRouter {
    /// Rooms indexed by id. Empty rooms are removed.
    rooms: DashMap<RoomId, Room>,
    /// Registered connections and their room sets.
    connections: DashMap<ConnectionId, Membership>,
    config: RouterConfig,
}

impl RoomRouter {
    /// Create a new router with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RouterConfig::default())
    }

    /// Create a new router with custom configuration.
    #[must_use]
    pub fn with_config(config: RouterConfig) -> Self {
        info!("Creating router with config: {:?}", config);
        Self {
            rooms: DashMap::new(),
            connections: DashMap::new(),
            config,
        }
    }

    /// Get router statistics.
    #[must_use]
    pub fn stats(&self) -> RouterStats {
        RouterStats {
            room_count: self.rooms.len(),
            connection_count: self.connections.len(),
            total_memberships: self.connections.iter().map(|c| c.rooms.len()).sum(),
        }
    }

    /// Register a connection so it can join rooms and receive global events.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection ID is already registered.
    pub fn register(&self, handle: ConnectionHandle) -> Result<(), RouterError> {
        let id = handle.id().clone();
        match self.connections.entry(id.clone()) {
            Entry::Occupied(_) => Err(RouterError::AlreadyRegistered(id)),
            Entry::Vacant(slot) => {
                slot.insert(Membership {
                    handle,
                    rooms: HashSet::new(),
                });
                debug!(connection = %id, "Registered connection");
                Ok(())
            }
        }
    }

    #[must_use]
    pub fn is_registered(&self, connection_id: &ConnectionId) -> bool {
        self.connections.contains_key(connection_id)
    }

    /// Join a registered connection to a room, creating the room on demand.
    ///
    /// Returns `false` if the connection was already a member.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is unknown or limits are exceeded.
    pub fn join(&self, connection_id: &ConnectionId, room: RoomId) -> Result<bool, RouterError> {
        let mut membership = self
            .connections
            .get_mut(connection_id)
            .ok_or_else(|| RouterError::UnknownConnection(connection_id.clone()))?;

        if membership.rooms.contains(&room) {
            return Ok(false);
        }
        if membership.rooms.len() >= self.config.max_rooms_per_connection {
            return Err(RouterError::MaxRoomsPerConnection);
        }
        if !self.rooms.contains_key(&room) && self.rooms.len() >= self.config.max_rooms {
            return Err(RouterError::MaxRooms);
        }

        let mut entry = self.rooms.entry(room).or_insert_with(|| {
            debug!(room = %room, "Creating new room");
            Room::new(room)
        });
        entry.join(membership.handle.clone());
        membership.rooms.insert(room);

        debug!(
            room = %room,
            connection = %connection_id,
            members = entry.member_count(),
            "Joined"
        );

        Ok(true)
    }

    /// Remove a connection from one room.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is not in the room.
    pub fn leave(&self, connection_id: &ConnectionId, room: RoomId) -> Result<(), RouterError> {
        let mut membership = self
            .connections
            .get_mut(connection_id)
            .ok_or_else(|| RouterError::UnknownConnection(connection_id.clone()))?;

        if !membership.rooms.remove(&room) {
            return Err(RouterError::NotJoined(room));
        }
        self.remove_member(room, connection_id);
        Ok(())
    }

    /// Deregister a connection and leave every room it joined.
    ///
    /// Returns the rooms that were left, or `None` if the connection was not
    /// registered. Calling this again for the same connection is a no-op.
    pub fn release(&self, connection_id: &ConnectionId) -> Option<Vec<RoomId>> {
        let (_, membership) = self.connections.remove(connection_id)?;

        let rooms: Vec<RoomId> = membership.rooms.into_iter().collect();
        for room in &rooms {
            self.remove_member(*room, connection_id);
        }

        debug!(connection = %connection_id, rooms = rooms.len(), "Released connection");
        Some(rooms)
    }

    fn remove_member(&self, room: RoomId, connection_id: &ConnectionId) {
        if let Some(mut entry) = self.rooms.get_mut(&room) {
            entry.leave(connection_id);
        }
        // Atomic with respect to a concurrent join on the same room.
        if self
            .rooms
            .remove_if(&room, |_, entry| entry.is_empty())
            .is_some()
        {
            debug!(room = %room, "Deleted empty room");
        }
    }

    /// Deliver an event to every member of a room except `exclude`.
    pub fn broadcast(
        &self,
        room: RoomId,
        event: ServerEvent,
        exclude: Option<&ConnectionId>,
    ) -> DeliveryReport {
        let event: Outbound = Arc::new(event);
        match self.rooms.get(&room) {
            Some(entry) => entry.deliver(&event, exclude),
            None => {
                trace!(room = %room, "Broadcast to empty room");
                DeliveryReport::default()
            }
        }
    }

    /// Deliver an event once to every connection that is a member of at least
    /// one of `rooms`, except `exclude`.
    pub fn broadcast_many(
        &self,
        rooms: &[RoomId],
        event: ServerEvent,
        exclude: Option<&ConnectionId>,
    ) -> DeliveryReport {
        let event: Outbound = Arc::new(event);
        let mut targets: HashMap<ConnectionId, ConnectionHandle> = HashMap::new();
        for room in rooms {
            if let Some(entry) = self.rooms.get(room) {
                for handle in entry.members() {
                    targets
                        .entry(handle.id().clone())
                        .or_insert_with(|| handle.clone());
                }
            }
        }

        let mut report = DeliveryReport::default();
        for (id, handle) in &targets {
            if exclude != Some(id) {
                deliver_to(handle, &event, &mut report);
            }
        }
        report
    }

    /// Deliver an event to every registered connection except `exclude`.
    pub fn broadcast_all(&self, event: ServerEvent, exclude: Option<&ConnectionId>) -> DeliveryReport {
        let event: Outbound = Arc::new(event);
        let mut report = DeliveryReport::default();
        for entry in self.connections.iter() {
            if exclude != Some(entry.key()) {
                deliver_to(&entry.handle, &event, &mut report);
            }
        }
        report
    }

    /// Whether a connection has joined a room.
    #[must_use]
    pub fn is_member(&self, connection_id: &ConnectionId, room: RoomId) -> bool {
        self.connections
            .get(connection_id)
            .is_some_and(|m| m.rooms.contains(&room))
    }

    /// Number of connections in a room.
    #[must_use]
    pub fn member_count(&self, room: RoomId) -> usize {
        self.rooms.get(&room).map(|e| e.member_count()).unwrap_or(0)
    }

    #[must_use]
    pub fn room_exists(&self, room: RoomId) -> bool {
        self.rooms.contains_key(&room)
    }

    /// Rooms a connection has joined.
    #[must_use]
    pub fn connection_rooms(&self, connection_id: &ConnectionId) -> Vec<RoomId> {
        self.connections
            .get(connection_id)
            .map(|m| m.rooms.iter().copied().collect())
            .unwrap_or_default()
    }
}

impl Default for RoomRouter {
    fn default() -> Self {
        Self::new()
    }
}

/// Router statistics.
#[derive(Debug, Clone)]
pub struct RouterStats {
    /// Number of active rooms.
    pub room_count: usize,
    /// Number of registered connections.
    pub connection_count: usize,
    /// Total number of room memberships.
    pub total_memberships: usize,
}

fn deliver_to(handle: &ConnectionHandle, event: &Outbound, report: &mut DeliveryReport) {
    let result = handle.try_deliver(event);
    if let Err(e) = result {
        warn!(
            connection = %handle.id(),
            event = event.name(),
            error = %e,
            "Dropped delivery"
        );
    }
    report.record(result);
}

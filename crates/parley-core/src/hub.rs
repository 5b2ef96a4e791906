//! The connection hub.
//!
//! [`Hub`] ties the [`RoomRouter`] and the [`PresenceTracker`] together. It
//! admits authenticated connections into their rooms, announces presence
//! transitions and releases everything a connection held when it closes.

use crate::connection::{ConnectionHandle, ConnectionId, DeliveryReport, Outbound};
use crate::presence::PresenceTracker;
use crate::room::RoomId;
use crate::router::{RoomRouter, RouterConfig, RouterError, RouterStats};
use parley_protocol::{ChatId, PresenceStatus, ServerEvent, UserId};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Who hears about a user's online/offline transitions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceScope {
    /// Every connected client.
    #[default]
    Global,
    /// Only connections that share a chat room with the user.
    SharedChats,
}

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub router: RouterConfig,
    /// Maximum concurrently admitted connections.
    pub max_connections: usize,
    /// Capacity of each connection's outbound queue.
    pub outbound_buffer: usize,
    pub presence_scope: PresenceScope,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            router: RouterConfig::default(),
            max_connections: 100_000,
            outbound_buffer: 256,
            presence_scope: PresenceScope::Global,
        }
    }
}

/// Hub errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HubError {
    /// The connection cap is reached.
    #[error("Server is at connection capacity")]
    Overloaded,

    /// The connection has not joined the chat's room.
    #[error("Not joined to chat {0}")]
    NotJoined(ChatId),

    #[error(transparent)]
    Router(#[from] RouterError),
}

/// An admitted connection: its handle and the queue its writer drains.
#[derive(Debug)]
pub struct Session {
    pub handle: ConnectionHandle,
    pub outbound: mpsc::Receiver<Outbound>,
    /// Fan-out of the online announcement, empty unless this was the user's
    /// first connection.
    pub announced: DeliveryReport,
}

/// In-process connection registry, room router and presence tracker.
pub struct Hub {
    router: RoomRouter,
    presence: PresenceTracker,
    admitted: AtomicUsize,
    config: HubConfig,
}

impl Hub {
    #[must_use]
    pub fn new(config: HubConfig) -> Self {
        info!(
            max_connections = config.max_connections,
            scope = ?config.presence_scope,
            "Creating hub"
        );
        Self {
            router: RoomRouter::with_config(config.router.clone()),
            presence: PresenceTracker::new(),
            admitted: AtomicUsize::new(0),
            config,
        }
    }

    #[must_use]
    pub fn router(&self) -> &RoomRouter {
        &self.router
    }

    #[must_use]
    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    #[must_use]
    pub fn status(&self, user_id: UserId) -> PresenceStatus {
        self.presence.status(user_id)
    }

    /// Number of admitted connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.admitted.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn stats(&self) -> RouterStats {
        self.router.stats()
    }

    /// Admit an authenticated connection.
    ///
    /// Joins the user's personal room and one room per chat in `chat_ids`,
    /// then records the connection with the presence tracker, announcing the
    /// user online if this is their first connection.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Overloaded`] at the connection cap, or a router
    /// error if a room limit is exceeded.
    pub fn admit(&self, user_id: UserId, chat_ids: &[ChatId]) -> Result<Session, HubError> {
        let previous = self.admitted.fetch_add(1, Ordering::AcqRel);
        if previous >= self.config.max_connections {
            self.admitted.fetch_sub(1, Ordering::AcqRel);
            warn!(user = %user_id, "Refusing connection: at capacity");
            return Err(HubError::Overloaded);
        }

        let (handle, outbound) = ConnectionHandle::new(
            ConnectionId::generate(),
            user_id,
            self.config.outbound_buffer,
        );
        let id = handle.id().clone();

        if let Err(e) = self.join_rooms(&handle, chat_ids) {
            self.router.release(&id);
            self.admitted.fetch_sub(1, Ordering::AcqRel);
            return Err(e);
        }

        let rooms: Vec<RoomId> = chat_ids.iter().map(|c| RoomId::Chat(*c)).collect();
        let mut announced = DeliveryReport::default();
        self.presence.connect(user_id, |status| {
            announced = self.announce(user_id, status, &rooms, Some(&id));
        });

        debug!(connection = %id, user = %user_id, chats = chat_ids.len(), "Admitted connection");
        Ok(Session {
            handle,
            outbound,
            announced,
        })
    }

    fn join_rooms(&self, handle: &ConnectionHandle, chat_ids: &[ChatId]) -> Result<(), HubError> {
        self.router.register(handle.clone())?;
        self.router.join(handle.id(), RoomId::User(handle.user_id()))?;
        for chat_id in chat_ids {
            self.router.join(handle.id(), RoomId::Chat(*chat_id))?;
        }
        Ok(())
    }

    /// Release a connection: leave every room and record the disconnect,
    /// announcing the user offline if this was their last connection.
    ///
    /// Returns the fan-out of the offline announcement, or `None` if the
    /// connection was already released.
    pub fn release(&self, handle: &ConnectionHandle) -> Option<DeliveryReport> {
        let rooms = self.router.release(handle.id())?;
        self.admitted.fetch_sub(1, Ordering::AcqRel);

        let user_id = handle.user_id();
        let mut announced = DeliveryReport::default();
        self.presence.disconnect(user_id, |status| {
            announced = self.announce(user_id, status, &rooms, None);
        });

        debug!(connection = %handle.id(), user = %user_id, "Released connection");
        Some(announced)
    }

    fn announce(
        &self,
        user_id: UserId,
        status: PresenceStatus,
        rooms: &[RoomId],
        exclude: Option<&ConnectionId>,
    ) -> DeliveryReport {
        let event = ServerEvent::status(user_id, status);
        match self.config.presence_scope {
            PresenceScope::Global => self.router.broadcast_all(event, exclude),
            PresenceScope::SharedChats => {
                let chats: Vec<RoomId> = rooms.iter().copied().filter(RoomId::is_chat).collect();
                self.router.broadcast_many(&chats, event, exclude)
            }
        }
    }

    /// Join a connection to a chat room after admission.
    ///
    /// Returns `false` if it was already joined.
    ///
    /// # Errors
    ///
    /// Returns a router error for unknown connections or exceeded limits.
    pub fn join_chat(&self, connection_id: &ConnectionId, chat_id: ChatId) -> Result<bool, HubError> {
        Ok(self.router.join(connection_id, RoomId::Chat(chat_id))?)
    }

    /// Relay a typing indicator to the rest of the chat room.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::NotJoined`] if the connection is not in the room.
    pub fn typing(
        &self,
        handle: &ConnectionHandle,
        chat_id: ChatId,
        is_typing: bool,
    ) -> Result<DeliveryReport, HubError> {
        let room = RoomId::Chat(chat_id);
        if !self.router.is_member(handle.id(), room) {
            return Err(HubError::NotJoined(chat_id));
        }
        let event = ServerEvent::TypingUpdate {
            chat_id,
            user_id: handle.user_id(),
            is_typing,
        };
        Ok(self.router.broadcast(room, event, Some(handle.id())))
    }

    /// Broadcast to a chat room.
    pub fn broadcast_to_chat(
        &self,
        chat_id: ChatId,
        event: ServerEvent,
        exclude: Option<&ConnectionId>,
    ) -> DeliveryReport {
        self.router.broadcast(RoomId::Chat(chat_id), event, exclude)
    }

    /// Send to every connection of one user.
    pub fn send_to_user(&self, user_id: UserId, event: ServerEvent) -> DeliveryReport {
        self.router.broadcast(RoomId::User(user_id), event, None)
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(HubConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn drain(session: &mut Session) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = session.outbound.try_recv() {
            events.push((*event).clone());
        }
        events
    }

    #[test]
    fn test_admit_joins_personal_and_chat_rooms() {
        let hub = Hub::default();
        let user = Uuid::new_v4();
        let chats = [Uuid::new_v4(), Uuid::new_v4()];

        let session = hub.admit(user, &chats).unwrap();
        let id = session.handle.id();

        assert!(hub.router().is_member(id, RoomId::User(user)));
        assert!(hub.router().is_member(id, RoomId::Chat(chats[0])));
        assert!(hub.router().is_member(id, RoomId::Chat(chats[1])));
        assert_eq!(hub.status(user), PresenceStatus::Online);
        assert_eq!(hub.connection_count(), 1);
    }

    #[test]
    fn test_online_announced_once_and_not_to_self() {
        let hub = Hub::default();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        let mut bob_session = hub.admit(bob, &[]).unwrap();
        let mut alice_phone = hub.admit(alice, &[]).unwrap();
        let _alice_laptop = hub.admit(alice, &[]).unwrap();

        assert_eq!(
            drain(&mut bob_session),
            vec![ServerEvent::status(alice, PresenceStatus::Online)]
        );
        assert!(drain(&mut alice_phone).is_empty());
    }

    #[test]
    fn test_release_announces_offline_on_last_connection() {
        let hub = Hub::default();
        let alice = Uuid::new_v4();
        let mut bob = hub.admit(Uuid::new_v4(), &[]).unwrap();
        let phone = hub.admit(alice, &[]).unwrap();
        let laptop = hub.admit(alice, &[]).unwrap();
        drain(&mut bob);

        assert!(hub.release(&phone.handle).is_some());
        assert!(drain(&mut bob).is_empty());
        assert_eq!(hub.status(alice), PresenceStatus::Online);

        assert!(hub.release(&laptop.handle).is_some());
        assert!(hub.release(&laptop.handle).is_none());
        assert_eq!(
            drain(&mut bob),
            vec![ServerEvent::status(alice, PresenceStatus::Offline)]
        );
        assert_eq!(hub.status(alice), PresenceStatus::Offline);
        assert_eq!(hub.connection_count(), 1);
    }

    #[test]
    fn test_shared_chats_scope() {
        let hub = Hub::new(HubConfig {
            presence_scope: PresenceScope::SharedChats,
            ..HubConfig::default()
        });
        let chat = Uuid::new_v4();
        let mut peer = hub.admit(Uuid::new_v4(), &[chat]).unwrap();
        let mut stranger = hub.admit(Uuid::new_v4(), &[]).unwrap();
        drain(&mut peer);

        let alice = Uuid::new_v4();
        let _session = hub.admit(alice, &[chat]).unwrap();

        assert_eq!(
            drain(&mut peer),
            vec![ServerEvent::status(alice, PresenceStatus::Online)]
        );
        assert!(drain(&mut stranger).is_empty());
    }

    #[test]
    fn test_typing_requires_membership() {
        let hub = Hub::default();
        let chat = Uuid::new_v4();
        let sender = hub.admit(Uuid::new_v4(), &[chat]).unwrap();
        let mut peer = hub.admit(Uuid::new_v4(), &[chat]).unwrap();
        drain(&mut peer);

        let report = hub.typing(&sender.handle, chat, true).unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(
            drain(&mut peer),
            vec![ServerEvent::TypingUpdate {
                chat_id: chat,
                user_id: sender.handle.user_id(),
                is_typing: true,
            }]
        );

        let other = Uuid::new_v4();
        assert_eq!(
            hub.typing(&sender.handle, other, true),
            Err(HubError::NotJoined(other))
        );
        hub.join_chat(sender.handle.id(), other).unwrap();
        assert!(hub.typing(&sender.handle, other, false).is_ok());
    }

    #[test]
    fn test_connection_cap() {
        let hub = Hub::new(HubConfig {
            max_connections: 1,
            ..HubConfig::default()
        });
        let first = hub.admit(Uuid::new_v4(), &[]).unwrap();
        assert_eq!(hub.admit(Uuid::new_v4(), &[]).unwrap_err(), HubError::Overloaded);

        hub.release(&first.handle);
        assert!(hub.admit(Uuid::new_v4(), &[]).is_ok());
    }

    #[test]
    fn test_full_queues_are_reported_as_dropped() {
        let hub = Hub::new(HubConfig {
            outbound_buffer: 1,
            ..HubConfig::default()
        });
        let chat = Uuid::new_v4();

        let bob = hub.admit(Uuid::new_v4(), &[chat]).unwrap();
        assert_eq!(bob.announced, DeliveryReport::default());

        // Bob's single slot is taken by Alice's online announcement.
        let alice = hub.admit(Uuid::new_v4(), &[chat]).unwrap();
        assert_eq!(alice.announced.delivered, 1);

        let typing = hub.typing(&alice.handle, chat, true).unwrap();
        assert_eq!(typing, DeliveryReport { delivered: 0, dropped: 1 });

        let carol = hub.admit(Uuid::new_v4(), &[]).unwrap();
        assert_eq!(carol.announced, DeliveryReport { delivered: 1, dropped: 1 });

        let released = hub.release(&carol.handle).unwrap();
        assert_eq!(released, DeliveryReport { delivered: 0, dropped: 2 });
    }

    #[test]
    fn test_send_to_user_reaches_all_devices() {
        let hub = Hub::default();
        let user = Uuid::new_v4();
        let mut phone = hub.admit(user, &[]).unwrap();
        let mut laptop = hub.admit(user, &[]).unwrap();

        let report = hub.send_to_user(user, ServerEvent::RoomJoined { chat_id: Uuid::nil() });
        assert_eq!(report.delivered, 2);
        assert_eq!(drain(&mut phone).len(), 1);
        assert_eq!(drain(&mut laptop).len(), 1);
    }
}

//! Fixtures shared by the Parley benchmarks.

use parley_core::{ConnectionHandle, ConnectionId, Outbound, RoomId, RoomRouter, RouterConfig};
use parley_protocol::{ServerEvent, UserId};
use tokio::sync::mpsc::Receiver;
use uuid::Uuid;

/// Outbound queue size used by benchmark connections.
pub const QUEUE: usize = 1024;

/// A router with `members` connections joined to `room`.
pub fn router_with_room(members: usize, room: RoomId) -> (RoomRouter, Vec<Receiver<Outbound>>) {
    let router = RoomRouter::with_config(RouterConfig {
        max_rooms: usize::MAX,
        max_rooms_per_connection: usize::MAX,
    });
    let receivers = (0..members)
        .map(|i| {
            let (handle, rx) = connection(i, Uuid::new_v4());
            let id = handle.id().clone();
            router.register(handle).expect("fresh connection id");
            router.join(&id, room).expect("room limits disabled");
            rx
        })
        .collect();
    (router, receivers)
}

/// A connection handle named `conn-<n>`.
pub fn connection(n: usize, user: UserId) -> (ConnectionHandle, Receiver<Outbound>) {
    ConnectionHandle::new(ConnectionId::new(format!("conn-{n}")), user, QUEUE)
}

/// A typing update, the smallest event a room carries.
pub fn typing_event(chat: Uuid) -> ServerEvent {
    ServerEvent::TypingUpdate {
        chat_id: chat,
        user_id: Uuid::nil(),
        is_typing: true,
    }
}

/// Empty every queue.
pub fn drain(receivers: &mut [Receiver<Outbound>]) {
    for rx in receivers {
        while rx.try_recv().is_ok() {}
    }
}

//! Live-channel events.
//!
//! Every frame is an adjacently tagged object, `{"event": "...", "data": {...}}`,
//! with camelCase field names.

use crate::model::{Attachment, Chat, ChatId, Message, PresenceStatus, UserId};
use serde::{Deserialize, Serialize};

/// Request identifier echoed back in acknowledgments and errors.
pub type AckId = u64;

/// Message payload submitted by a client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDraft {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
}

/// Longest accepted message text, in bytes.
pub const MAX_CONTENT_LEN: usize = 16 * 1024;

impl MessageDraft {
    /// Draft with text only.
    #[must_use]
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            attachment: None,
        }
    }

    /// Whether the text part is within [`MAX_CONTENT_LEN`].
    #[must_use]
    pub fn content_fits(&self) -> bool {
        self.content
            .as_ref()
            .map_or(true, |content| content.len() <= MAX_CONTENT_LEN)
    }
}

/// Event names, as they appear on the wire.
pub mod names {
    pub const MESSAGE_SEND: &str = "message:send";
    pub const MESSAGE_RECEIVE: &str = "message:receive";
    pub const MESSAGE_SENT: &str = "message:sent";
    pub const TYPING_START: &str = "typing:start";
    pub const TYPING_STOP: &str = "typing:stop";
    pub const TYPING_UPDATE: &str = "typing:update";
    pub const USER_STATUS: &str = "user:status";
    pub const ROOM_JOIN: &str = "room:join";
    pub const ROOM_JOINED: &str = "room:joined";
    pub const CHAT_CREATED: &str = "chat:created";
}

/// Events sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    /// Present a bearer token when the handshake did not carry one.
    #[serde(rename = "auth")]
    Authenticate { token: String },

    /// Send a message to a chat.
    #[serde(rename = "message:send")]
    MessageSend {
        chat_id: ChatId,
        message: MessageDraft,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ack: Option<AckId>,
    },

    #[serde(rename = "typing:start")]
    TypingStart { chat_id: ChatId },

    #[serde(rename = "typing:stop")]
    TypingStop { chat_id: ChatId },

    /// Join the room of a chat created after this connection was admitted.
    #[serde(rename = "room:join")]
    RoomJoin { chat_id: ChatId },

    #[serde(rename = "ping")]
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

/// Events sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    /// Handshake completed.
    #[serde(rename = "connected")]
    Connected {
        connection_id: String,
        user_id: UserId,
        version: String,
        heartbeat_ms: u64,
    },

    /// A message was persisted in a chat this connection belongs to.
    #[serde(rename = "message:receive")]
    MessageReceive { chat_id: ChatId, message: Message },

    /// Acknowledges the sender's own `message:send`.
    #[serde(rename = "message:sent")]
    MessageSent {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ack: Option<AckId>,
        message: Message,
    },

    #[serde(rename = "typing:update")]
    TypingUpdate {
        chat_id: ChatId,
        user_id: UserId,
        is_typing: bool,
    },

    #[serde(rename = "user:status")]
    UserStatus {
        user_id: UserId,
        status: PresenceStatus,
    },

    /// A chat including this user was created.
    #[serde(rename = "chat:created")]
    ChatCreated { chat: Chat },

    #[serde(rename = "room:joined")]
    RoomJoined { chat_id: ChatId },

    /// Failure of a request from this connection.
    #[serde(rename = "error")]
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ack: Option<AckId>,
        code: u16,
        message: String,
    },

    #[serde(rename = "pong")]
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl ServerEvent {
    /// Wire name of this event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::MessageReceive { .. } => names::MESSAGE_RECEIVE,
            Self::MessageSent { .. } => names::MESSAGE_SENT,
            Self::TypingUpdate { .. } => names::TYPING_UPDATE,
            Self::UserStatus { .. } => names::USER_STATUS,
            Self::ChatCreated { .. } => names::CHAT_CREATED,
            Self::RoomJoined { .. } => names::ROOM_JOINED,
            Self::Error { .. } => "error",
            Self::Pong { .. } => "pong",
        }
    }

    /// Create an error event.
    #[must_use]
    pub fn error(ack: Option<AckId>, code: u16, message: impl Into<String>) -> Self {
        Self::Error {
            ack,
            code,
            message: message.into(),
        }
    }

    /// Create a status event.
    #[must_use]
    pub fn status(user_id: UserId, status: PresenceStatus) -> Self {
        Self::UserStatus { user_id, status }
    }
}

impl ClientEvent {
    /// Wire name of this event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Authenticate { .. } => "auth",
            Self::MessageSend { .. } => names::MESSAGE_SEND,
            Self::TypingStart { .. } => names::TYPING_START,
            Self::TypingStop { .. } => names::TYPING_STOP,
            Self::RoomJoin { .. } => names::ROOM_JOIN,
            Self::Ping { .. } => "ping",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn test_draft_content_limit() {
        assert!(MessageDraft::default().content_fits());
        assert!(MessageDraft::text("a".repeat(MAX_CONTENT_LEN)).content_fits());
        assert!(!MessageDraft::text("a".repeat(MAX_CONTENT_LEN + 1)).content_fits());
    }

    #[test]
    fn test_parse_message_send() {
        let chat_id = Uuid::new_v4();
        let raw = json!({
            "event": "message:send",
            "data": {"chatId": chat_id, "message": {"content": "hi"}, "ack": 7}
        });

        let event: ClientEvent = serde_json::from_value(raw).unwrap();
        assert_eq!(
            event,
            ClientEvent::MessageSend {
                chat_id,
                message: MessageDraft::text("hi"),
                ack: Some(7),
            }
        );
        assert_eq!(event.name(), names::MESSAGE_SEND);
    }

    #[test]
    fn test_parse_typing_without_optional_fields() {
        let chat_id = Uuid::new_v4();
        let raw = json!({"event": "typing:stop", "data": {"chatId": chat_id}});
        let event: ClientEvent = serde_json::from_value(raw).unwrap();
        assert_eq!(event, ClientEvent::TypingStop { chat_id });
    }

    #[test]
    fn test_typing_update_field_names() {
        let chat_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();
        let event = ServerEvent::TypingUpdate {
            chat_id,
            user_id,
            is_typing: true,
        };

        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({
                "event": "typing:update",
                "data": {"chatId": chat_id, "userId": user_id, "isTyping": true}
            })
        );
    }

    #[test]
    fn test_status_event_shape() {
        let user_id = Uuid::new_v4();
        let event = ServerEvent::status(user_id, PresenceStatus::Offline);
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"event": "user:status", "data": {"userId": user_id, "status": "offline"}})
        );
    }

    #[test]
    fn test_unknown_event_rejected() {
        let raw = json!({"event": "message:edit", "data": {}});
        assert!(serde_json::from_value::<ClientEvent>(raw).is_err());
    }
}

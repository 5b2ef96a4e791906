//! Domain model shared by the store, the realtime core and the wire.
//!
//! Conditionally-required fields are expressed as variants: a group chat
//! always has a name ([`ChatKind::Group`]) and an attachment message always
//! has its file reference ([`MessageBody::Attachment`]).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// User identifier.
pub type UserId = Uuid;
/// Chat identifier.
pub type ChatId = Uuid;
/// Message identifier.
pub type MessageId = Uuid;

/// Derived online/offline status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

impl PresenceStatus {
    /// Status for a given number of active connections.
    #[must_use]
    pub fn from_connections(count: usize) -> Self {
        if count > 0 {
            Self::Online
        } else {
            Self::Offline
        }
    }
}

/// A registered user as returned to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    pub status: PresenceStatus,
    pub created_at: DateTime<Utc>,
}

/// The public subset of a user embedded in chats and messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub id: UserId,
    pub name: String,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

/// Private or group conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChatKind {
    /// Exactly two participants, fixed at creation.
    Private,
    /// Named conversation with two or more participants.
    Group {
        name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        avatar: Option<String>,
    },
}

impl ChatKind {
    #[must_use]
    pub fn is_private(&self) -> bool {
        matches!(self, Self::Private)
    }
}

/// A conversation with its participants and most recent message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: ChatId,
    #[serde(flatten)]
    pub kind: ChatKind,
    pub participants: Vec<UserSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message: Option<Box<Message>>,
    pub message_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Chat {
    /// Whether `user` is one of this chat's participants.
    #[must_use]
    pub fn has_participant(&self, user: UserId) -> bool {
        self.participants.iter().any(|p| p.id == user)
    }
}

/// Kind of uploaded file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Image,
    Video,
    File,
}

impl AttachmentKind {
    /// Classify a MIME type.
    #[must_use]
    pub fn from_mime(mime: &str) -> Self {
        if mime.starts_with("image/") {
            Self::Image
        } else if mime.starts_with("video/") {
            Self::Video
        } else {
            Self::File
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::File => "file",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "image" => Some(Self::Image),
            "video" => Some(Self::Video),
            "file" => Some(Self::File),
            _ => None,
        }
    }
}

/// Reference to a file held by the blob store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub kind: AttachmentKind,
    pub url: String,
    pub name: String,
    pub size: u64,
    pub mime_type: String,
}

/// Message content. A message always carries text, a file, or both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MessageBody {
    Text {
        content: String,
    },
    Attachment {
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        attachment: Attachment,
    },
}

/// Returned when a message would have neither content nor attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmptyMessage;

impl std::fmt::Display for EmptyMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Message must contain either text or a file")
    }
}

impl std::error::Error for EmptyMessage {}

impl MessageBody {
    /// Build a body from optional parts.
    ///
    /// Whitespace-only content counts as absent.
    ///
    /// # Errors
    ///
    /// Returns [`EmptyMessage`] if both parts are absent.
    pub fn from_parts(
        content: Option<String>,
        attachment: Option<Attachment>,
    ) -> Result<Self, EmptyMessage> {
        let content = content.filter(|c| !c.trim().is_empty());
        match (content, attachment) {
            (content, Some(attachment)) => Ok(Self::Attachment {
                content,
                attachment,
            }),
            (Some(content), None) => Ok(Self::Text { content }),
            (None, None) => Err(EmptyMessage),
        }
    }

    /// Text part, if any.
    #[must_use]
    pub fn content(&self) -> Option<&str> {
        match self {
            Self::Text { content } => Some(content),
            Self::Attachment { content, .. } => content.as_deref(),
        }
    }

    /// File part, if any.
    #[must_use]
    pub fn attachment(&self) -> Option<&Attachment> {
        match self {
            Self::Text { .. } => None,
            Self::Attachment { attachment, .. } => Some(attachment),
        }
    }
}

/// A persisted chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub sender: UserSummary,
    #[serde(flatten)]
    pub body: MessageBody,
    pub read_by: Vec<UserId>,
    pub created_at: DateTime<Utc>,
}

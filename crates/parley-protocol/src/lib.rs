//! # parley-protocol
//!
//! Domain model and live-channel wire protocol for the Parley chat server.
//!
//! - [`model`] - users, chats, messages and attachments
//! - [`events`] - client and server events exchanged over the live channel
//! - [`codec`] - JSON (text frames) and MessagePack (binary frames)
//! - [`version`] - protocol version negotiation
//!
//! ## Example
//!
//! ```rust
//! use parley_protocol::{codec, ClientEvent, Encoding, MessageDraft};
//! use uuid::Uuid;
//!
//! let event = ClientEvent::MessageSend {
//!     chat_id: Uuid::new_v4(),
//!     message: MessageDraft::text("Hello, world!"),
//!     ack: Some(1),
//! };
//!
//! let frame = codec::encode(&event, Encoding::Json).unwrap();
//! ```

pub mod codec;
pub mod events;
pub mod model;
pub mod version;

pub use codec::{Encoding, ProtocolError, WireFrame};
pub use events::{AckId, ClientEvent, MessageDraft, ServerEvent, MAX_CONTENT_LEN};
pub use model::{
    Attachment, AttachmentKind, Chat, ChatId, ChatKind, EmptyMessage, Message, MessageBody,
    MessageId, PresenceStatus, User, UserId, UserSummary,
};
pub use version::{Version, PROTOCOL_VERSION};

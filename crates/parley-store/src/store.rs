//! The persistence interface.

use crate::error::StoreResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parley_protocol::{
    Chat, ChatId, Message, MessageBody, MessageId, PresenceStatus, User, UserId, UserSummary,
};

/// Default page size for message history.
pub const DEFAULT_PAGE_SIZE: u32 = 50;
/// Largest page size a caller may ask for.
pub const MAX_PAGE_SIZE: u32 = 100;

/// Input for [`ChatStore::create_user`]. The password is already hashed.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub name: String,
    pub email: String,
    pub password_hash: String,
    pub avatar: Option<String>,
}

/// A stored user, including the credential hash.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub summary: UserSummary,
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

impl UserRecord {
    #[must_use]
    pub fn id(&self) -> UserId {
        self.summary.id
    }

    /// Client view of this user with the given presence status.
    #[must_use]
    pub fn to_user(&self, status: PresenceStatus) -> User {
        User {
            id: self.summary.id,
            name: self.summary.name.clone(),
            email: self.summary.email.clone(),
            avatar: self.summary.avatar.clone(),
            status,
            created_at: self.created_at,
        }
    }
}

/// Input for [`ChatStore::insert_message`].
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub body: MessageBody,
}

/// A 1-based page of message history, newest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub page: u32,
    pub limit: u32,
}

impl Page {
    /// Build a page, defaulting to page 1 of 50 and clamping the limit to
    /// `1..=100`.
    #[must_use]
    pub fn new(page: Option<u32>, limit: Option<u32>) -> Self {
        Self {
            page: page.unwrap_or(1).max(1),
            limit: limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE),
        }
    }

    #[must_use]
    pub fn offset(&self) -> u64 {
        u64::from(self.page - 1) * u64::from(self.limit)
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(None, None)
    }
}

/// Storage for users, chats and messages.
///
/// Participant checks happen inside the store on every call so that a user
/// removed from a chat cannot keep writing to it.
#[async_trait]
pub trait ChatStore: Send + Sync + 'static {
    /// Create a user.
    ///
    /// Emails are compared case-insensitively; a taken email yields
    /// [`StoreError::DuplicateEmail`](crate::StoreError::DuplicateEmail).
    async fn create_user(&self, user: NewUser) -> StoreResult<UserRecord>;

    async fn find_user(&self, id: UserId) -> StoreResult<Option<UserRecord>>;

    async fn find_user_by_email(&self, email: &str) -> StoreResult<Option<UserRecord>>;

    /// Chats `user` participates in, most recently active first.
    async fn chats_for_user(&self, user: UserId) -> StoreResult<Vec<Chat>>;

    /// Ids of the chats `user` participates in.
    async fn chat_ids_for_user(&self, user: UserId) -> StoreResult<Vec<ChatId>>;

    /// A chat as seen by `viewer`. Not found unless `viewer` participates.
    async fn find_chat(&self, chat: ChatId, viewer: UserId) -> StoreResult<Chat>;

    async fn is_participant(&self, chat: ChatId, user: UserId) -> StoreResult<bool>;

    /// Return the private chat between `a` and `b`, creating it if needed.
    ///
    /// The flag is `true` when this call created the chat.
    async fn create_private_chat(&self, a: UserId, b: UserId) -> StoreResult<(Chat, bool)>;

    /// Create a group chat. `creator` is added to `participants` if absent.
    async fn create_group_chat(
        &self,
        creator: UserId,
        name: &str,
        participants: &[UserId],
    ) -> StoreResult<Chat>;

    /// Persist a message and advance the chat's last-message pointer and
    /// count in the same transaction.
    async fn insert_message(&self, message: NewMessage) -> StoreResult<Message>;

    /// Message history as seen by `viewer`, newest first.
    async fn list_messages(&self, chat: ChatId, viewer: UserId, page: Page)
        -> StoreResult<Vec<Message>>;

    async fn find_message(&self, id: MessageId) -> StoreResult<Option<Message>>;

    /// Delete a message sent by `requester`, returning its chat.
    async fn delete_message(&self, id: MessageId, requester: UserId) -> StoreResult<ChatId>;

    /// Add `user` to the message's read-by set.
    async fn mark_read(&self, id: MessageId, user: UserId) -> StoreResult<Message>;
}

//! Error types for the persistence layer.

use thiserror::Error;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The named entity does not exist, or is not visible to the caller.
    #[error("{0} not found")]
    NotFound(&'static str),

    /// The caller is not a participant of the chat.
    #[error("Not a participant of this chat")]
    NotParticipant,

    /// The caller did not send the message.
    #[error("Not the sender of this message")]
    NotOwner,

    #[error("Email already registered")]
    DuplicateEmail,

    #[error("{0}")]
    InvalidInput(String),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    pub(crate) fn decode(message: impl Into<String>) -> Self {
        let message: String = message.into();
        Self::Database(sqlx::Error::Decode(message.into()))
    }
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

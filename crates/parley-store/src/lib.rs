//! # parley-store
//!
//! Durable storage for users, chats and messages.
//!
//! [`ChatStore`] is the narrow interface the server talks to. [`SqliteStore`]
//! implements it on SQLite with sqlx and embedded migrations.
//!
//! Two writes are atomic with respect to concurrent callers:
//!
//! - inserting a message also moves the chat's last-message pointer and
//!   message count, and only succeeds for a current participant;
//! - creating a private chat for an unordered pair of users returns the same
//!   chat to every caller.

pub mod error;
pub mod sqlite;
pub mod store;

pub use error::{StoreError, StoreResult};
pub use sqlite::SqliteStore;
pub use store::{ChatStore, NewMessage, NewUser, Page, UserRecord};

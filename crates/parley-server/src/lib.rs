//! # parley-server
//!
//! Real-time chat server: a REST API for accounts, chats and message
//! history, and a WebSocket live channel for message delivery, typing
//! indicators and presence.
//!
//! Every message, whether it arrives over REST or the live channel, is
//! persisted before it is broadcast to the chat's room.

pub mod auth;
pub mod blob;
pub mod config;
pub mod delivery;
pub mod error;
pub mod gateway;
pub mod metrics;
pub mod routes;
pub mod server;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use server::{build_app, run_server};
pub use state::{AppState, SharedState};

//! # parley-core
//!
//! Connection registry, room routing and presence for the Parley chat server.
//!
//! This crate provides the in-process building blocks of the live channel:
//!
//! - **Connection** - Handle to one authenticated connection's outbound queue
//! - **Room** - Broadcast scope for a chat or for all of one user's devices
//! - **Router** - Room membership and best-effort fan-out
//! - **Presence** - Per-user connection counts and online/offline transitions
//! - **Hub** - Admission and release of connections
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Connection │────▶│     Hub     │────▶│   Router    │────▶ Room
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                            │
//!                            ▼
//!                     ┌─────────────┐
//!                     │  Presence   │
//!                     └─────────────┘
//! ```

pub mod connection;
pub mod hub;
pub mod presence;
pub mod room;
pub mod router;

pub use connection::{ConnectionHandle, ConnectionId, DeliveryError, DeliveryReport, Outbound};
pub use hub::{Hub, HubConfig, HubError, PresenceScope, Session};
pub use presence::PresenceTracker;
pub use room::{Room, RoomId};
pub use router::{RoomRouter, RouterConfig, RouterError, RouterStats};

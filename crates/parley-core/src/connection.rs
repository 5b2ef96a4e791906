//! Connection handles.
//!
//! A connection is identified by a process-unique [`ConnectionId`] and is
//! reachable through a [`ConnectionHandle`], a cloneable sender into the
//! connection's bounded outbound queue. The socket writer task owns the
//! receiving end.

use parley_protocol::{ServerEvent, UserId};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// An event shared by every recipient of a broadcast.
pub type Outbound = Arc<ServerEvent>;

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Create a connection ID from an existing string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random connection ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("conn_{}", Uuid::new_v4().simple()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Why a non-blocking delivery did not happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// The outbound queue is full (slow consumer).
    #[error("outbound queue full")]
    Full,
    /// The connection's writer has gone away.
    #[error("connection closed")]
    Closed,
}

/// Directed-send handle for one authenticated connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    user_id: UserId,
    outbound: mpsc::Sender<Outbound>,
}

impl ConnectionHandle {
    /// Create a handle and the receiver its writer drains.
    #[must_use]
    pub fn new(
        id: ConnectionId,
        user_id: UserId,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Outbound>) {
        let (outbound, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                id,
                user_id,
                outbound,
            },
            rx,
        )
    }

    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    #[must_use]
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Push without waiting. Used for fan-out so that one slow connection
    /// never holds up the others.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError`] if the queue is full or closed.
    pub fn try_deliver(&self, event: &Outbound) -> Result<(), DeliveryError> {
        self.outbound
            .try_send(Arc::clone(event))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
                mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
            })
    }

    /// Push a reply meant only for this connection, waiting for queue space.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::Closed`] if the writer has gone away.
    pub async fn send(&self, event: ServerEvent) -> Result<(), DeliveryError> {
        self.outbound
            .send(Arc::new(event))
            .await
            .map_err(|_| DeliveryError::Closed)
    }

    /// Whether the writer side is gone.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}

/// Outcome of a fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Connections the event was queued for.
    pub delivered: usize,
    /// Connections skipped because their queue was full or closed.
    pub dropped: usize,
}

impl DeliveryReport {
    pub(crate) fn record(&mut self, result: Result<(), DeliveryError>) {
        match result {
            Ok(()) => self.delivered += 1,
            Err(_) => self.dropped += 1,
        }
    }
}

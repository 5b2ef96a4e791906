//! Error handling for the REST API and the live channel.
//!
//! Every failure a client can observe is an [`ApiError`]. Over HTTP it
//! becomes a status code with a `{"error": "..."}` body; over the live
//! channel it becomes an `error` event with the same code.

use crate::auth::AuthError;
use crate::metrics;
use axum::extract::multipart::MultipartError;
use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use parley_core::HubError;
use parley_protocol::{AckId, EmptyMessage, ServerEvent};
use parley_store::StoreError;
use serde_json::json;
use thiserror::Error;
use tracing::error;

/// Errors surfaced to clients.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Unauthenticated(&'static str),

    #[error("{0}")]
    Forbidden(&'static str),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    InvalidInput(String),

    #[error("{0}")]
    EmptyMessage(#[from] EmptyMessage),

    #[error("Server is at connection capacity")]
    Overloaded,

    /// Detail is logged, never sent.
    #[error("Server error")]
    Internal(String),
}

/// Result type for handlers.
pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Log `detail` and return a generic server error.
    pub fn internal(detail: impl std::fmt::Display) -> Self {
        error!(error = %detail, "Internal error");
        Self::Internal(detail.to_string())
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidInput(_) | Self::EmptyMessage(_) => StatusCode::BAD_REQUEST,
            Self::Overloaded => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Numeric code used in live-channel `error` events.
    #[must_use]
    pub fn code(&self) -> u16 {
        self.status().as_u16()
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Unauthenticated(_) => "unauthenticated",
            Self::Forbidden(_) => "forbidden",
            Self::NotFound(_) => "not_found",
            Self::InvalidInput(_) => "invalid_input",
            Self::EmptyMessage(_) => "empty_message",
            Self::Overloaded => "overloaded",
            Self::Internal(_) => "internal",
        }
    }

    /// The live-channel form of this error, tagged with the request's ack id.
    #[must_use]
    pub fn to_event(&self, ack: Option<AckId>) -> ServerEvent {
        metrics::record_error(self.kind());
        ServerEvent::error(ack, self.code(), self.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        metrics::record_error(self.kind());
        let body = Json(json!({ "error": self.to_string() }));
        (self.status(), body).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => Self::NotFound(format!("{what} not found")),
            StoreError::NotParticipant => Self::Forbidden("Not a participant of this chat"),
            StoreError::NotOwner => Self::Forbidden("Not authorized to delete this message"),
            StoreError::DuplicateEmail => Self::invalid("Email already registered"),
            StoreError::InvalidInput(message) => Self::InvalidInput(message),
            StoreError::Migration(_) | StoreError::Database(_) => Self::internal(err),
        }
    }
}

impl From<HubError> for ApiError {
    fn from(err: HubError) -> Self {
        match err {
            HubError::Overloaded => Self::Overloaded,
            HubError::NotJoined(_) => Self::Forbidden("Not joined to this chat"),
            HubError::Router(parley_core::RouterError::MaxRooms)
            | HubError::Router(parley_core::RouterError::MaxRoomsPerConnection) => Self::Overloaded,
            HubError::Router(other) => Self::internal(other),
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Issue(_) | AuthError::Hash(_) => Self::internal(err),
            _ => Self::Unauthenticated("Authentication required"),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(_: JsonRejection) -> Self {
        Self::invalid("Invalid input data")
    }
}

impl From<QueryRejection> for ApiError {
    fn from(_: QueryRejection) -> Self {
        Self::invalid("Invalid query parameters")
    }
}

impl From<PathRejection> for ApiError {
    fn from(_: PathRejection) -> Self {
        Self::invalid("Invalid id")
    }
}

impl From<MultipartError> for ApiError {
    fn from(err: MultipartError) -> Self {
        Self::invalid(format!("Invalid upload: {}", err.body_text()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_map_to_status() {
        assert_eq!(
            ApiError::from(StoreError::NotOwner).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ApiError::from(StoreError::NotFound("Chat")).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(StoreError::DuplicateEmail).status(),
            StatusCode::BAD_REQUEST
        );

        let internal = ApiError::internal("disk on fire");
        assert_eq!(internal.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(internal.to_string(), "Server error");
    }

    #[test]
    fn test_error_event_carries_ack() {
        let event = ApiError::from(EmptyMessage).to_event(Some(9));
        assert_eq!(
            event,
            ServerEvent::Error {
                ack: Some(9),
                code: 400,
                message: "Message must contain either text or a file".to_string(),
            }
        );
    }

    #[test]
    fn test_hub_errors() {
        assert_eq!(ApiError::from(HubError::Overloaded).code(), 503);
        assert_eq!(
            ApiError::from(HubError::NotJoined(uuid::Uuid::nil())).code(),
            403
        );
    }
}

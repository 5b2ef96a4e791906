//! Authentication.
//!
//! Tokens are opaque to the rest of the server: an [`AuthProvider`] issues
//! them and resolves them back to a user id. [`AuthUser`] is the extractor
//! REST handlers use to require a valid bearer token.

mod jwt;
mod password;

pub use jwt::{Claims, JwtAuthProvider};
pub use password::{hash_password, verify_password};

use crate::error::ApiError;
use crate::state::SharedState;
use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::{header, request::Parts, HeaderMap};
use parley_protocol::UserId;
use parley_store::UserRecord;
use thiserror::Error;

/// Authentication errors.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing authentication token")]
    MissingToken,

    #[error("Token expired")]
    Expired,

    #[error("Invalid token: {0}")]
    InvalidToken(String),

    /// The token is valid but its user no longer exists.
    #[error("Unknown user")]
    UnknownUser,

    #[error("Failed to issue token: {0}")]
    Issue(String),

    #[error("Failed to hash password: {0}")]
    Hash(String),
}

/// Issues and validates bearer tokens.
#[async_trait]
pub trait AuthProvider: Send + Sync + 'static {
    /// Issue a token for `user_id`.
    fn issue_token(&self, user_id: UserId) -> Result<String, AuthError>;

    /// Resolve a token to the user it was issued for.
    async fn verify_token(&self, token: &str) -> Result<UserId, AuthError>;
}

/// Extract the token from an `Authorization: Bearer` header.
#[must_use]
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Resolve a token to a stored user.
///
/// # Errors
///
/// Returns [`ApiError::Unauthenticated`] if the token is invalid or its user
/// does not exist.
pub async fn authenticate(state: &SharedState, token: &str) -> Result<UserRecord, ApiError> {
    let user_id = state.auth.verify_token(token).await?;
    state
        .store
        .find_user(user_id)
        .await?
        .ok_or_else(|| AuthError::UnknownUser.into())
}

/// The authenticated caller of a REST handler.
#[derive(Debug, Clone)]
pub struct AuthUser(pub UserRecord);

impl AuthUser {
    #[must_use]
    pub fn id(&self) -> UserId {
        self.0.id()
    }
}

#[async_trait]
impl FromRequestParts<SharedState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &SharedState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers).ok_or(AuthError::MissingToken)?;
        authenticate(state, token).await.map(AuthUser)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_bearer_token() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc.def"));
        assert_eq!(bearer_token(&headers), Some("abc.def"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic xyz"));
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(bearer_token(&headers), None);
    }
}

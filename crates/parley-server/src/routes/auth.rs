//! Registration and login.

use super::ApiJson;
use crate::auth::{hash_password, verify_password};
use crate::error::{ApiError, ApiResult};
use crate::state::SharedState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use parley_protocol::User;
use parley_store::{NewUser, UserRecord};
use serde::{Deserialize, Serialize};
use tracing::info;

const MIN_NAME_LEN: usize = 2;
const MIN_PASSWORD_LEN: usize = 6;

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    name: String,
    email: String,
    password: String,
    #[serde(default)]
    avatar: Option<String>,
}

impl RegisterRequest {
    fn validate(&self) -> ApiResult<()> {
        if self.name.trim().chars().count() < MIN_NAME_LEN {
            return Err(ApiError::invalid("Name must be at least 2 characters"));
        }
        if !is_valid_email(&self.email) {
            return Err(ApiError::invalid("Invalid email address"));
        }
        if self.password.chars().count() < MIN_PASSWORD_LEN {
            return Err(ApiError::invalid("Password must be at least 6 characters"));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    email: String,
    password: String,
}

#[derive(Debug, Serialize)]
pub struct AuthResponse {
    user: User,
    token: String,
}

fn is_valid_email(email: &str) -> bool {
    let email = email.trim();
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !email.chars().any(char::is_whitespace)
}

fn respond(state: &SharedState, record: &UserRecord) -> ApiResult<AuthResponse> {
    let token = state.auth.issue_token(record.id())?;
    Ok(AuthResponse {
        user: record.to_user(state.hub.status(record.id())),
        token,
    })
}

/// `POST /api/auth/register`
pub async fn register(
    State(state): State<SharedState>,
    ApiJson(request): ApiJson<RegisterRequest>,
) -> ApiResult<(StatusCode, Json<AuthResponse>)> {
    request.validate()?;

    let password = request.password;
    let password_hash = tokio::task::spawn_blocking(move || hash_password(&password))
        .await
        .map_err(ApiError::internal)??;

    let record = state
        .store
        .create_user(NewUser {
            name: request.name.trim().to_string(),
            email: request.email,
            password_hash,
            avatar: request.avatar,
        })
        .await?;
    info!(user = %record.id(), "Registered user");

    Ok((StatusCode::CREATED, Json(respond(&state, &record)?)))
}

/// `POST /api/auth/login`
pub async fn login(
    State(state): State<SharedState>,
    ApiJson(request): ApiJson<LoginRequest>,
) -> ApiResult<Json<AuthResponse>> {
    const INVALID: ApiError = ApiError::Unauthenticated("Invalid credentials");

    let Some(record) = state.store.find_user_by_email(&request.email).await? else {
        return Err(INVALID);
    };

    let hash = record.password_hash.clone();
    let password = request.password;
    let verified = tokio::task::spawn_blocking(move || verify_password(&password, &hash))
        .await
        .map_err(ApiError::internal)?;
    if !verified {
        return Err(INVALID);
    }

    info!(user = %record.id(), "User logged in");
    Ok(Json(respond(&state, &record)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_email_validation() {
        assert!(is_valid_email("ada@example.com"));
        assert!(is_valid_email(" ada@mail.example.org "));
        assert!(!is_valid_email("ada"));
        assert!(!is_valid_email("@example.com"));
        assert!(!is_valid_email("ada@example"));
        assert!(!is_valid_email("ada@@example.com"));
        assert!(!is_valid_email("a da@example.com"));
    }

    #[test]
    fn test_register_validation() {
        let request = |name: &str, email: &str, password: &str| RegisterRequest {
            name: name.to_string(),
            email: email.to_string(),
            password: password.to_string(),
            avatar: None,
        };
        assert!(request("Ada", "ada@example.com", "secret").validate().is_ok());
        assert!(request(" A ", "ada@example.com", "secret").validate().is_err());
        assert!(request("Ada", "ada", "secret").validate().is_err());
        assert!(request("Ada", "ada@example.com", "12345").validate().is_err());
    }
}

//! File uploads.

use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::state::SharedState;
use axum::extract::multipart::Field;
use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::Json;
use bytes::BytesMut;
use parley_protocol::Attachment;

const DEFAULT_MIME: &str = "application/octet-stream";

/// Validate a multipart file field against the upload limits and store it.
pub(super) async fn store_file(state: &SharedState, mut field: Field<'_>) -> ApiResult<Attachment> {
    let uploads = &state.config.uploads;
    let name = field.file_name().unwrap_or("file").to_string();
    let mime_type = field.content_type().unwrap_or(DEFAULT_MIME).to_string();

    if !uploads.allowed_mime_types.iter().any(|allowed| *allowed == mime_type) {
        return Err(ApiError::invalid(format!("File type {mime_type} is not allowed")));
    }

    let mut data = BytesMut::new();
    while let Some(chunk) = field.chunk().await? {
        if data.len() + chunk.len() > uploads.max_file_size {
            return Err(ApiError::invalid("File too large"));
        }
        data.extend_from_slice(&chunk);
    }
    if data.is_empty() {
        return Err(ApiError::invalid("Empty file"));
    }

    state
        .blobs
        .store(data.freeze(), &name, &mime_type)
        .await
        .map_err(ApiError::internal)
}

/// `POST /api/uploads`
pub async fn upload(
    State(state): State<SharedState>,
    _user: AuthUser,
    mut multipart: Multipart,
) -> ApiResult<(StatusCode, Json<Attachment>)> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() == Some("file") {
            let attachment = store_file(&state, field).await?;
            return Ok((StatusCode::CREATED, Json(attachment)));
        }
    }
    Err(ApiError::invalid("Missing file field"))
}

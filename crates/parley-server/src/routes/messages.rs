//! Message history, sending and deletion.

use super::uploads::store_file;
use super::{ApiJson, ApiPath, ApiQuery};
use crate::auth::AuthUser;
use crate::blob::BlobStore;
use crate::error::{ApiError, ApiResult};
use crate::state::SharedState;
use axum::extract::{FromRequest, Multipart, Request, State};
use axum::http::{header, StatusCode};
use axum::Json;
use parley_protocol::{ChatId, Message, MessageDraft, MessageId};
use parley_store::Page;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

#[derive(Debug, Default, Deserialize)]
pub struct PageParams {
    page: Option<u32>,
    limit: Option<u32>,
}

/// `GET /api/messages/:chat_id`
pub async fn list(
    State(state): State<SharedState>,
    user: AuthUser,
    ApiPath(chat_id): ApiPath<ChatId>,
    ApiQuery(params): ApiQuery<PageParams>,
) -> ApiResult<Json<Vec<Message>>> {
    let page = Page::new(params.page, params.limit);
    Ok(Json(state.store.list_messages(chat_id, user.id(), page).await?))
}

/// `POST /api/messages/:chat_id`, with a JSON or multipart body.
pub async fn send(
    State(state): State<SharedState>,
    user: AuthUser,
    ApiPath(chat_id): ApiPath<ChatId>,
    request: Request,
) -> ApiResult<(StatusCode, Json<Message>)> {
    let is_form = is_multipart(&request);
    let draft = if is_form {
        if !state.store.is_participant(chat_id, user.id()).await? {
            return Err(ApiError::Forbidden("Not a participant of this chat"));
        }
        let multipart = Multipart::from_request(request, &state)
            .await
            .map_err(|e| ApiError::invalid(e.body_text()))?;
        read_multipart(&state, multipart).await?
    } else {
        let ApiJson(draft) = ApiJson::<MessageDraft>::from_request(request, &state).await?;
        draft
    };

    let upload = draft.attachment.as_ref().map(|a| a.url.clone());
    match state.delivery.send(user.id(), chat_id, draft, None).await {
        Ok(message) => Ok((StatusCode::CREATED, Json(message))),
        Err(err) => {
            if let Some(url) = upload.filter(|_| is_form) {
                discard_upload(&state, &url).await;
            }
            Err(err)
        }
    }
}

async fn discard_upload(state: &SharedState, url: &str) {
    if let Err(e) = state.blobs.remove(url).await {
        warn!(url, error = %e, "Failed to remove orphaned upload");
    }
}

fn is_multipart(request: &Request) -> bool {
    request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("multipart/form-data"))
}

/// Collect the `content` text field and the optional `file` part. A stored
/// file is removed again if a later part fails.
async fn read_multipart(state: &SharedState, mut multipart: Multipart) -> ApiResult<MessageDraft> {
    let mut draft = MessageDraft::default();
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => return Ok(draft),
            Err(err) => return Err(abandon(state, draft, err.into()).await),
        };
        match field.name() {
            Some("content") => match field.text().await {
                Ok(text) => draft.content = Some(text),
                Err(err) => return Err(abandon(state, draft, err.into()).await),
            },
            Some("file") if draft.attachment.is_none() => match store_file(state, field).await {
                Ok(attachment) => draft.attachment = Some(attachment),
                Err(err) => return Err(abandon(state, draft, err).await),
            },
            _ => {}
        }
    }
}

async fn abandon(state: &SharedState, draft: MessageDraft, err: ApiError) -> ApiError {
    if let Some(attachment) = draft.attachment {
        discard_upload(state, &attachment.url).await;
    }
    err
}

/// `DELETE /api/messages/:message_id`
pub async fn delete(
    State(state): State<SharedState>,
    user: AuthUser,
    ApiPath(message_id): ApiPath<MessageId>,
) -> ApiResult<Json<Value>> {
    state.delivery.delete(user.id(), message_id).await?;
    Ok(Json(json!({ "message": "Message deleted successfully" })))
}

/// `PUT /api/messages/:message_id/read`
pub async fn mark_read(
    State(state): State<SharedState>,
    user: AuthUser,
    ApiPath(message_id): ApiPath<MessageId>,
) -> ApiResult<Json<Message>> {
    Ok(Json(state.delivery.mark_read(user.id(), message_id).await?))
}

//! Chat listing and creation.

use super::{ApiJson, ApiPath};
use crate::auth::AuthUser;
use crate::error::ApiResult;
use crate::metrics;
use crate::state::SharedState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use parley_protocol::{Chat, ChatId, ServerEvent, UserId};
use serde::Deserialize;
use tracing::info;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivateChatRequest {
    recipient_id: UserId,
}

#[derive(Debug, Deserialize)]
pub struct GroupChatRequest {
    name: String,
    participants: Vec<UserId>,
}

/// Tell every participant's connections about a new chat.
fn announce_created(state: &SharedState, chat: &Chat) {
    for participant in &chat.participants {
        let report = state.hub.send_to_user(
            participant.id,
            ServerEvent::ChatCreated { chat: chat.clone() },
        );
        metrics::record_delivery(report);
    }
}

/// `GET /api/chats`
pub async fn list(State(state): State<SharedState>, user: AuthUser) -> ApiResult<Json<Vec<Chat>>> {
    Ok(Json(state.store.chats_for_user(user.id()).await?))
}

/// `POST /api/chats/private`
pub async fn create_private(
    State(state): State<SharedState>,
    user: AuthUser,
    ApiJson(request): ApiJson<PrivateChatRequest>,
) -> ApiResult<(StatusCode, Json<Chat>)> {
    let (chat, created) = state
        .store
        .create_private_chat(user.id(), request.recipient_id)
        .await?;

    if !created {
        return Ok((StatusCode::OK, Json(chat)));
    }
    info!(chat = %chat.id, user = %user.id(), "Created private chat");
    announce_created(&state, &chat);
    Ok((StatusCode::CREATED, Json(chat)))
}

/// `POST /api/chats/group`
pub async fn create_group(
    State(state): State<SharedState>,
    user: AuthUser,
    ApiJson(request): ApiJson<GroupChatRequest>,
) -> ApiResult<(StatusCode, Json<Chat>)> {
    let chat = state
        .store
        .create_group_chat(user.id(), &request.name, &request.participants)
        .await?;

    info!(
        chat = %chat.id,
        user = %user.id(),
        participants = chat.participants.len(),
        "Created group chat"
    );
    announce_created(&state, &chat);
    Ok((StatusCode::CREATED, Json(chat)))
}

/// `GET /api/chats/:id`
pub async fn show(
    State(state): State<SharedState>,
    user: AuthUser,
    ApiPath(chat_id): ApiPath<ChatId>,
) -> ApiResult<Json<Chat>> {
    Ok(Json(state.store.find_chat(chat_id, user.id()).await?))
}

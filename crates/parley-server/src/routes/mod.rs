//! REST API.

mod auth;
mod chats;
mod messages;
mod uploads;

use crate::error::ApiError;
use crate::state::SharedState;
use axum::extract::{FromRequest, FromRequestParts};
use axum::routing::{get, post, put};
use axum::Router;

/// `Json` with rejections mapped to [`ApiError`].
#[derive(Debug, FromRequest)]
#[from_request(via(axum::Json), rejection(ApiError))]
pub struct ApiJson<T>(pub T);

/// `Path` with rejections mapped to [`ApiError`].
#[derive(Debug, FromRequestParts)]
#[from_request(via(axum::extract::Path), rejection(ApiError))]
pub struct ApiPath<T>(pub T);

/// `Query` with rejections mapped to [`ApiError`].
#[derive(Debug, FromRequestParts)]
#[from_request(via(axum::extract::Query), rejection(ApiError))]
pub struct ApiQuery<T>(pub T);

/// Routes mounted under `/api`.
pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .route("/chats", get(chats::list))
        .route("/chats/private", post(chats::create_private))
        .route("/chats/group", post(chats::create_group))
        .route("/chats/:id", get(chats::show))
        .route(
            "/messages/:id",
            get(messages::list)
                .post(messages::send)
                .delete(messages::delete),
        )
        .route("/messages/:id/read", put(messages::mark_read))
        .route("/uploads", post(uploads::upload))
}

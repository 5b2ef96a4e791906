//! HTTP server assembly.

use crate::blob::UPLOADS_PREFIX;
use crate::config::Config;
use crate::gateway::ws_handler;
use crate::metrics;
use crate::routes::api_router;
use crate::state::{AppState, SharedState};
use anyhow::{Context, Result};
use axum::extract::DefaultBodyLimit;
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderValue, Method};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

/// Room for multipart framing and text fields on top of the file itself.
const BODY_OVERHEAD: usize = 64 * 1024;

/// Build the application router.
pub fn build_app(state: SharedState) -> Router {
    let config = &state.config;
    let body_limit = config.uploads.max_file_size + BODY_OVERHEAD;

    Router::new()
        .route("/health", get(health_handler))
        .route(&config.transport.websocket_path, get(ws_handler))
        .nest("/api", api_router())
        .nest_service(UPLOADS_PREFIX, ServeDir::new(&config.uploads.dir))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors_layer(&config.transport.cors_origin))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(origin: &str) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE]);

    if origin == "*" {
        return layer.allow_origin(Any);
    }
    match HeaderValue::from_str(origin) {
        Ok(origin) => layer.allow_origin(origin),
        Err(_) => {
            warn!(origin, "Ignoring invalid CORS origin");
            layer
        }
    }
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Run the HTTP/WebSocket server until Ctrl-C.
///
/// # Errors
///
/// Returns an error if the database, uploads directory or listener cannot
/// be set up.
pub async fn run_server(config: Config) -> Result<()> {
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    tokio::fs::create_dir_all(&config.uploads.dir)
        .await
        .with_context(|| format!("Failed to create {}", config.uploads.dir.display()))?;

    let addr = config.bind_addr()?;
    let websocket_path = config.transport.websocket_path.clone();
    let state = Arc::new(AppState::from_config(config).await?);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("Parley server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}{}", addr, websocket_path);

    axum::serve(listener, build_app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Parley server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}

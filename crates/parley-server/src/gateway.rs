//! Live-channel gateway.
//!
//! Each WebSocket goes through a handshake (version, encoding, token),
//! is admitted to the hub, and then runs two halves: a writer task that
//! drains the connection's outbound queue and sends heartbeats, and the
//! reader loop below, which handles client events one at a time.

use crate::auth::{self, bearer_token};
use crate::error::ApiError;
use crate::metrics::{self, ConnectionMetricsGuard};
use crate::state::SharedState;
use axum::extract::ws::{close_code, CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parley_core::{ConnectionHandle, Hub, Outbound, Session};
use parley_protocol::{
    codec, ChatId, ClientEvent, Encoding, ServerEvent, Version, WireFrame, PROTOCOL_VERSION,
};
use parley_store::UserRecord;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Close code sent when authentication fails.
pub const CLOSE_UNAUTHENTICATED: u16 = 4401;

/// How long the writer may keep flushing after the reader has stopped.
const WRITER_DRAIN: Duration = Duration::from_secs(1);

/// Query parameters of the upgrade request.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    pub token: Option<String>,
    pub encoding: Option<String>,
    pub version: Option<String>,
}

/// WebSocket upgrade handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let token = params
        .token
        .clone()
        .or_else(|| bearer_token(&headers).map(str::to_string));
    let max_size = state.config.limits.max_message_size;

    ws.max_message_size(max_size)
        .max_frame_size(max_size)
        .on_upgrade(move |socket| handle_socket(socket, state, params, token))
}

/// Removes the connection from the hub when dropped, on every exit path.
struct Admission {
    hub: Arc<Hub>,
    handle: ConnectionHandle,
}

impl Drop for Admission {
    fn drop(&mut self) {
        if let Some(announced) = self.hub.release(&self.handle) {
            metrics::record_delivery(announced);
            metrics::set_active_rooms(self.hub.stats().room_count);
        }
    }
}

async fn handle_socket(
    mut socket: WebSocket,
    state: SharedState,
    params: ConnectParams,
    token: Option<String>,
) {
    let encoding = match negotiate(&params) {
        Ok(encoding) => encoding,
        Err(err) => {
            refuse(socket, Encoding::Json, &err, close_code::PROTOCOL).await;
            return;
        }
    };

    let user = match authenticate_socket(&mut socket, &state, token).await {
        Ok(user) => user,
        Err(err) => {
            refuse(socket, encoding, &err, CLOSE_UNAUTHENTICATED).await;
            return;
        }
    };
    let user_id = user.id();

    let chat_ids = match state.store.chat_ids_for_user(user_id).await {
        Ok(ids) => ids,
        Err(err) => {
            refuse(socket, encoding, &ApiError::from(err), close_code::ERROR).await;
            return;
        }
    };

    let Session {
        handle,
        outbound,
        announced,
    } = match state.hub.admit(user_id, &chat_ids) {
        Ok(session) => session,
        Err(err) => {
            refuse(socket, encoding, &ApiError::from(err), close_code::AGAIN).await;
            return;
        }
    };
    metrics::record_delivery(announced);
    let _metrics_guard = ConnectionMetricsGuard::new();
    let admission = Admission {
        hub: Arc::clone(&state.hub),
        handle,
    };
    metrics::set_active_rooms(state.hub.stats().room_count);

    let connection = admission.handle.id().clone();
    info!(connection = %connection, user = %user_id, chats = chat_ids.len(), "Connection opened");

    let connected = ServerEvent::Connected {
        connection_id: connection.to_string(),
        user_id,
        version: PROTOCOL_VERSION.to_string(),
        heartbeat_ms: state.config.heartbeat.interval_ms,
    };
    if send_event(&mut socket, &connected, encoding).await.is_err() {
        debug!(connection = %connection, "Failed to send connected event");
        return;
    }

    let (sink, mut stream) = socket.split();
    let mut writer = tokio::spawn(write_loop(
        sink,
        outbound,
        encoding,
        state.config.heartbeat.interval(),
    ));

    let idle = state.config.heartbeat.timeout();
    loop {
        let frame = match tokio::time::timeout(idle, stream.next()).await {
            Err(_) => {
                debug!(connection = %connection, "Idle timeout");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                warn!(connection = %connection, error = %e, "WebSocket error");
                metrics::record_error("websocket");
                break;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        let decoded = match frame {
            WsMessage::Text(text) => {
                metrics::record_event(text.len(), "in");
                codec::decode_text::<ClientEvent>(&text)
            }
            WsMessage::Binary(data) => {
                metrics::record_event(data.len(), "in");
                codec::decode_binary::<ClientEvent>(&data)
            }
            WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
            WsMessage::Close(_) => break,
        };

        let reply = match decoded {
            Ok(event) => handle_event(&state, &admission.handle, event).await,
            Err(e) => {
                debug!(connection = %connection, error = %e, "Malformed event");
                Some(ApiError::invalid(format!("Malformed event: {e}")).to_event(None))
            }
        };
        if let Some(reply) = reply {
            if admission.handle.send(reply).await.is_err() {
                break;
            }
        }
    }

    drop(admission);
    if tokio::time::timeout(WRITER_DRAIN, &mut writer).await.is_err() {
        writer.abort();
    }
    info!(connection = %connection, user = %user_id, "Connection closed");
}

/// Resolve the encoding and check the client's protocol version.
fn negotiate(params: &ConnectParams) -> Result<Encoding, ApiError> {
    if let Some(version) = &params.version {
        let version: Version = version
            .parse()
            .map_err(|_| ApiError::invalid("Invalid protocol version"))?;
        if !version.is_compatible_with(&PROTOCOL_VERSION) {
            return Err(ApiError::invalid(format!(
                "Unsupported protocol version {version}, server speaks {PROTOCOL_VERSION}"
            )));
        }
    }

    match &params.encoding {
        Some(encoding) => encoding
            .parse()
            .map_err(|e: parley_protocol::ProtocolError| ApiError::invalid(e.to_string())),
        None => Ok(Encoding::default()),
    }
}

/// Authenticate with the handshake token, or wait for an `auth` event.
async fn authenticate_socket(
    socket: &mut WebSocket,
    state: &SharedState,
    token: Option<String>,
) -> Result<UserRecord, ApiError> {
    let token = match token {
        Some(token) => token,
        None => {
            let deadline = Duration::from_millis(state.config.transport.handshake_timeout_ms);
            tokio::time::timeout(deadline, await_auth_event(socket))
                .await
                .map_err(|_| ApiError::Unauthenticated("Authentication timed out"))??
        }
    };
    auth::authenticate(state, &token).await
}

async fn await_auth_event(socket: &mut WebSocket) -> Result<String, ApiError> {
    while let Some(frame) = socket.recv().await {
        let decoded = match frame {
            Ok(WsMessage::Text(text)) => codec::decode_text::<ClientEvent>(&text),
            Ok(WsMessage::Binary(data)) => codec::decode_binary::<ClientEvent>(&data),
            Ok(WsMessage::Ping(_) | WsMessage::Pong(_)) => continue,
            Ok(WsMessage::Close(_)) | Err(_) => break,
        };
        return match decoded {
            Ok(ClientEvent::Authenticate { token }) => Ok(token),
            _ => Err(ApiError::Unauthenticated("Authentication required")),
        };
    }
    Err(ApiError::Unauthenticated("Authentication required"))
}

/// Send an error event and close the socket.
async fn refuse(mut socket: WebSocket, encoding: Encoding, err: &ApiError, code: u16) {
    debug!(code, error = %err, "Refusing connection");
    let _ = send_event(&mut socket, &err.to_event(None), encoding).await;
    let _ = socket
        .send(WsMessage::Close(Some(CloseFrame {
            code,
            reason: err.to_string().into(),
        })))
        .await;
}

async fn send_event(
    socket: &mut WebSocket,
    event: &ServerEvent,
    encoding: Encoding,
) -> Result<(), axum::Error> {
    match codec::encode(event, encoding) {
        Ok(frame) => {
            metrics::record_event(frame.len(), "out");
            socket.send(into_ws(frame)).await
        }
        Err(e) => {
            warn!(event = event.name(), error = %e, "Failed to encode event");
            Ok(())
        }
    }
}

fn into_ws(frame: WireFrame) -> WsMessage {
    match frame {
        WireFrame::Text(text) => WsMessage::Text(text),
        WireFrame::Binary(data) => WsMessage::Binary(data.to_vec()),
    }
}

/// Drain the outbound queue onto the socket and send heartbeat pings.
async fn write_loop(
    mut sink: SplitSink<WebSocket, WsMessage>,
    mut outbound: mpsc::Receiver<Outbound>,
    encoding: Encoding,
    heartbeat: Duration,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + heartbeat, heartbeat);
    loop {
        tokio::select! {
            event = outbound.recv() => {
                let Some(event) = event else { break };
                let frame = match codec::encode(event.as_ref(), encoding) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(event = event.name(), error = %e, "Failed to encode event");
                        metrics::record_error("encode");
                        continue;
                    }
                };
                metrics::record_event(frame.len(), "out");
                if sink.send(into_ws(frame)).await.is_err() {
                    break;
                }
            }
            _ = ticker.tick() => {
                if sink.send(WsMessage::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }
    let _ = sink.close().await;
}

/// Handle one client event, returning the reply for this connection.
async fn handle_event(
    state: &SharedState,
    handle: &ConnectionHandle,
    event: ClientEvent,
) -> Option<ServerEvent> {
    match event {
        ClientEvent::MessageSend {
            chat_id,
            message,
            ack,
        } => {
            let result = state
                .delivery
                .send(handle.user_id(), chat_id, message, Some(handle.id()))
                .await;
            Some(match result {
                Ok(message) => ServerEvent::MessageSent { ack, message },
                Err(err) => err.to_event(ack),
            })
        }
        ClientEvent::TypingStart { chat_id } => typing(state, handle, chat_id, true),
        ClientEvent::TypingStop { chat_id } => typing(state, handle, chat_id, false),
        ClientEvent::RoomJoin { chat_id } => Some(match join_room(state, handle, chat_id).await {
            Ok(()) => ServerEvent::RoomJoined { chat_id },
            Err(err) => err.to_event(None),
        }),
        ClientEvent::Ping { timestamp } => Some(ServerEvent::Pong { timestamp }),
        ClientEvent::Authenticate { .. } => {
            Some(ApiError::invalid("Already authenticated").to_event(None))
        }
    }
}

fn typing(
    state: &SharedState,
    handle: &ConnectionHandle,
    chat_id: ChatId,
    is_typing: bool,
) -> Option<ServerEvent> {
    match state.hub.typing(handle, chat_id, is_typing) {
        Ok(report) => {
            metrics::record_delivery(report);
            None
        }
        Err(err) => Some(ApiError::from(err).to_event(None)),
    }
}

async fn join_room(
    state: &SharedState,
    handle: &ConnectionHandle,
    chat_id: ChatId,
) -> Result<(), ApiError> {
    if !state.store.is_participant(chat_id, handle.user_id()).await? {
        return Err(ApiError::Forbidden("Not a participant of this chat"));
    }
    if state.hub.join_chat(handle.id(), chat_id)? {
        debug!(connection = %handle.id(), chat = %chat_id, "Joined chat room");
        metrics::set_active_rooms(state.hub.stats().room_count);
    }
    Ok(())
}

//! Live-channel tests against a real listener.

use futures_util::{SinkExt, StreamExt};
use parley_protocol::codec::decode_binary;
use parley_protocol::{PresenceStatus, ServerEvent, UserId};
use parley_server::auth::JwtAuthProvider;
use parley_server::blob::LocalBlobStore;
use parley_server::{build_app, AppState, Config, SharedState};
use parley_store::{ChatStore, NewUser, Page, SqliteStore};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);

struct TestServer {
    addr: SocketAddr,
    state: SharedState,
    _uploads: TempDir,
}

async fn spawn_server() -> TestServer {
    spawn_server_with(|_| {}).await
}

async fn spawn_server_with(configure: impl FnOnce(&mut Config)) -> TestServer {
    let uploads = TempDir::new().unwrap();
    let mut config = Config::default();
    config.uploads.dir = uploads.path().to_path_buf();
    config.auth.jwt_secret = "live-test-secret".to_string();
    config.transport.handshake_timeout_ms = 500;
    configure(&mut config);

    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    let auth = Arc::new(JwtAuthProvider::from_config(&config.auth));
    let blobs = Arc::new(LocalBlobStore::new(uploads.path()));
    let state = Arc::new(AppState::new(config, store, auth, blobs));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = build_app(Arc::clone(&state));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        addr,
        state,
        _uploads: uploads,
    }
}

impl TestServer {
    async fn user(&self, name: &str) -> (UserId, String) {
        let record = self
            .state
            .store
            .create_user(NewUser {
                name: name.to_string(),
                email: format!("{name}@example.com"),
                password_hash: "unused".to_string(),
                avatar: None,
            })
            .await
            .unwrap();
        let token = self.state.auth.issue_token(record.id()).unwrap();
        (record.id(), token)
    }

    async fn connect(&self, query: &str) -> Client {
        let url = format!("ws://{}/ws?{query}", self.addr);
        let (client, _) = connect_async(url).await.unwrap();
        client
    }

    /// Connect with a token and consume the `connected` event.
    async fn connect_as(&self, token: &str) -> Client {
        let mut client = self.connect(&format!("token={token}")).await;
        let connected = next_event(&mut client).await;
        assert_eq!(connected["event"], "connected", "{connected}");
        client
    }
}

/// Next JSON event, skipping control frames.
async fn next_event(client: &mut Client) -> Value {
    loop {
        let frame = tokio::time::timeout(WAIT, client.next())
            .await
            .expect("timed out waiting for an event")
            .expect("connection closed")
            .unwrap();
        match frame {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Next event named `name`, skipping presence updates.
async fn expect_event(client: &mut Client, name: &str) -> Value {
    loop {
        let event = next_event(client).await;
        if event["event"] == name {
            return event;
        }
        assert_eq!(event["event"], "user:status", "expected {name}, got {event}");
    }
}

async fn emit(client: &mut Client, event: Value) {
    client.send(Message::Text(event.to_string())).await.unwrap();
}

/// Round-trip a ping and return every event received before the pong.
async fn drain(client: &mut Client) -> Vec<Value> {
    emit(client, json!({ "event": "ping", "data": { "timestamp": 42 } })).await;
    let mut seen = Vec::new();
    loop {
        let event = next_event(client).await;
        if event["event"] == "pong" {
            assert_eq!(event["data"]["timestamp"], 42);
            return seen;
        }
        seen.push(event);
    }
}

#[tokio::test]
async fn test_message_delivered_to_other_participant() {
    let server = spawn_server().await;
    let (alice, alice_token) = server.user("alice").await;
    let (bob, bob_token) = server.user("bob").await;
    let (chat, _) = server.state.store.create_private_chat(alice, bob).await.unwrap();

    let mut a = server.connect_as(&alice_token).await;
    let mut b = server.connect_as(&bob_token).await;

    emit(
        &mut a,
        json!({
            "event": "message:send",
            "data": { "chatId": chat.id, "message": { "content": "hi" }, "ack": 7 }
        }),
    )
    .await;

    let received = expect_event(&mut b, "message:receive").await;
    assert_eq!(received["data"]["chatId"], chat.id.to_string());
    assert_eq!(received["data"]["message"]["content"], "hi");
    assert_eq!(received["data"]["message"]["type"], "text");
    assert_eq!(received["data"]["message"]["sender"]["id"], alice.to_string());

    let sent = expect_event(&mut a, "message:sent").await;
    assert_eq!(sent["data"]["ack"], 7);
    assert_eq!(sent["data"]["message"]["id"], received["data"]["message"]["id"]);

    let echoed = drain(&mut a).await;
    assert!(echoed.iter().all(|e| e["event"] != "message:receive"));

    let history = server
        .state
        .store
        .list_messages(chat.id, bob, Page::default())
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].body.content(), Some("hi"));
}

#[tokio::test]
async fn test_send_errors_go_to_sender_with_ack() {
    let server = spawn_server().await;
    let (alice, alice_token) = server.user("alice").await;
    let (bob, _) = server.user("bob").await;
    let (chat, _) = server.state.store.create_private_chat(alice, bob).await.unwrap();

    let mut a = server.connect_as(&alice_token).await;
    emit(
        &mut a,
        json!({
            "event": "message:send",
            "data": { "chatId": chat.id, "message": {}, "ack": 3 }
        }),
    )
    .await;
    let error = expect_event(&mut a, "error").await;
    assert_eq!(error["data"]["ack"], 3);
    assert_eq!(error["data"]["code"], 400);

    a.send(Message::Text("{not json".to_string())).await.unwrap();
    let error = expect_event(&mut a, "error").await;
    assert_eq!(error["data"]["code"], 400);
}

#[tokio::test]
async fn test_typing_is_relayed_not_persisted() {
    let server = spawn_server().await;
    let (alice, alice_token) = server.user("alice").await;
    let (bob, bob_token) = server.user("bob").await;
    let (_, carol_token) = server.user("carol").await;
    let (chat, _) = server.state.store.create_private_chat(alice, bob).await.unwrap();

    let mut a = server.connect_as(&alice_token).await;
    let mut b = server.connect_as(&bob_token).await;

    emit(&mut a, json!({ "event": "typing:start", "data": { "chatId": chat.id } })).await;
    let update = expect_event(&mut b, "typing:update").await;
    assert_eq!(update["data"]["userId"], alice.to_string());
    assert_eq!(update["data"]["isTyping"], true);

    emit(&mut a, json!({ "event": "typing:stop", "data": { "chatId": chat.id } })).await;
    let update = expect_event(&mut b, "typing:update").await;
    assert_eq!(update["data"]["isTyping"], false);

    let echoed = drain(&mut a).await;
    assert!(echoed.iter().all(|e| e["event"] != "typing:update"));

    let found = server.state.store.find_chat(chat.id, alice).await.unwrap();
    assert_eq!(found.message_count, 0);

    // Outsiders are not in the room.
    let mut c = server.connect_as(&carol_token).await;
    emit(&mut c, json!({ "event": "typing:start", "data": { "chatId": chat.id } })).await;
    let error = expect_event(&mut c, "error").await;
    assert_eq!(error["data"]["code"], 403);
}

#[tokio::test]
async fn test_room_join_after_chat_created() {
    let server = spawn_server().await;
    let (alice, alice_token) = server.user("alice").await;
    let (bob, bob_token) = server.user("bob").await;

    let mut a = server.connect_as(&alice_token).await;
    let mut b = server.connect_as(&bob_token).await;

    // Created after both connected, so neither is in the room yet.
    let (chat, _) = server.state.store.create_private_chat(alice, bob).await.unwrap();

    emit(&mut b, json!({ "event": "room:join", "data": { "chatId": chat.id } })).await;
    let joined = expect_event(&mut b, "room:joined").await;
    assert_eq!(joined["data"]["chatId"], chat.id.to_string());

    emit(&mut a, json!({ "event": "room:join", "data": { "chatId": chat.id } })).await;
    expect_event(&mut a, "room:joined").await;

    emit(
        &mut a,
        json!({
            "event": "message:send",
            "data": { "chatId": chat.id, "message": { "content": "late" } }
        }),
    )
    .await;
    let received = expect_event(&mut b, "message:receive").await;
    assert_eq!(received["data"]["message"]["content"], "late");

    let (_, carol_token) = server.user("carol").await;
    let mut c = server.connect_as(&carol_token).await;
    emit(&mut c, json!({ "event": "room:join", "data": { "chatId": chat.id } })).await;
    let error = expect_event(&mut c, "error").await;
    assert_eq!(error["data"]["code"], 403);
}

#[tokio::test]
async fn test_presence_online_and_offline() {
    let server = spawn_server().await;
    let (_, alice_token) = server.user("alice").await;
    let (bob, bob_token) = server.user("bob").await;

    let mut a = server.connect_as(&alice_token).await;
    let mut b1 = server.connect_as(&bob_token).await;

    let online = next_event(&mut a).await;
    assert_eq!(online["event"], "user:status");
    assert_eq!(online["data"]["userId"], bob.to_string());
    assert_eq!(online["data"]["status"], "online");

    // A second device does not announce again.
    let mut b2 = server.connect_as(&bob_token).await;
    b1.close(None).await.unwrap();
    assert!(drain(&mut a).await.is_empty());

    b2.close(None).await.unwrap();
    let offline = next_event(&mut a).await;
    assert_eq!(offline["data"]["userId"], bob.to_string());
    assert_eq!(offline["data"]["status"], "offline");
}

#[tokio::test]
async fn test_silent_connection_is_closed_after_idle_timeout() {
    let server = spawn_server_with(|config| {
        config.heartbeat.interval_ms = 50;
        config.heartbeat.timeout_ms = 300;
    })
    .await;
    let (alice, alice_token) = server.user("alice").await;
    let mut a = server.connect_as(&alice_token).await;
    assert_eq!(server.state.hub.status(alice), PresenceStatus::Online);

    tokio::time::sleep(Duration::from_millis(600)).await;

    let mut pings = 0;
    loop {
        match tokio::time::timeout(WAIT, a.next())
            .await
            .expect("idle connection was not closed")
        {
            Some(Ok(Message::Ping(_))) => pings += 1,
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
            Some(Ok(other)) => panic!("unexpected frame: {other:?}"),
        }
    }
    assert!(pings > 0, "no heartbeat ping before close");
    assert_eq!(server.state.hub.connection_count(), 0);
    assert_eq!(server.state.hub.status(alice), PresenceStatus::Offline);
}

#[tokio::test]
async fn test_invalid_token_is_refused() {
    let server = spawn_server().await;
    let mut client = server.connect("token=not-a-token").await;

    let error = next_event(&mut client).await;
    assert_eq!(error["event"], "error");
    assert_eq!(error["data"]["code"], 401);

    let close = tokio::time::timeout(WAIT, client.next()).await.unwrap();
    match close {
        Some(Ok(Message::Close(Some(frame)))) => assert_eq!(u16::from(frame.code), 4401),
        other => panic!("expected close frame, got {other:?}"),
    }
    assert_eq!(server.state.hub.connection_count(), 0);
}

#[tokio::test]
async fn test_auth_event_and_handshake_timeout() {
    let server = spawn_server().await;
    let (alice, alice_token) = server.user("alice").await;

    let mut client = server.connect("").await;
    emit(&mut client, json!({ "event": "auth", "data": { "token": alice_token } })).await;
    let connected = next_event(&mut client).await;
    assert_eq!(connected["event"], "connected");
    assert_eq!(connected["data"]["userId"], alice.to_string());
    assert_eq!(connected["data"]["version"], "1.0");

    let mut silent = server.connect("").await;
    let error = next_event(&mut silent).await;
    assert_eq!(error["data"]["code"], 401);
}

#[tokio::test]
async fn test_version_mismatch_is_refused() {
    let server = spawn_server().await;
    let (_, token) = server.user("alice").await;

    let mut client = server.connect(&format!("token={token}&version=2.0")).await;
    let error = next_event(&mut client).await;
    assert_eq!(error["event"], "error");
    assert_eq!(error["data"]["code"], 400);
}

#[tokio::test]
async fn test_msgpack_encoding() {
    let server = spawn_server().await;
    let (alice, token) = server.user("alice").await;

    let mut client = server
        .connect(&format!("token={token}&encoding=msgpack"))
        .await;
    let frame = tokio::time::timeout(WAIT, client.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let Message::Binary(data) = frame else {
        panic!("expected binary frame, got {frame:?}");
    };
    match decode_binary::<ServerEvent>(&data).unwrap() {
        ServerEvent::Connected { user_id, .. } => assert_eq!(user_id, alice),
        other => panic!("expected connected, got {other:?}"),
    }
}

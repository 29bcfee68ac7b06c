//! Integration tests for the WebSocket relay.
//!
//! These tests start a real server on a free port and connect real
//! clients, verifying the full relay pipeline.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use sketchroom_sync::protocol::{EventKind, Point, RemoteEvent, RoomId, StrokeSegment};
use sketchroom_sync::relay::{ClientConfig, ConnectionState, RelayClient, RelayServer, ServerConfig};
use sketchroom_sync::remote::RelayConnection;
use sketchroom_sync::tool_state::Tool;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a relay on a free port, return its URL.
async fn start_test_server() -> String {
    let port = free_port().await;
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        max_peers_per_room: 10,
        broadcast_capacity: 64,
    };
    let server = RelayServer::new(config);
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    // Give server time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
    format!("ws://127.0.0.1:{port}")
}

fn room(id: &str) -> RoomId {
    RoomId::new(id).unwrap()
}

fn user_count(room_id: &str, count: u32) -> RemoteEvent {
    RemoteEvent::UserCount {
        room_id: room(room_id),
        count,
    }
}

/// Route every inbound event of `kind` into a channel.
fn collect(client: &RelayClient, kind: EventKind) -> mpsc::UnboundedReceiver<RemoteEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    client.on(
        kind,
        Arc::new(move |event: &RemoteEvent| {
            let _ = tx.send(event.clone());
        }),
    );
    rx
}

async fn next(rx: &mut mpsc::UnboundedReceiver<RemoteEvent>) -> RemoteEvent {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for relay event")
        .expect("handler channel closed")
}

async fn silent(rx: &mut mpsc::UnboundedReceiver<RemoteEvent>) -> bool {
    !matches!(
        timeout(Duration::from_millis(100), rx.recv()).await,
        Ok(Some(_))
    )
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let url = start_test_server().await;

    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_ok(), "Should connect to relay");
}

#[tokio::test]
async fn test_client_connects() {
    let url = start_test_server().await;
    let client = RelayClient::default();

    client.connect(&url).await.unwrap();
    assert_eq!(client.connection_state(), ConnectionState::Connected);
    assert!(client.is_connected());
}

#[tokio::test]
async fn test_two_clients_share_room() {
    let url = start_test_server().await;
    let alice = RelayClient::default();
    let bob = RelayClient::default();
    alice.connect(&url).await.unwrap();
    bob.connect(&url).await.unwrap();
    let mut alice_counts = collect(&alice, EventKind::UserCount);
    let mut bob_counts = collect(&bob, EventKind::UserCount);
    let mut alice_clears = collect(&alice, EventKind::ClearCanvas);
    let mut bob_clears = collect(&bob, EventKind::ClearCanvas);

    alice.emit(RemoteEvent::JoinRoom(room("lobby"))).unwrap();
    assert_eq!(next(&mut alice_counts).await, user_count("lobby", 1));

    bob.emit(RemoteEvent::JoinRoom(room("lobby"))).unwrap();
    assert_eq!(next(&mut bob_counts).await, user_count("lobby", 2));
    assert_eq!(next(&mut alice_counts).await, user_count("lobby", 2));

    let clear = RemoteEvent::ClearCanvas { room_id: room("lobby") };
    alice.emit(clear.clone()).unwrap();
    assert_eq!(next(&mut bob_clears).await, clear);
    assert!(silent(&mut alice_clears).await, "Sender must not get its own clear");
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let url = start_test_server().await;
    let alice = RelayClient::default();
    let bob = RelayClient::default();
    alice.connect(&url).await.unwrap();
    bob.connect(&url).await.unwrap();
    let mut alice_counts = collect(&alice, EventKind::UserCount);
    let mut bob_counts = collect(&bob, EventKind::UserCount);
    let mut bob_clears = collect(&bob, EventKind::ClearCanvas);

    alice.emit(RemoteEvent::JoinRoom(room("lobby"))).unwrap();
    bob.emit(RemoteEvent::JoinRoom(room("studio"))).unwrap();
    assert_eq!(next(&mut alice_counts).await, user_count("lobby", 1));
    assert_eq!(next(&mut bob_counts).await, user_count("studio", 1));

    alice
        .emit(RemoteEvent::ClearCanvas { room_id: room("lobby") })
        .unwrap();
    assert!(silent(&mut bob_clears).await);
}

#[tokio::test]
async fn test_draw_passes_through_untouched() {
    let url = start_test_server().await;
    let alice = RelayClient::default();
    let bob = RelayClient::default();
    alice.connect(&url).await.unwrap();
    bob.connect(&url).await.unwrap();
    let mut alice_counts = collect(&alice, EventKind::UserCount);
    let mut bob_counts = collect(&bob, EventKind::UserCount);
    let mut bob_draws = collect(&bob, EventKind::Draw);

    alice.emit(RemoteEvent::JoinRoom(room("lobby"))).unwrap();
    next(&mut alice_counts).await;
    bob.emit(RemoteEvent::JoinRoom(room("lobby"))).unwrap();
    next(&mut bob_counts).await;

    let draw = RemoteEvent::Draw {
        room_id: room("lobby"),
        segment: StrokeSegment {
            from: Point::new(0.0, 0.0),
            to: Point::new(10.0, 12.5),
            color: "#336699".into(),
            stroke_width: 4.0,
            tool: Tool::Pencil,
        },
    };
    alice.emit(draw.clone()).unwrap();
    assert_eq!(next(&mut bob_draws).await, draw);
}

#[tokio::test]
async fn test_queued_join_replayed_on_connect() {
    let url = start_test_server().await;
    let client = RelayClient::default();
    let mut counts = collect(&client, EventKind::UserCount);

    // Emitted before any connection exists.
    client.emit(RemoteEvent::JoinRoom(room("lobby"))).unwrap();
    assert_eq!(client.offline_queue_len(), 1);

    client.connect(&url).await.unwrap();
    assert_eq!(client.offline_queue_len(), 0);
    assert_eq!(next(&mut counts).await, user_count("lobby", 1));
}

#[tokio::test]
async fn test_disconnect_updates_remaining_members() {
    let url = start_test_server().await;
    let alice = RelayClient::default();
    let bob = RelayClient::default();
    alice.connect(&url).await.unwrap();
    bob.connect(&url).await.unwrap();
    let mut alice_counts = collect(&alice, EventKind::UserCount);
    let mut bob_counts = collect(&bob, EventKind::UserCount);

    alice.emit(RemoteEvent::JoinRoom(room("lobby"))).unwrap();
    next(&mut alice_counts).await;
    bob.emit(RemoteEvent::JoinRoom(room("lobby"))).unwrap();
    next(&mut bob_counts).await;
    next(&mut alice_counts).await;

    bob.disconnect();
    assert_eq!(next(&mut alice_counts).await, user_count("lobby", 1));
}

#[tokio::test]
async fn test_garbage_frames_ignored() {
    let url = start_test_server().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    ws.send(Message::Binary(vec![0xFF, 0xFE, 0xFD].into()))
        .await
        .unwrap();

    // The connection survives and still serves joins.
    let join = RemoteEvent::JoinRoom(room("lobby")).encode().unwrap();
    ws.send(Message::Binary(join.into())).await.unwrap();

    let reply = timeout(Duration::from_secs(2), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    match reply {
        Message::Binary(data) => {
            assert_eq!(RemoteEvent::decode(&data).unwrap(), user_count("lobby", 1));
        }
        other => panic!("Expected binary frame, got {other:?}"),
    }
}

#[tokio::test]
async fn test_emit_without_queue_fails_offline() {
    let client = RelayClient::new(ClientConfig {
        offline_queue_capacity: 0,
    });
    let result = client.emit(RemoteEvent::JoinRoom(room("lobby")));
    assert!(result.is_err());
    assert_eq!(client.offline_queue_len(), 0);
}

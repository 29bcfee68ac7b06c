//! Relay server with room-based event routing.
//!
//! Architecture:
//! ```text
//! WebSocket peer ──ws──► handle_connection ──┐
//!                                            ├──► serve_peer ──► RoomManager
//! in-process peer ──mpsc────────────────────┘        │             │
//!                                                    │      BroadcastGroup per room
//!                                                    ◄── forwarder per joined room
//! ```
//!
//! Every peer, whatever its transport, is served by [`RelayServer::serve_peer`]:
//! a loop over inbound events plus one forwarder task per joined room that
//! copies room frames to the peer, skipping the peer's own.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use super::broadcast::{FrameReceiver, RoomManager};
use super::client::{ClientConfig, RelayClient};
use crate::protocol::{RemoteEvent, RoomId};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum peers per room
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
        }
    }
}

impl ServerConfig {
    /// Defaults overlaid with `SKETCHROOM_BIND`, `SKETCHROOM_MAX_PEERS` and
    /// `SKETCHROOM_BROADCAST_CAPACITY`.
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env), reading variables through `lookup`.
    /// Unparsable values are logged and ignored.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(addr) = lookup("SKETCHROOM_BIND") {
            config.bind_addr = addr;
        }
        if let Some(n) = parse_var(&lookup, "SKETCHROOM_MAX_PEERS") {
            config.max_peers_per_room = n;
        }
        if let Some(n) = parse_var(&lookup, "SKETCHROOM_BROADCAST_CAPACITY") {
            config.broadcast_capacity = n;
        }
        config
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("Ignoring invalid {key}={raw:?}");
            None
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    /// Events received from peers
    pub total_events: u64,
    /// Events fanned out to a room
    pub relayed_events: u64,
    pub active_rooms: usize,
}

struct RelayState {
    config: ServerConfig,
    rooms: RoomManager,
    stats: RwLock<ServerStats>,
}

/// The relay. Cheap to clone; clones serve the same rooms.
#[derive(Clone)]
pub struct RelayServer {
    state: Arc<RelayState>,
}

impl RelayServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            state: Arc::new(RelayState {
                rooms: RoomManager::new(config.broadcast_capacity),
                config,
                stats: RwLock::new(ServerStats::default()),
            }),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.state.config.bind_addr).await?;
        log::info!("Relay listening on {}", self.state.config.bind_addr);
        self.serve(listener).await
    }

    /// Accept WebSocket connections on an already bound listener.
    pub async fn serve(
        &self,
        listener: TcpListener,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Bridge one WebSocket connection to [`serve_peer`](Self::serve_peer).
    async fn handle_connection(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {addr}");

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<RemoteEvent>();
        let server = self.clone();
        let peer = tokio::spawn(async move {
            server
                .serve_peer(Uuid::new_v4(), inbound_rx, outbound_tx)
                .await
        });

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => match RemoteEvent::decode(&data) {
                            Ok(event) => {
                                if inbound_tx.send(event).is_err() {
                                    break;
                                }
                            }
                            Err(e) => log::warn!("Failed to decode event from {addr}: {e}"),
                        },
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }
                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }
                        _ => {}
                    }
                }

                event = outbound_rx.recv() => {
                    match event {
                        Some(event) => {
                            let encoded = event.encode()?;
                            ws_sender.send(Message::Binary(encoded.into())).await?;
                        }
                        None => break,
                    }
                }
            }
        }

        // Closing the inbound side ends the peer loop, which leaves its rooms.
        drop(inbound_tx);
        peer.await?;
        Ok(())
    }

    /// Serve one peer until `inbound` closes.
    ///
    /// Events the peer sends arrive on `inbound`; events for the peer are
    /// pushed to `outbound`.
    pub async fn serve_peer(
        &self,
        peer_id: Uuid,
        mut inbound: mpsc::UnboundedReceiver<RemoteEvent>,
        outbound: mpsc::UnboundedSender<RemoteEvent>,
    ) {
        {
            let mut s = self.state.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }
        log::debug!("Peer {peer_id} connected");

        let mut memberships: HashMap<RoomId, JoinHandle<()>> = HashMap::new();

        while let Some(event) = inbound.recv().await {
            self.state.stats.write().await.total_events += 1;

            match event {
                RemoteEvent::JoinRoom(room_id) => {
                    if memberships.contains_key(&room_id) {
                        log::debug!("Peer {peer_id} already in room {room_id}");
                        continue;
                    }
                    let max_peers = self.state.config.max_peers_per_room;
                    match self.state.rooms.join(&room_id, peer_id, max_peers).await {
                        Some((_, rx)) => {
                            let forwarder = tokio::spawn(forward(rx, peer_id, outbound.clone()));
                            memberships.insert(room_id.clone(), forwarder);
                            log::info!("Peer {peer_id} joined room {room_id}");
                        }
                        None => {
                            log::warn!("Room {room_id} is full, refusing peer {peer_id}");
                        }
                    }
                    self.refresh_room_count().await;
                }

                RemoteEvent::UserCount { room_id, .. } => {
                    log::debug!("Ignoring user-count for {room_id} sent by peer {peer_id}");
                }

                event => {
                    let room_id = event.room_id().clone();
                    if !memberships.contains_key(&room_id) {
                        log::debug!(
                            "Dropping {} from peer {peer_id}: not in room {room_id}",
                            event.kind().name()
                        );
                        continue;
                    }
                    if let Some(group) = self.state.rooms.get(&room_id).await {
                        log::trace!("Relaying {} in room {room_id}", event.kind().name());
                        group.broadcast(peer_id, event);
                        self.state.stats.write().await.relayed_events += 1;
                    }
                }
            }
        }

        // Cleanup: leave every joined room
        for (room_id, forwarder) in memberships {
            forwarder.abort();
            if let Some(remaining) = self.state.rooms.leave(&room_id, &peer_id).await {
                log::info!("Peer {peer_id} left room {room_id} ({remaining} remaining)");
            }
        }

        let room_count = self.state.rooms.room_count().await;
        let mut s = self.state.stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
        s.active_rooms = room_count;
        log::debug!("Peer {peer_id} disconnected");
    }

    /// Attach `client` to this relay in-process, without a socket.
    ///
    /// Must be called from within a tokio runtime.
    pub fn attach_local(&self, client: &RelayClient) {
        let (to_server_tx, to_server_rx) = mpsc::unbounded_channel();
        let (from_server_tx, from_server_rx) = mpsc::unbounded_channel();
        let server = self.clone();
        tokio::spawn(async move {
            server
                .serve_peer(Uuid::new_v4(), to_server_rx, from_server_tx)
                .await
        });
        client.attach(to_server_tx, from_server_rx);
    }

    /// A new client connected to this relay in-process.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect_local(&self) -> RelayClient {
        let client = RelayClient::new(ClientConfig::default());
        self.attach_local(&client);
        client
    }

    async fn refresh_room_count(&self) {
        let room_count = self.state.rooms.room_count().await;
        self.state.stats.write().await.active_rooms = room_count;
    }

    pub async fn stats(&self) -> ServerStats {
        self.state.stats.read().await.clone()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.state.config
    }

    pub fn bind_addr(&self) -> &str {
        &self.state.config.bind_addr
    }

    pub fn room_manager(&self) -> &RoomManager {
        &self.state.rooms
    }
}

/// Copy room frames to one peer, skipping the frames it sent itself.
async fn forward(
    mut rx: FrameReceiver,
    peer_id: Uuid,
    outbound: mpsc::UnboundedSender<RemoteEvent>,
) {
    loop {
        match rx.recv().await {
            Ok(frame) => {
                // Skip own events
                if frame.origin == peer_id {
                    continue;
                }
                if outbound.send(frame.event.clone()).is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                log::warn!("Peer {peer_id} lagged by {n} frames");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

//! Relay client: the shared connection behind the Remote Room Channel.
//!
//! Provides:
//! - Connection lifecycle (WebSocket connect, in-process attach, disconnect)
//! - Event-typed handler dispatch for inbound events
//! - Offline queue for events emitted before the connection is up
//! - Room memberships, rejoined on every (re)connect
//!
//! One `RelayClient` (and its clones) is one physical connection; every
//! room session of the process registers its own handlers on it.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::{EventKind, RemoteEvent, RoomId};
use crate::remote::{EventHandler, HandlerId, HandlerRegistry, RelayConnection, RelayError};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Events kept while disconnected; 0 disables queueing.
    pub offline_queue_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            offline_queue_capacity: 1024,
        }
    }
}

/// Events emitted while disconnected, replayed in order on connect.
pub struct OfflineQueue {
    queue: VecDeque<RemoteEvent>,
    max_size: usize,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue an event for later replay. Returns `false` when full.
    pub fn enqueue(&mut self, event: RemoteEvent) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(event);
        true
    }

    pub fn drain(&mut self) -> Vec<RemoteEvent> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn capacity(&self) -> usize {
        self.max_size
    }
}

struct ClientInner {
    id: Uuid,
    state: RwLock<ConnectionState>,
    handlers: HandlerRegistry,
    /// Bumped by every attach, so a stale reader cannot reset a newer link.
    generation: AtomicU64,
    /// Lock order: `outgoing`, then `joined_rooms`, then `offline_queue`.
    outgoing: Mutex<Option<mpsc::UnboundedSender<RemoteEvent>>>,
    /// Rooms this connection asked to join, in join order.
    joined_rooms: Mutex<Vec<RoomId>>,
    offline_queue: Mutex<OfflineQueue>,
}

/// Connection to a relay. Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct RelayClient {
    inner: Arc<ClientInner>,
}

impl Default for RelayClient {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}

impl RelayClient {
    /// Create a disconnected client.
    pub fn new(config: ClientConfig) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                id: Uuid::new_v4(),
                state: RwLock::new(ConnectionState::Disconnected),
                handlers: HandlerRegistry::new(),
                generation: AtomicU64::new(0),
                outgoing: Mutex::new(None),
                joined_rooms: Mutex::new(Vec::new()),
                offline_queue: Mutex::new(OfflineQueue::new(config.offline_queue_capacity)),
            }),
        }
    }

    /// Connect to a relay over WebSocket.
    ///
    /// Spawns the writer and reader tasks, then replays the offline queue.
    pub async fn connect(&self, url: &str) -> Result<(), RelayError> {
        *self.inner.state.write() = ConnectionState::Connecting;

        let (ws_stream, _) = match tokio_tungstenite::connect_async(url).await {
            Ok(connected) => connected,
            Err(e) => {
                *self.inner.state.write() = ConnectionState::Disconnected;
                log::warn!("Relay client {}: connecting to {url} failed: {e}", self.inner.id);
                return Err(RelayError::ConnectionFailed(e.to_string()));
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (to_server_tx, mut to_server_rx) = mpsc::unbounded_channel::<RemoteEvent>();
        let (from_server_tx, from_server_rx) = mpsc::unbounded_channel();

        // Writer task: forward outgoing events to the WebSocket
        tokio::spawn(async move {
            while let Some(event) = to_server_rx.recv().await {
                let encoded = match event.encode() {
                    Ok(encoded) => encoded,
                    Err(e) => {
                        log::error!("Dropping unencodable {}: {e}", event.kind().name());
                        continue;
                    }
                };
                if ws_writer.send(Message::Binary(encoded.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        // Reader task: decode incoming frames
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => match RemoteEvent::decode(&data) {
                        Ok(event) => {
                            if from_server_tx.send(event).is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("Ignoring undecodable relay frame: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
        });

        self.attach(to_server_tx, from_server_rx);
        log::info!("Relay client {} connected to {url}", self.inner.id);
        Ok(())
    }

    /// Wire the client to a transport: `to_server` carries emitted events,
    /// `from_server` delivers inbound ones.
    ///
    /// The relay sees every attach as a new peer, so the rooms joined so far
    /// are joined again before the offline queue is replayed.
    pub(crate) fn attach(
        &self,
        to_server: mpsc::UnboundedSender<RemoteEvent>,
        mut from_server: mpsc::UnboundedReceiver<RemoteEvent>,
    ) {
        let generation = {
            let mut outgoing = self.inner.outgoing.lock();
            let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
            let joined_rooms = self.inner.joined_rooms.lock();
            let queued = self.inner.offline_queue.lock().drain();

            // Joins still in the queue are sent with it
            let queued_joins: HashSet<&RoomId> = queued
                .iter()
                .filter_map(|event| match event {
                    RemoteEvent::JoinRoom(room_id) => Some(room_id),
                    _ => None,
                })
                .collect();
            let rejoins: Vec<RemoteEvent> = joined_rooms
                .iter()
                .filter(|room_id| !queued_joins.contains(room_id))
                .map(|room_id| RemoteEvent::JoinRoom(room_id.clone()))
                .collect();
            drop(joined_rooms);

            if !rejoins.is_empty() {
                log::info!("Rejoining {} rooms", rejoins.len());
            }
            if !queued.is_empty() {
                log::info!("Replaying {} queued events", queued.len());
            }
            for event in rejoins.into_iter().chain(queued) {
                if to_server.send(event).is_err() {
                    break;
                }
            }
            *outgoing = Some(to_server);
            *self.inner.state.write() = ConnectionState::Connected;
            generation
        };

        let inner = self.inner.clone();
        tokio::spawn(async move {
            while let Some(event) = from_server.recv().await {
                inner.handlers.dispatch(&event);
            }

            // Connection lost, unless a newer one already replaced it
            let mut outgoing = inner.outgoing.lock();
            if inner.generation.load(Ordering::SeqCst) == generation {
                *outgoing = None;
                *inner.state.write() = ConnectionState::Disconnected;
                log::info!("Relay client {} disconnected", inner.id);
            }
        });
    }

    /// Drop the connection. Later emits are queued again.
    pub fn disconnect(&self) {
        let mut outgoing = self.inner.outgoing.lock();
        if outgoing.take().is_some() {
            log::info!("Relay client {} disconnecting", self.inner.id);
        }
        *self.inner.state.write() = ConnectionState::Disconnected;
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.inner.state.read()
    }

    /// Rooms that will be joined again on the next connect.
    pub fn joined_rooms(&self) -> Vec<RoomId> {
        self.inner.joined_rooms.lock().clone()
    }

    pub fn offline_queue_len(&self) -> usize {
        self.inner.offline_queue.lock().len()
    }

    /// Number of handlers registered for `kind`, across all sessions.
    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.inner.handlers.handler_count(kind)
    }
}

impl RelayConnection for RelayClient {
    fn emit(&self, mut event: RemoteEvent) -> Result<(), RelayError> {
        let mut outgoing = self.inner.outgoing.lock();

        if let RemoteEvent::JoinRoom(room_id) = &event {
            let mut joined_rooms = self.inner.joined_rooms.lock();
            if !joined_rooms.contains(room_id) {
                joined_rooms.push(room_id.clone());
            }
        }

        if let Some(tx) = outgoing.as_ref() {
            match tx.send(event) {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(returned)) => event = returned,
            }
            // Transport gone; fall back to queueing
            *outgoing = None;
            *self.inner.state.write() = ConnectionState::Disconnected;
        }

        let mut queue = self.inner.offline_queue.lock();
        if queue.capacity() == 0 {
            return Err(RelayError::NotConnected);
        }
        if !queue.enqueue(event) {
            return Err(RelayError::QueueFull);
        }
        log::trace!("Relay client {}: queued event while offline", self.inner.id);
        Ok(())
    }

    fn on(&self, kind: EventKind, handler: EventHandler) -> HandlerId {
        self.inner.handlers.on(kind, handler)
    }

    fn off(&self, kind: EventKind, id: HandlerId) -> bool {
        self.inner.handlers.off(kind, id)
    }

    fn is_connected(&self) -> bool {
        *self.inner.state.read() == ConnectionState::Connected
    }
}

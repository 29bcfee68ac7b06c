//! Per-room fan-out with backpressure.
//!
//! Every room owns one tokio broadcast channel. Each member holds its own
//! receiver that buffers up to `capacity` frames; a member that falls
//! further behind skips frames instead of slowing the room down.
//!
//! Frames carry their origin so forwarders can drop the sender's own
//! events. Membership changes announce the new `user-count` with
//! [`Uuid::nil`] as origin, which no member filters out.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{RemoteEvent, RoomId};

/// One relayed event, tagged with the connection that produced it.
#[derive(Debug)]
pub struct RoomFrame {
    pub origin: Uuid,
    pub event: RemoteEvent,
}

pub type FrameReceiver = broadcast::Receiver<Arc<RoomFrame>>;

/// Statistics for monitoring room health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub frames_sent: u64,
    pub active_peers: usize,
}

/// Fan-out group for a single room.
pub struct BroadcastGroup {
    room_id: RoomId,
    sender: broadcast::Sender<Arc<RoomFrame>>,
    peers: RwLock<HashSet<Uuid>>,
    capacity: usize,
    frames_sent: AtomicU64,
}

impl BroadcastGroup {
    pub fn new(room_id: RoomId, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            room_id,
            sender,
            peers: RwLock::new(HashSet::new()),
            capacity,
            frames_sent: AtomicU64::new(0),
        }
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Add a member and announce the new count to everyone, the newcomer
    /// included.
    ///
    /// Returns `None` when the room already holds `max_peers` members.
    pub async fn add_peer(&self, peer_id: Uuid, max_peers: usize) -> Option<FrameReceiver> {
        let mut peers = self.peers.write().await;
        if !peers.contains(&peer_id) && peers.len() >= max_peers {
            return None;
        }
        peers.insert(peer_id);
        let rx = self.sender.subscribe();
        // Announced under the lock so counts reach members in join order.
        self.announce_count(peers.len());
        Some(rx)
    }

    /// Remove a member and announce the new count. Returns the remaining
    /// member count, or `None` if it was not a member.
    pub async fn remove_peer(&self, peer_id: &Uuid) -> Option<usize> {
        let mut peers = self.peers.write().await;
        if !peers.remove(peer_id) {
            return None;
        }
        if !peers.is_empty() {
            self.announce_count(peers.len());
        }
        Some(peers.len())
    }

    fn announce_count(&self, count: usize) {
        let event = RemoteEvent::UserCount {
            room_id: self.room_id.clone(),
            count: u32::try_from(count).unwrap_or(u32::MAX),
        };
        self.broadcast(Uuid::nil(), event);
    }

    /// Send an event to every member. Filtering the origin is the
    /// receiver's job. Returns the number of receivers reached.
    pub fn broadcast(&self, origin: Uuid, event: RemoteEvent) -> usize {
        let count = self
            .sender
            .send(Arc::new(RoomFrame { origin, event }))
            .unwrap_or(0);
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn has_peer(&self, peer_id: &Uuid) -> bool {
        self.peers.read().await.contains(peer_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            active_peers: self.peers.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Maps room ids to broadcast groups.
///
/// Rooms are created by the first join and removed with their last member.
/// Both happen under the room table's write lock, so a join never lands in
/// a room that is being dropped.
pub struct RoomManager {
    rooms: RwLock<HashMap<RoomId, Arc<BroadcastGroup>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Add `peer_id` to `room_id`, creating the room if needed.
    pub async fn join(
        &self,
        room_id: &RoomId,
        peer_id: Uuid,
        max_peers: usize,
    ) -> Option<(Arc<BroadcastGroup>, FrameReceiver)> {
        let mut rooms = self.rooms.write().await;
        let room = rooms
            .entry(room_id.clone())
            .or_insert_with(|| {
                log::info!("Room {room_id} created");
                Arc::new(BroadcastGroup::new(room_id.clone(), self.default_capacity))
            })
            .clone();

        match room.add_peer(peer_id, max_peers).await {
            Some(rx) => Some((room, rx)),
            None => {
                // A freshly created room is never full unless max_peers is 0.
                if room.peer_count().await == 0 {
                    rooms.remove(room_id);
                }
                None
            }
        }
    }

    /// Remove `peer_id` from `room_id`, dropping the room once empty.
    /// Returns the remaining member count.
    pub async fn leave(&self, room_id: &RoomId, peer_id: &Uuid) -> Option<usize> {
        let mut rooms = self.rooms.write().await;
        let room = rooms.get(room_id)?.clone();
        let remaining = room.remove_peer(peer_id).await?;
        if remaining == 0 {
            rooms.remove(room_id);
            log::info!("Room {room_id} removed (empty)");
        }
        Some(remaining)
    }

    pub async fn get(&self, room_id: &RoomId) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_rooms(&self) -> Vec<RoomId> {
        self.rooms.read().await.keys().cloned().collect()
    }
}

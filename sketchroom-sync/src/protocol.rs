//! Messages exchanged on the two synchronization paths.
//!
//! ```text
//!  toolbar ──► SyncMessage ──► LocalSyncChannel ──► sibling tabs  (same device)
//!          └─► RemoteEvent ──► RelayConnection  ──► relay ──► other participants
//! ```
//!
//! Local messages keep the JSON shape the browser tabs exchange:
//!
//! ```text
//! {"type":"color-change","data":{"color":"red"}}
//! {"type":"stroke-change","data":{"strokeWidth":4}}
//! {"type":"tool-change","data":{"tool":"eraser"}}
//! {"type":"clear-canvas"}
//! ```
//!
//! Relay events travel as bincode-encoded [`RemoteEvent`] frames.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::tool_state::Tool;

/// Opaque name of a shared drawing session.
///
/// Never empty; immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomId(String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Result<Self, ProtocolError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(ProtocolError::InvalidRoomId);
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RoomId {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RoomId> for String {
    fn from(id: RoomId) -> Self {
        id.0
    }
}

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ───────────────────────────────────────────────────────────────────
// Local path
// ───────────────────────────────────────────────────────────────────

/// Tool-state mirror message published to sibling tabs.
///
/// Exactly one `type` per message; the `data` shape follows the `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum SyncMessage {
    ColorChange {
        color: String,
    },
    StrokeChange {
        #[serde(rename = "strokeWidth")]
        stroke_width: f32,
    },
    ToolChange {
        tool: Tool,
    },
    ClearCanvas,
}

impl SyncMessage {
    /// The `type` tag as it appears on the wire.
    pub fn type_name(&self) -> &'static str {
        match self {
            SyncMessage::ColorChange { .. } => "color-change",
            SyncMessage::StrokeChange { .. } => "stroke-change",
            SyncMessage::ToolChange { .. } => "tool-change",
            SyncMessage::ClearCanvas => "clear-canvas",
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(json).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

// ───────────────────────────────────────────────────────────────────
// Remote path
// ───────────────────────────────────────────────────────────────────

/// A point in canvas coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// One drawn segment, relayed as-is to the renderer of other participants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrokeSegment {
    pub from: Point,
    pub to: Point,
    pub color: String,
    pub stroke_width: f32,
    pub tool: Tool,
}

/// Pointer position of one participant, relayed to cursor broadcasters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub peer_id: Uuid,
    pub position: Point,
}

/// Event exchanged with the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RemoteEvent {
    /// Outbound: add this connection to a room.
    JoinRoom(RoomId),
    /// Outbound and inbound: wipe the canvas of every participant.
    ClearCanvas { room_id: RoomId },
    /// Inbound: number of connections currently in the room.
    ///
    /// Browser relays send `user-count` as a bare integer. Here it also names
    /// its room, because one connection can carry several rooms and each
    /// session must only apply its own room's count.
    UserCount { room_id: RoomId, count: u32 },
    /// Stroke data owned by the renderer; passed through untouched.
    Draw { room_id: RoomId, segment: StrokeSegment },
    /// Cursor data owned by the cursor broadcaster; passed through untouched.
    Cursor {
        room_id: RoomId,
        cursor: CursorPosition,
    },
}

/// Event names, used to register handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    JoinRoom,
    ClearCanvas,
    UserCount,
    Draw,
    Cursor,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        EventKind::JoinRoom,
        EventKind::ClearCanvas,
        EventKind::UserCount,
        EventKind::Draw,
        EventKind::Cursor,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            EventKind::JoinRoom => "join-room",
            EventKind::ClearCanvas => "clear-canvas",
            EventKind::UserCount => "user-count",
            EventKind::Draw => "draw",
            EventKind::Cursor => "cursor",
        }
    }

    pub fn from_name(name: &str) -> Result<Self, ProtocolError> {
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.name() == name)
            .ok_or_else(|| ProtocolError::UnknownEvent(name.to_string()))
    }
}

impl RemoteEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            RemoteEvent::JoinRoom(_) => EventKind::JoinRoom,
            RemoteEvent::ClearCanvas { .. } => EventKind::ClearCanvas,
            RemoteEvent::UserCount { .. } => EventKind::UserCount,
            RemoteEvent::Draw { .. } => EventKind::Draw,
            RemoteEvent::Cursor { .. } => EventKind::Cursor,
        }
    }

    /// The room this event is scoped to.
    pub fn room_id(&self) -> &RoomId {
        match self {
            RemoteEvent::JoinRoom(room_id)
            | RemoteEvent::ClearCanvas { room_id }
            | RemoteEvent::UserCount { room_id, .. }
            | RemoteEvent::Draw { room_id, .. }
            | RemoteEvent::Cursor { room_id, .. } => room_id,
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (event, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(event)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidRoomId,
    UnknownEvent(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidRoomId => write!(f, "Room id must not be empty"),
            Self::UnknownEvent(name) => write!(f, "Unknown event: {name}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

//! # sketchroom-sync — dual-path whiteboard synchronization
//!
//! Keeps a shared whiteboard room consistent over two independent paths:
//! the relay (every participant of the room) and the local sync channel
//! (sibling tabs of the same device).
//!
//! ## Architecture
//!
//! ```text
//!  tab A                                           tab B (same device)
//! ┌──────────────┐   LocalSyncHub topic     ┌──────────────┐
//! │ RoomSession  │ ◄──────────────────────► │ RoomSession  │
//! │  ToolStore   │   tool + clear mirrors   │  ToolStore   │
//! └──────┬───────┘                          └──────┬───────┘
//!        │ join-room / clear-canvas                │
//!        ▼                                         ▼
//! ┌──────────────┐      WebSocket / mpsc    ┌──────────────┐
//! │ RelayClient  │ ◄──────────────────────► │ RelayServer  │
//! │ (shared)     │     bincode RemoteEvent  │ rooms fan-out│
//! └──────────────┘      user-count ◄────────┴──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Local `SyncMessage` (JSON) and relay `RemoteEvent` (bincode)
//! - [`tool_state`] — Locally authoritative color, stroke width and tool
//! - [`local_channel`] — Same-device, cross-tab publish/subscribe
//! - [`remote`] — The relay connection interface consumed by sessions
//! - [`session`] — Room Session Controller
//! - [`relay`] — Relay server and client

pub mod local_channel;
pub mod protocol;
pub mod relay;
pub mod remote;
pub mod session;
pub mod tool_state;

// Re-exports for convenience
pub use local_channel::{LocalChannelError, LocalSyncChannel, LocalSyncHub, TopicScope};
pub use protocol::{
    CursorPosition, EventKind, Point, ProtocolError, RemoteEvent, RoomId, StrokeSegment,
    SyncMessage,
};
pub use relay::{ClientConfig, ConnectionState, RelayClient, RelayServer, ServerConfig, ServerStats};
pub use remote::{EventHandler, HandlerId, HandlerRegistry, RelayConnection, RelayError};
pub use session::{JoinState, RoomSession, SessionConfig, SessionError};
pub use tool_state::{Tool, ToolPatch, ToolState, ToolStateError, ToolStore};

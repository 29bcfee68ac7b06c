//! The relay collaborator: a room-routing server and the client connection
//! the core talks to through [`RelayConnection`](crate::remote::RelayConnection).

pub mod broadcast;
pub mod client;
pub mod server;

pub use broadcast::{BroadcastGroup, BroadcastStats, RoomFrame, RoomManager};
pub use client::{ClientConfig, ConnectionState, OfflineQueue, RelayClient};
pub use server::{RelayServer, ServerConfig, ServerStats};

//! The Remote Room Channel as seen by the core.
//!
//! The core never creates or owns the relay connection; it is handed an
//! `Arc<dyn RelayConnection>` and only ever calls `emit`, `on` and `off`.
//! One physical connection is shared by every session of the process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::protocol::{EventKind, RemoteEvent};

/// Callback invoked for each inbound event of the kind it was registered for.
pub type EventHandler = Arc<dyn Fn(&RemoteEvent) + Send + Sync>;

/// Token returned by [`RelayConnection::on`], used to detach the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// A bidirectional, event-typed connection to the relay.
pub trait RelayConnection: Send + Sync {
    /// Send an event to the relay.
    ///
    /// Implementations never block; an event that cannot be sent now is
    /// either buffered or rejected with an error.
    fn emit(&self, event: RemoteEvent) -> Result<(), RelayError>;

    /// Register `handler` for inbound events of `kind`.
    fn on(&self, kind: EventKind, handler: EventHandler) -> HandlerId;

    /// Detach a handler. Returns `false` if it was not registered.
    fn off(&self, kind: EventKind, id: HandlerId) -> bool;

    fn is_connected(&self) -> bool;
}

/// Handler bookkeeping shared by relay connection implementations.
#[derive(Default)]
pub struct HandlerRegistry {
    next_id: AtomicU64,
    handlers: RwLock<HashMap<EventKind, Vec<(HandlerId, EventHandler)>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, kind: EventKind, handler: EventHandler) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.write().entry(kind).or_default().push((id, handler));
        log::trace!("Handler {id:?} attached to {}", kind.name());
        id
    }

    pub fn off(&self, kind: EventKind, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write();
        let Some(list) = handlers.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(existing, _)| *existing != id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(&kind);
        }
        removed
    }

    /// Invoke every handler registered for the event's kind.
    ///
    /// Handlers run outside the registry lock, so they may call `on`/`off`.
    /// Returns the number of handlers invoked.
    pub fn dispatch(&self, event: &RemoteEvent) -> usize {
        let targets: Vec<EventHandler> = self
            .handlers
            .read()
            .get(&event.kind())
            .map(|list| list.iter().map(|(_, handler)| handler.clone()).collect())
            .unwrap_or_default();
        for handler in &targets {
            handler(event);
        }
        targets.len()
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers.read().get(&kind).map_or(0, Vec::len)
    }
}

/// Relay connection errors.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayError {
    /// No connection yet, and the event could not be buffered.
    NotConnected,
    /// The offline buffer is full.
    QueueFull,
    /// Establishing the connection failed.
    ConnectionFailed(String),
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotConnected => write!(f, "Relay not connected"),
            Self::QueueFull => write!(f, "Relay offline queue full"),
            Self::ConnectionFailed(e) => write!(f, "Relay connection failed: {e}"),
        }
    }
}

impl std::error::Error for RelayError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RoomId;
    use std::sync::atomic::AtomicUsize;

    fn count_event(room: &str, count: u32) -> RemoteEvent {
        RemoteEvent::UserCount {
            room_id: RoomId::new(room).unwrap(),
            count,
        }
    }

    #[test]
    fn test_dispatch_by_kind() {
        let registry = HandlerRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        registry.on(
            EventKind::UserCount,
            Arc::new(move |_: &RemoteEvent| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert_eq!(registry.dispatch(&count_event("lobby", 2)), 1);
        let clear = RemoteEvent::ClearCanvas {
            room_id: RoomId::new("lobby").unwrap(),
        };
        assert_eq!(registry.dispatch(&clear), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_off_detaches_only_that_handler() {
        let registry = HandlerRegistry::new();
        let first = registry.on(EventKind::UserCount, Arc::new(|_: &RemoteEvent| {}));
        let second = registry.on(EventKind::UserCount, Arc::new(|_: &RemoteEvent| {}));
        assert_ne!(first, second);
        assert_eq!(registry.handler_count(EventKind::UserCount), 2);

        assert!(registry.off(EventKind::UserCount, first));
        assert!(!registry.off(EventKind::UserCount, first));
        assert!(!registry.off(EventKind::Draw, second));
        assert_eq!(registry.handler_count(EventKind::UserCount), 1);

        assert!(registry.off(EventKind::UserCount, second));
        assert_eq!(registry.dispatch(&count_event("lobby", 1)), 0);
    }

    #[test]
    fn test_handler_may_detach_itself() {
        let registry = Arc::new(HandlerRegistry::new());
        let slot: Arc<parking_lot::Mutex<Option<HandlerId>>> = Arc::new(parking_lot::Mutex::new(None));

        let reg = registry.clone();
        let own = slot.clone();
        let id = registry.on(
            EventKind::UserCount,
            Arc::new(move |_: &RemoteEvent| {
                if let Some(id) = own.lock().take() {
                    reg.off(EventKind::UserCount, id);
                }
            }),
        );
        *slot.lock() = Some(id);

        assert_eq!(registry.dispatch(&count_event("lobby", 1)), 1);
        assert_eq!(registry.dispatch(&count_event("lobby", 2)), 0);
    }
}

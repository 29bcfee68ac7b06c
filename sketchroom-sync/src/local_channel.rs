//! Same-device, cross-tab publish/subscribe.
//!
//! A [`LocalSyncHub`] stands for the browsing-context group of one device:
//! every tab of the device opens its own [`LocalSyncChannel`] on a topic and
//! the hub fans published messages out to every *other* open handle on that
//! topic. No network is involved.
//!
//! ```text
//!            LocalSyncHub
//!   ┌───────────────────────────────┐
//!   │ "whiteboard-sync:lobby" ──────┼──► tab A handle (skips own msgs)
//!   │        tokio broadcast        ├──► tab B handle
//!   │                               ├──► tab C handle
//!   │ "whiteboard-sync:studio" ─────┼──► tab D handle
//!   └───────────────────────────────┘
//! ```
//!
//! Each subscribed handle owns one listener task that forwards envelopes
//! to its handler slot; replacing the handler swaps the slot in place.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::protocol::{RoomId, SyncMessage};

/// The fixed topic shared by every whiteboard on a device.
pub const DEVICE_TOPIC: &str = "whiteboard-sync";

/// Messages buffered per handle before a slow tab starts skipping.
pub const DEFAULT_CAPACITY: usize = 64;

/// How far cross-tab mirroring reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TopicScope {
    /// Only tabs showing the same room mirror each other.
    #[default]
    Room,
    /// Every whiteboard tab on the device shares one topic, across rooms.
    Device,
}

impl TopicScope {
    pub fn topic(&self, room_id: &RoomId) -> String {
        match self {
            TopicScope::Room => format!("{DEVICE_TOPIC}:{room_id}"),
            TopicScope::Device => DEVICE_TOPIC.to_string(),
        }
    }
}

#[derive(Debug)]
struct Envelope {
    origin: Uuid,
    message: SyncMessage,
}

struct TopicEntry {
    sender: broadcast::Sender<Arc<Envelope>>,
    open_handles: usize,
}

struct HubInner {
    topics: Mutex<HashMap<String, TopicEntry>>,
    capacity: usize,
    available: bool,
}

/// The device-wide bus. Cheap to clone; clones share the same topics.
#[derive(Clone)]
pub struct LocalSyncHub {
    inner: Arc<HubInner>,
}

impl Default for LocalSyncHub {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalSyncHub {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                topics: Mutex::new(HashMap::new()),
                capacity: capacity.max(1),
                available: true,
            }),
        }
    }

    /// A hub for an environment without cross-tab messaging; every `open` fails.
    pub fn unavailable() -> Self {
        Self {
            inner: Arc::new(HubInner {
                topics: Mutex::new(HashMap::new()),
                capacity: DEFAULT_CAPACITY,
                available: false,
            }),
        }
    }

    pub fn is_available(&self) -> bool {
        self.inner.available
    }

    /// Open a new handle on `topic`.
    pub fn open(&self, topic: impl Into<String>) -> Result<LocalSyncChannel, LocalChannelError> {
        if !self.inner.available {
            return Err(LocalChannelError::Unavailable);
        }
        let topic = topic.into();
        if topic.is_empty() {
            return Err(LocalChannelError::InvalidTopic);
        }

        let sender = {
            let mut topics = self.inner.topics.lock();
            let entry = topics.entry(topic.clone()).or_insert_with(|| TopicEntry {
                sender: broadcast::channel(self.inner.capacity).0,
                open_handles: 0,
            });
            entry.open_handles += 1;
            entry.sender.clone()
        };

        let channel = LocalSyncChannel {
            id: Uuid::new_v4(),
            topic,
            hub: self.clone(),
            sender: Some(sender),
            handler: Arc::new(Mutex::new(None)),
            listener: None,
        };
        log::debug!("Opened local channel {} on {}", channel.id, channel.topic);
        Ok(channel)
    }

    /// Number of topics with at least one open handle.
    pub fn topic_count(&self) -> usize {
        self.inner.topics.lock().len()
    }

    /// Number of open handles on `topic`.
    pub fn open_handles(&self, topic: &str) -> usize {
        self.inner
            .topics
            .lock()
            .get(topic)
            .map_or(0, |entry| entry.open_handles)
    }

    fn release(&self, topic: &str) {
        let mut topics = self.inner.topics.lock();
        if let Some(entry) = topics.get_mut(topic) {
            entry.open_handles = entry.open_handles.saturating_sub(1);
            if entry.open_handles == 0 {
                topics.remove(topic);
                log::debug!("Local topic {topic} dropped (no open handles)");
            }
        }
    }
}

type HandlerSlot = Arc<Mutex<Option<Box<dyn FnMut(SyncMessage) + Send>>>>;

/// One tab's handle on a topic.
///
/// Closed explicitly with [`close`](Self::close) or implicitly on drop.
/// A closed handle rejects `publish` and `subscribe` with
/// [`LocalChannelError::Closed`] and never delivers again.
pub struct LocalSyncChannel {
    id: Uuid,
    topic: String,
    hub: LocalSyncHub,
    sender: Option<broadcast::Sender<Arc<Envelope>>>,
    handler: HandlerSlot,
    listener: Option<JoinHandle<()>>,
}

impl LocalSyncChannel {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_none()
    }

    /// Deliver `message` to every other open handle on the topic.
    pub fn publish(&self, message: SyncMessage) -> Result<(), LocalChannelError> {
        let sender = self.sender.as_ref().ok_or(LocalChannelError::Closed)?;
        log::trace!("Local publish {} on {}", message.type_name(), self.topic);
        // Err only means nobody is listening right now.
        let _ = sender.send(Arc::new(Envelope {
            origin: self.id,
            message,
        }));
        Ok(())
    }

    /// Install the message handler, replacing (and detaching) any previous one.
    ///
    /// The first call spawns the listener task, so it needs a running tokio
    /// runtime.
    pub fn subscribe<F>(&mut self, handler: F) -> Result<(), LocalChannelError>
    where
        F: FnMut(SyncMessage) + Send + 'static,
    {
        let sender = self.sender.as_ref().ok_or(LocalChannelError::Closed)?;
        let runtime = match self.listener {
            Some(_) => None,
            None => Some(
                tokio::runtime::Handle::try_current().map_err(|_| LocalChannelError::NoRuntime)?,
            ),
        };

        // The handler must be in place before the listener can receive.
        *self.handler.lock() = Some(Box::new(handler));

        if let Some(runtime) = runtime {
            let rx = sender.subscribe();
            self.listener = Some(runtime.spawn(listen(
                rx,
                self.id,
                self.topic.clone(),
                self.handler.clone(),
            )));
        }
        Ok(())
    }

    /// Detach the handler but keep the handle open.
    pub fn unsubscribe(&mut self) {
        self.handler.lock().take();
    }

    /// Release the handle. Idempotent.
    pub fn close(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
        self.handler.lock().take();
        if self.sender.take().is_some() {
            self.hub.release(&self.topic);
            log::debug!("Closed local channel {} on {}", self.id, self.topic);
        }
    }
}

impl Drop for LocalSyncChannel {
    fn drop(&mut self) {
        self.close();
    }
}

async fn listen(
    mut rx: broadcast::Receiver<Arc<Envelope>>,
    own_id: Uuid,
    topic: String,
    handler: HandlerSlot,
) {
    loop {
        match rx.recv().await {
            Ok(envelope) => {
                // Never deliver to the publisher itself
                if envelope.origin == own_id {
                    continue;
                }
                if let Some(handler) = handler.lock().as_mut() {
                    handler(envelope.message.clone());
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                log::warn!("Local channel {own_id} on {topic} skipped {n} messages");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Local channel errors.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalChannelError {
    /// Cross-tab messaging is not supported here.
    Unavailable,
    /// The handle was closed.
    Closed,
    /// No tokio runtime to run the listener on.
    NoRuntime,
    InvalidTopic,
}

impl std::fmt::Display for LocalChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable => write!(f, "Local sync channel unavailable"),
            Self::Closed => write!(f, "Local sync channel closed"),
            Self::NoRuntime => write!(f, "No async runtime for local sync listener"),
            Self::InvalidTopic => write!(f, "Topic must not be empty"),
        }
    }
}

impl std::error::Error for LocalChannelError {}

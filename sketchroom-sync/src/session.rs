//! Room Session Controller.
//!
//! One [`RoomSession`] per mounted whiteboard. It joins the room once,
//! keeps the user-count read model, and routes tool and clear events
//! between the [`ToolStore`], the local sync channel and the relay.
//!
//! ```text
//!   toolbar ──set_tool_state──► ToolStore ──► local channel (sibling tabs)
//!   toolbar ──request_clear───► relay clear-canvas + local clear-canvas
//!
//!   relay user-count ──┐
//!   sibling tab msg  ──┴──► inbox ──pump / process_next──► handlers
//! ```
//!
//! Relay and local callbacks never touch session state directly: they only
//! enqueue into the inbox, and the owner drains it. All handlers therefore
//! run one at a time on the owner's task.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use crate::local_channel::{LocalSyncChannel, LocalSyncHub, TopicScope};
use crate::protocol::{EventKind, RemoteEvent, RoomId, SyncMessage};
use crate::remote::{HandlerId, RelayConnection};
use crate::tool_state::{ToolPatch, ToolState, ToolStateError, ToolStore};

/// Session settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Reach of cross-tab mirroring.
    pub topic_scope: TopicScope,
    pub initial_tool_state: ToolState,
    /// Count shown before the relay reports one (this tab).
    pub initial_user_count: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            topic_scope: TopicScope::Room,
            initial_tool_state: ToolState::default(),
            initial_user_count: 1,
        }
    }
}

/// Room membership of a session. Moves to `Joined` once and stays there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinState {
    Unjoined,
    Joined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Mounted,
    Unmounted,
}

#[derive(Debug)]
enum SessionInput {
    UserCount(u32),
    Local(SyncMessage),
}

pub struct RoomSession {
    room_id: RoomId,
    config: SessionConfig,
    relay: Arc<dyn RelayConnection>,
    hub: LocalSyncHub,
    join_state: JoinState,
    lifecycle: Lifecycle,
    tools: ToolStore,
    tool_tx: watch::Sender<ToolState>,
    count_tx: watch::Sender<u32>,
    inbox_tx: mpsc::UnboundedSender<SessionInput>,
    inbox_rx: mpsc::UnboundedReceiver<SessionInput>,
    local: Option<LocalSyncChannel>,
    user_count_handler: Option<HandlerId>,
}

impl RoomSession {
    /// Create an unmounted session. Nothing is opened or emitted until
    /// [`mount`](Self::mount).
    pub fn new(
        room_id: RoomId,
        relay: Arc<dyn RelayConnection>,
        hub: LocalSyncHub,
        config: SessionConfig,
    ) -> Self {
        let (tool_tx, _) = watch::channel(config.initial_tool_state.clone());
        let (count_tx, _) = watch::channel(config.initial_user_count);
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        Self {
            tools: ToolStore::new(config.initial_tool_state.clone()),
            room_id,
            config,
            relay,
            hub,
            join_state: JoinState::Unjoined,
            lifecycle: Lifecycle::Created,
            tool_tx,
            count_tx,
            inbox_tx,
            inbox_rx,
            local: None,
            user_count_handler: None,
        }
    }

    /// Setup effect. Safe to re-run while mounted; every step is guarded.
    pub fn mount(&mut self) -> Result<(), SessionError> {
        match self.lifecycle {
            Lifecycle::Unmounted => return Err(SessionError::Unmounted),
            Lifecycle::Created => {
                self.open_local_channel();
                self.lifecycle = Lifecycle::Mounted;
            }
            Lifecycle::Mounted => {}
        }

        if self.user_count_handler.is_none() {
            let inbox = self.inbox_tx.clone();
            let own_room = self.room_id.clone();
            let id = self.relay.on(
                EventKind::UserCount,
                Arc::new(move |event: &RemoteEvent| {
                    if let RemoteEvent::UserCount { room_id, count } = event {
                        if *room_id == own_room {
                            let _ = inbox.send(SessionInput::UserCount(*count));
                        }
                    }
                }),
            );
            self.user_count_handler = Some(id);
        }

        self.join_room();
        Ok(())
    }

    fn open_local_channel(&mut self) {
        let topic = self.config.topic_scope.topic(&self.room_id);
        let mut channel = match self.hub.open(topic) {
            Ok(channel) => channel,
            Err(e) => {
                log::warn!("Room {}: cross-tab mirroring disabled ({e})", self.room_id);
                return;
            }
        };

        let inbox = self.inbox_tx.clone();
        if let Err(e) = channel.subscribe(move |message| {
            let _ = inbox.send(SessionInput::Local(message));
        }) {
            // Still usable for publishing to sibling tabs.
            log::warn!("Room {}: not receiving from sibling tabs ({e})", self.room_id);
        }
        self.local = Some(channel);
    }

    /// Emit `join-room` unless this session already did.
    ///
    /// Returns whether the event was emitted. The session counts as joined
    /// even if the relay refused the emit.
    pub fn join_room(&mut self) -> bool {
        if self.join_state == JoinState::Joined {
            log::trace!("Room {}: already joined", self.room_id);
            return false;
        }
        if let Err(e) = self.relay.emit(RemoteEvent::JoinRoom(self.room_id.clone())) {
            log::debug!("Room {}: join not delivered ({e})", self.room_id);
        }
        self.join_state = JoinState::Joined;
        log::info!("Joined room {}", self.room_id);
        true
    }

    /// Replace the user-count read model. Last value wins.
    pub fn on_user_count(&mut self, count: u32) {
        self.count_tx.send_replace(count);
    }

    /// Handle a message published by a sibling tab.
    ///
    /// Tool changes update the store only; they are never re-published
    /// locally nor sent to the relay. A clear is forwarded to the relay only.
    pub fn on_local_message(&mut self, message: SyncMessage) {
        let applied = match message {
            SyncMessage::ColorChange { color } => self.tools.set_color(&color),
            SyncMessage::StrokeChange { stroke_width } => {
                self.tools.set_stroke_width(stroke_width)
            }
            SyncMessage::ToolChange { tool } => {
                self.tools.set_tool(tool);
                Ok(())
            }
            SyncMessage::ClearCanvas => {
                self.emit_remote_clear();
                return;
            }
        };

        match applied {
            Ok(()) => self.notify_tool_state(),
            Err(e) => log::warn!("Room {}: ignoring sibling tab update ({e})", self.room_id),
        }
    }

    /// User-initiated clear: one relay emit plus one local publish.
    pub fn request_clear(&mut self) {
        self.emit_remote_clear();
        self.publish_local(SyncMessage::ClearCanvas);
    }

    /// User-initiated tool change. Updates the store, then mirrors each
    /// written field to sibling tabs. Never touches the relay.
    pub fn set_tool_state(&mut self, patch: &ToolPatch) -> Result<(), SessionError> {
        let messages = self.tools.apply(patch)?;
        if messages.is_empty() {
            return Ok(());
        }
        self.notify_tool_state();
        for message in messages {
            self.publish_local(message);
        }
        Ok(())
    }

    /// Handle every input already queued. Returns how many were handled.
    pub fn pump(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(input) = self.inbox_rx.try_recv() {
            self.handle(input);
            handled += 1;
        }
        handled
    }

    /// Wait for the next input and handle it.
    ///
    /// The session keeps its own inbox sender, so this only returns once an
    /// input arrives; wrap it in a timeout when nothing may come.
    pub async fn process_next(&mut self) {
        if let Some(input) = self.inbox_rx.recv().await {
            self.handle(input);
        }
    }

    /// Teardown. Detaches the user-count handler and closes the local
    /// channel, each independently of the other. Idempotent.
    pub fn unmount(&mut self) {
        if let Some(id) = self.user_count_handler.take() {
            if !self.relay.off(EventKind::UserCount, id) {
                log::debug!("Room {}: user-count handler already detached", self.room_id);
            }
        }
        if let Some(mut channel) = self.local.take() {
            channel.close();
        }
        if self.lifecycle != Lifecycle::Unmounted {
            log::debug!("Room {}: session unmounted", self.room_id);
        }
        self.lifecycle = Lifecycle::Unmounted;
        while self.inbox_rx.try_recv().is_ok() {}
    }

    fn handle(&mut self, input: SessionInput) {
        if self.lifecycle == Lifecycle::Unmounted {
            return;
        }
        match input {
            SessionInput::UserCount(count) => self.on_user_count(count),
            SessionInput::Local(message) => self.on_local_message(message),
        }
    }

    fn emit_remote_clear(&self) {
        let event = RemoteEvent::ClearCanvas {
            room_id: self.room_id.clone(),
        };
        if let Err(e) = self.relay.emit(event) {
            log::debug!("Room {}: clear not sent to relay ({e})", self.room_id);
        }
    }

    fn publish_local(&self, message: SyncMessage) {
        let Some(channel) = &self.local else {
            return;
        };
        if let Err(e) = channel.publish(message) {
            log::debug!("Room {}: local publish dropped ({e})", self.room_id);
        }
    }

    fn notify_tool_state(&self) {
        self.tool_tx.send_replace(self.tools.state().clone());
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn tool_state(&self) -> &ToolState {
        self.tools.state()
    }

    pub fn user_count(&self) -> u32 {
        *self.count_tx.borrow()
    }

    /// Latest tool state, for the renderer.
    pub fn subscribe_tool_state(&self) -> watch::Receiver<ToolState> {
        self.tool_tx.subscribe()
    }

    pub fn subscribe_user_count(&self) -> watch::Receiver<u32> {
        self.count_tx.subscribe()
    }

    pub fn join_state(&self) -> JoinState {
        self.join_state
    }

    pub fn is_joined(&self) -> bool {
        self.join_state == JoinState::Joined
    }

    pub fn is_mounted(&self) -> bool {
        self.lifecycle == Lifecycle::Mounted
    }

    /// Whether cross-tab mirroring is active for this session.
    pub fn local_sync_available(&self) -> bool {
        self.local.is_some()
    }
}

impl Drop for RoomSession {
    fn drop(&mut self) {
        self.unmount();
    }
}

/// Session errors.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionError {
    /// The session was torn down and cannot be mounted again.
    Unmounted,
    InvalidToolState(ToolStateError),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unmounted => write!(f, "Session already unmounted"),
            Self::InvalidToolState(e) => write!(f, "Invalid tool state: {e}"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<ToolStateError> for SessionError {
    fn from(e: ToolStateError) -> Self {
        SessionError::InvalidToolState(e)
    }
}

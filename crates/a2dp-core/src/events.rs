//! Outward status notifications.
//!
//! Connection-state, playing-state, active-device and codec changes are
//! broadcast to any number of subscribers. Sending never blocks and never
//! fails; events sent with no subscribers are dropped.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use a2dp_types::{CodecStatus, ConnectionState, PeerId, PlayingState};

use crate::config::DEFAULT_EVENT_CAPACITY;

/// Events emitted by the engine.
///
/// All events are serializable for logging and IPC.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new event types
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum EngineEvent {
    /// A peer's connection state changed.
    ConnectionStateChanged {
        peer: PeerId,
        state: ConnectionState,
        previous: ConnectionState,
    },
    /// A peer's audio streaming state changed.
    PlayingStateChanged {
        peer: PeerId,
        state: PlayingState,
        previous: PlayingState,
    },
    /// The active (routed) device changed.
    ActiveDeviceChanged {
        peer: Option<PeerId>,
        previous: Option<PeerId>,
    },
    /// The active device's codec configuration changed.
    CodecConfigChanged { peer: PeerId, status: CodecStatus },
}

impl EngineEvent {
    /// The peer this event concerns, if any.
    pub fn peer(&self) -> Option<PeerId> {
        match self {
            Self::ConnectionStateChanged { peer, .. }
            | Self::PlayingStateChanged { peer, .. }
            | Self::CodecConfigChanged { peer, .. } => Some(*peer),
            Self::ActiveDeviceChanged { peer, .. } => *peer,
        }
    }
}

pub type EventSender = broadcast::Sender<EngineEvent>;

/// A subscription. A receiver that falls more than the configured capacity
/// behind gets `RecvError::Lagged` and skips ahead.
pub type EventReceiver = broadcast::Receiver<EngineEvent>;

/// Shared by every state machine and the arbiter; cloning is cheap.
#[derive(Debug, Clone)]
pub struct EventBroadcaster {
    sender: EventSender,
}

impl EventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    /// Fan `event` out to current subscribers. Dropped if there are none.
    pub fn send(&self, event: EngineEvent) {
        if self.sender.send(event).is_err() {
            trace!("no subscribers for engine event");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

//! Routing of native stack events to state machines.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use a2dp_types::ConnectionState;

use crate::error::Error;
use crate::registry::DeviceRegistry;
use crate::state_machine::{Message, StackEvent};
use crate::traits::{AdapterProperties, NativeStack};

/// What happened to a dispatched event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// Queued on an existing machine.
    Delivered,
    /// A machine was created for an incoming connection and the event queued.
    Created,
    /// The peer is unknown and the event cannot start a connection.
    Ignored,
    /// No machine could be created; the connection was torn down.
    Refused,
}

/// Delivers [`StackEvent`]s to the machine for their peer.
pub struct EventDispatcher {
    registry: Arc<DeviceRegistry>,
    native: Arc<dyn NativeStack>,
    adapter: Arc<dyn AdapterProperties>,
}

impl EventDispatcher {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        native: Arc<dyn NativeStack>,
        adapter: Arc<dyn AdapterProperties>,
    ) -> Self {
        Self {
            registry,
            native,
            adapter,
        }
    }

    /// Route one event.
    ///
    /// Only a CONNECTING or CONNECTED event may create a machine for an
    /// unknown peer. When the registry is full the peer is disconnected at
    /// the native level.
    pub fn dispatch(&self, event: StackEvent) -> DispatchOutcome {
        let peer = event.peer();
        let mut fleet = self.registry.lock();

        if let Some(handle) = fleet.get(&peer) {
            if !handle.send(Message::Stack(event)) {
                warn!("[{peer}] state machine is gone, dropping event");
                return DispatchOutcome::Ignored;
            }
            return DispatchOutcome::Delivered;
        }

        let incoming = matches!(
            event,
            StackEvent::ConnectionStateChanged {
                state: ConnectionState::Connecting | ConnectionState::Connected,
                ..
            }
        );
        if !incoming {
            debug!("[{peer}] no state machine, ignoring {event:?}");
            return DispatchOutcome::Ignored;
        }

        let sibling = self.adapter.paired_set_peer(&peer);
        match fleet.get_or_create(peer, sibling) {
            Ok(handle) => {
                handle.send(Message::Stack(event));
                DispatchOutcome::Created
            }
            Err(Error::RegistryFull { limit }) => {
                drop(fleet);
                warn!("[{peer}] refusing incoming connection: {limit} state machines in use");
                if !self.native.disconnect_peer(&peer) {
                    warn!("[{peer}] native disconnect failed");
                }
                DispatchOutcome::Refused
            }
            Err(e) => {
                warn!("[{peer}] cannot accept incoming connection: {e}");
                DispatchOutcome::Ignored
            }
        }
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

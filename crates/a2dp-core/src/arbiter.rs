//! Active-device selection.
//!
//! At most one peer is the active audio route. [`ActiveDeviceArbiter`] holds
//! the active-device lock for the whole decide-and-apply sequence of a
//! switch, so two requests cannot interleave and leave the active pointer
//! naming a peer whose route was never applied.
//!
//! Lock order: the active-device lock is taken first, then the registry lock
//! (through [`DeviceRegistry`] reads). Nothing takes them the other way round.

use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use a2dp_types::{CodecStatus, ConnectionState, PeerId};

use crate::events::{EngineEvent, EventBroadcaster};
use crate::peer::PeerSnapshot;
use crate::registry::DeviceRegistry;
use crate::traits::{AudioRouting, NativeStack, RouteChangeHints};

/// Result of an active-device request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationOutcome {
    /// The requested device is now active.
    Success,
    /// The request is a paired-set hand-off that waits for the active twin to drop.
    Pending,
    /// The request was refused; the active device is unchanged.
    Rejected(ActivationFailure),
}

/// Why an activation was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationFailure {
    /// The target is not Connected.
    NotConnected,
    /// The native stack refused the route.
    NativeFailure,
}

#[derive(Debug, Default)]
struct ActiveState {
    active: Option<PeerId>,
    pending_handoff: Option<PeerId>,
}

/// Owner of the active-device pointer.
pub struct ActiveDeviceArbiter {
    state: Mutex<ActiveState>,
    native: Arc<dyn NativeStack>,
    routing: Arc<dyn AudioRouting>,
    events: EventBroadcaster,
}

impl ActiveDeviceArbiter {
    pub fn new(
        native: Arc<dyn NativeStack>,
        routing: Arc<dyn AudioRouting>,
        events: EventBroadcaster,
    ) -> Self {
        Self {
            state: Mutex::new(ActiveState::default()),
            native,
            routing,
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ActiveState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The current active device.
    pub fn active(&self) -> Option<PeerId> {
        self.lock().active
    }

    /// A paired-set hand-off waiting for the active twin to drop.
    pub fn pending_handoff(&self) -> Option<PeerId> {
        self.lock().pending_handoff
    }

    /// Make `target` the active device, or clear it with `None`.
    pub fn set_active(
        &self,
        target: Option<PeerId>,
        registry: &DeviceRegistry,
    ) -> ActivationOutcome {
        let mut state = self.lock();
        if state.active == target {
            return ActivationOutcome::Success;
        }

        let Some(peer) = target else {
            self.clear(&mut state);
            return ActivationOutcome::Success;
        };

        let Some(snapshot) = registry
            .snapshot_of(&peer)
            .filter(|s| s.state == ConnectionState::Connected)
        else {
            warn!("[{peer}] cannot activate: not connected");
            return ActivationOutcome::Rejected(ActivationFailure::NotConnected);
        };

        if let Some(current) = state.active
            && snapshot.paired_sibling == Some(current)
            && registry
                .snapshot_of(&current)
                .is_some_and(|s| s.state == ConnectionState::Connected)
        {
            info!("[{peer}] activation pending until {current} drops");
            state.pending_handoff = Some(peer);
            return ActivationOutcome::Pending;
        }

        self.switch_to(&mut state, &snapshot)
    }

    /// React to `peer` leaving Connected.
    ///
    /// Hands the route to a connected paired-set twin if there is one,
    /// otherwise clears the active device.
    pub fn peer_left_connected(&self, peer: PeerId, registry: &DeviceRegistry) {
        let mut state = self.lock();
        if state.active != Some(peer) {
            if state.pending_handoff == Some(peer) {
                state.pending_handoff = None;
            }
            return;
        }

        let twin = registry
            .snapshot_of(&peer)
            .and_then(|s| s.paired_sibling)
            .and_then(|sibling| registry.snapshot_of(&sibling))
            .filter(|s| s.state == ConnectionState::Connected);
        if let Some(twin) = twin {
            info!("[{peer}] handing active route to paired twin {}", twin.peer);
            if self.switch_to(&mut state, &twin) == ActivationOutcome::Success {
                return;
            }
        }

        self.clear(&mut state);
    }

    /// Forward a codec change for the active device.
    pub fn codec_config_changed(
        &self,
        peer: PeerId,
        status: CodecStatus,
        same_feeding_parameters: bool,
    ) {
        let state = self.lock();
        if state.active != Some(peer) {
            debug!("[{peer}] codec change on inactive device");
            return;
        }
        if !same_feeding_parameters {
            self.routing.codec_config_changed(&peer, &status);
        }
        self.events.send(EngineEvent::CodecConfigChanged { peer, status });
    }

    fn switch_to(&self, state: &mut ActiveState, target: &PeerSnapshot) -> ActivationOutcome {
        let peer = target.peer;
        let previous = state.active;

        if let Some(previous) = previous.as_ref() {
            self.routing.store_volume(previous);
        }
        if !self.native.set_active_device(Some(&peer)) {
            error!("[{peer}] native stack refused active device");
            return ActivationOutcome::Rejected(ActivationFailure::NativeFailure);
        }

        state.active = Some(peer);
        state.pending_handoff = None;
        info!(
            "active device: {} -> {peer}",
            previous.map_or_else(|| "none".to_string(), |p| p.to_string())
        );
        self.events.send(EngineEvent::ActiveDeviceChanged {
            peer: Some(peer),
            previous,
        });

        let twin_handoff = previous.is_some() && target.paired_sibling == previous;
        self.routing.active_device_changed(
            Some(&peer),
            previous.as_ref(),
            RouteChangeHints {
                suppress_noisy_intent: previous.is_some(),
                suppress_volume_renegotiation: twin_handoff,
            },
        );

        if let Some(status) = target.codec_status.clone() {
            self.events.send(EngineEvent::CodecConfigChanged { peer, status });
        }
        if let Some(volume) = self.routing.remembered_volume(&peer) {
            self.routing.restore_volume(&peer, volume);
        }
        ActivationOutcome::Success
    }

    fn clear(&self, state: &mut ActiveState) {
        state.pending_handoff = None;
        let Some(previous) = state.active.take() else {
            return;
        };
        self.routing.store_volume(&previous);
        if !self.native.set_active_device(None) {
            warn!("native stack refused clearing the active device");
        }
        info!("active device: {previous} -> none");
        self.events.send(EngineEvent::ActiveDeviceChanged {
            peer: None,
            previous: Some(previous),
        });
        self.routing
            .active_device_changed(None, Some(&previous), RouteChangeHints::default());
    }
}

impl std::fmt::Debug for ActiveDeviceArbiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveDeviceArbiter")
            .field("active", &self.active())
            .finish_non_exhaustive()
    }
}

//! Trait abstractions for the collaborators around the engine.
//!
//! The engine calls out through these traits and never reaches into the
//! collaborators' internals. Every call is synchronous and must not block:
//! native commands are fire-and-forget, and their results come back later as
//! stack events through [`EventDispatcher`](crate::dispatcher::EventDispatcher).
//!
//! The [`mock`](crate::mock) module provides recording implementations of all
//! four traits for tests.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use a2dp_types::{BondState, CodecStatus, ConnectionPolicy, OptionalCodecSupport, PeerId};

/// Command sink of the native audio stack.
pub trait NativeStack: Send + Sync {
    /// Start connecting the profile. `false` means the command failed outright.
    fn connect_peer(&self, peer: &PeerId) -> bool;

    /// Start disconnecting the profile. `false` means the command failed outright.
    fn disconnect_peer(&self, peer: &PeerId) -> bool;

    /// Route audio to `peer`, or to nothing when `None`.
    fn set_active_device(&self, peer: Option<&PeerId>) -> bool;

    /// Silence or un-silence a peer's audio stream.
    fn set_silence(&self, peer: &PeerId, silence: bool) -> bool;
}

/// Hints passed with an active-device change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteChangeHints {
    /// Do not emit the "audio becoming noisy" signal for the old route.
    pub suppress_noisy_intent: bool,
    /// Keep the absolute-volume state as-is (paired-set hand-off).
    pub suppress_volume_renegotiation: bool,
}

/// Audio routing and volume side of the framework.
pub trait AudioRouting: Send + Sync {
    /// The active device changed.
    fn active_device_changed(
        &self,
        active: Option<&PeerId>,
        previous: Option<&PeerId>,
        hints: RouteChangeHints,
    );

    /// The active device's audio feeding parameters changed.
    fn codec_config_changed(&self, peer: &PeerId, status: &CodecStatus);

    /// A peer started or stopped streaming.
    fn playing_state_changed(&self, peer: &PeerId, playing: bool);

    /// Volume previously remembered for `peer`.
    fn remembered_volume(&self, peer: &PeerId) -> Option<u8>;

    /// Remember the current volume under `peer`.
    fn store_volume(&self, peer: &PeerId);

    /// Apply a remembered volume for `peer`.
    fn restore_volume(&self, peer: &PeerId, volume: u8);
}

/// Persistent per-peer preference storage.
pub trait PolicyStore: Send + Sync {
    /// Stored connection policy.
    fn connection_policy(&self, peer: &PeerId) -> ConnectionPolicy;

    /// Persist a connection policy. `false` means the write failed.
    fn set_connection_policy(&self, peer: &PeerId, policy: ConnectionPolicy) -> bool;

    /// Stored optional-codec support.
    fn optional_codec_support(&self, peer: &PeerId) -> OptionalCodecSupport;

    /// Persist optional-codec support.
    fn set_optional_codec_support(&self, peer: &PeerId, support: OptionalCodecSupport);
}

/// Adapter-level facts about remote devices.
pub trait AdapterProperties: Send + Sync {
    /// Current bond state.
    fn bond_state(&self, peer: &PeerId) -> BondState;

    /// The sibling of a paired-set member, or `None` for legacy devices.
    fn paired_set_peer(&self, peer: &PeerId) -> Option<PeerId>;

    /// Whether the adapter refuses incoming connections.
    fn is_quiet_mode(&self) -> bool {
        false
    }
}

/// The full set of collaborators handed to the service.
#[derive(Clone)]
pub struct Collaborators {
    pub native: Arc<dyn NativeStack>,
    pub routing: Arc<dyn AudioRouting>,
    pub policy: Arc<dyn PolicyStore>,
    pub adapter: Arc<dyn AdapterProperties>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

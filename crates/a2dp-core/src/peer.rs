//! Per-peer connection record.
//!
//! A [`PeerConnection`] only stores state. Connection state is mutated only
//! by the peer's own [`ConnectionStateMachine`](crate::state_machine::ConnectionStateMachine);
//! the service may reserve a slot or set the silence flag. Everyone else
//! reads [`PeerSnapshot`] copies.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use a2dp_types::{CodecStatus, ConnectionState, PeerId};

/// A local command that may be deferred while a transition is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    /// Bring the profile connection up.
    Connect,
    /// Tear the profile connection down.
    Disconnect,
}

/// State of one remote peer.
#[derive(Debug)]
pub struct PeerConnection {
    identity: PeerId,
    pub(crate) connection_state: ConnectionState,
    /// `None` until the first transition is broadcast.
    pub(crate) last_connection_state: Option<ConnectionState>,
    pub(crate) is_playing: bool,
    pub(crate) codec_status: Option<CodecStatus>,
    paired_sibling: Option<PeerId>,
    deferred: VecDeque<Command>,
    pub(crate) silenced: bool,
    pub(crate) last_transition_at: Option<OffsetDateTime>,
    /// Admitted under the registry lock; the machine has not left
    /// Disconnected/Disconnecting for it yet.
    slot_reserved: bool,
}

impl PeerConnection {
    /// Create a disconnected record. `paired_sibling` marks a paired-set member.
    pub fn new(identity: PeerId, paired_sibling: Option<PeerId>) -> Self {
        Self {
            identity,
            connection_state: ConnectionState::Disconnected,
            last_connection_state: None,
            is_playing: false,
            codec_status: None,
            paired_sibling,
            deferred: VecDeque::new(),
            silenced: false,
            last_transition_at: None,
            slot_reserved: false,
        }
    }

    pub fn identity(&self) -> PeerId {
        self.identity
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection_state
    }

    pub fn is_playing(&self) -> bool {
        self.is_playing
    }

    pub fn codec_status(&self) -> Option<&CodecStatus> {
        self.codec_status.as_ref()
    }

    pub fn is_paired_set_member(&self) -> bool {
        self.paired_sibling.is_some()
    }

    pub fn paired_sibling(&self) -> Option<PeerId> {
        self.paired_sibling
    }

    /// Queue a command for replay. A command already waiting is not queued again.
    ///
    /// Returns `false` if the command was already pending.
    pub(crate) fn defer(&mut self, command: Command) -> bool {
        if self.deferred.contains(&command) {
            return false;
        }
        self.deferred.push_back(command);
        true
    }

    /// Drop every pending instance of `command`.
    pub(crate) fn remove_deferred(&mut self, command: Command) {
        self.deferred.retain(|c| *c != command);
    }

    /// Take the pending commands in arrival order.
    pub(crate) fn take_deferred(&mut self) -> VecDeque<Command> {
        std::mem::take(&mut self.deferred)
    }

    pub fn deferred_commands(&self) -> impl Iterator<Item = &Command> {
        self.deferred.iter()
    }

    /// Hold a connection slot until the machine acts on an admitted connect.
    ///
    /// A peer that already occupies a slot needs no reservation.
    pub(crate) fn reserve_slot(&mut self) {
        if !self.connection_state.is_connecting_or_connected() {
            self.slot_reserved = true;
        }
    }

    pub(crate) fn release_slot(&mut self) {
        self.slot_reserved = false;
    }

    pub fn is_slot_reserved(&self) -> bool {
        self.slot_reserved
    }

    /// Copy the record for readers outside the state machine.
    pub fn snapshot(&self) -> PeerSnapshot {
        PeerSnapshot {
            peer: self.identity,
            state: self.connection_state,
            last_state: self.last_connection_state,
            playing: self.is_playing,
            codec_status: self.codec_status.clone(),
            paired_sibling: self.paired_sibling,
            deferred: self.deferred.iter().copied().collect(),
            silenced: self.silenced,
            last_transition_at: self.last_transition_at,
            slot_reserved: self.slot_reserved,
        }
    }
}

/// Immutable copy of a [`PeerConnection`].
///
/// Readers must tolerate the snapshot being stale by the time they use it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerSnapshot {
    pub peer: PeerId,
    pub state: ConnectionState,
    pub last_state: Option<ConnectionState>,
    pub playing: bool,
    pub codec_status: Option<CodecStatus>,
    pub paired_sibling: Option<PeerId>,
    pub deferred: Vec<Command>,
    pub silenced: bool,
    pub last_transition_at: Option<OffsetDateTime>,
    /// Admitted, but the machine has not started connecting yet.
    #[serde(default)]
    pub slot_reserved: bool,
}

impl PeerSnapshot {
    pub fn is_paired_set_member(&self) -> bool {
        self.paired_sibling.is_some()
    }

    /// Whether the peer counts against the connection cap.
    pub fn occupies_slot(&self) -> bool {
        self.state.is_connecting_or_connected() || self.slot_reserved
    }
}

/// A peer record shared between its state machine and readers.
pub type SharedPeer = Arc<Mutex<PeerConnection>>;

/// Lock a shared peer, recovering the data if a holder panicked.
pub(crate) fn lock_peer(peer: &Mutex<PeerConnection>) -> MutexGuard<'_, PeerConnection> {
    peer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

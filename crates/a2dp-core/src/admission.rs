//! Fleet-level admission and eviction policy.
//!
//! [`AdmissionPolicy::can_admit`] is a pure function of the candidate and a
//! snapshot of the fleet. It never touches a state machine; the caller holds
//! the registry lock while taking the snapshot and acting on the decision,
//! and reserves the admitted peer's slot before releasing it. A reserved
//! peer counts as connecting until its machine picks the request up.
//!
//! # Paired sets
//!
//! The two earbuds of a paired set count as one logical sink that needs two
//! slots. The first earbud may only connect while two slots are free, the
//! second only if it is the declared sibling of the first. While exactly one
//! earbud is connected its twin's slot is reserved, so a legacy device needs
//! two free slots to get in.

use a2dp_types::{ConnectionPolicy, PeerId};

use crate::config::{EngineConfig, PAIRED_SET_SLOTS};
use crate::error::RejectReason;
use crate::peer::PeerSnapshot;

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The candidate may connect.
    Allow,
    /// The candidate must stay disconnected.
    Reject(RejectReason),
    /// The candidate may connect once the listed peers are disconnected.
    AllowAfterEvicting(Vec<PeerId>),
}

impl Admission {
    /// Whether the candidate may proceed (possibly after evictions).
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Self::Reject(_))
    }

    /// Peers that must be disconnected first.
    pub fn evictions(&self) -> &[PeerId] {
        match self {
            Self::AllowAfterEvicting(peers) => peers,
            _ => &[],
        }
    }
}

/// A peer asking to connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub peer: PeerId,
    /// Declared sibling, for paired-set members.
    pub paired_sibling: Option<PeerId>,
    pub policy: ConnectionPolicy,
}

impl Candidate {
    /// A legacy candidate with an unknown policy.
    pub fn new(peer: PeerId) -> Self {
        Self {
            peer,
            paired_sibling: None,
            policy: ConnectionPolicy::Unknown,
        }
    }

    /// Mark the candidate as a paired-set member.
    pub fn with_sibling(mut self, sibling: Option<PeerId>) -> Self {
        self.paired_sibling = sibling;
        self
    }

    /// Set the stored connection policy.
    pub fn with_policy(mut self, policy: ConnectionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn is_paired_set_member(&self) -> bool {
        self.paired_sibling.is_some()
    }
}

/// Capacity and pairing rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionPolicy {
    pub max_connected: usize,
    pub paired_set_enabled: bool,
    pub paired_set_coexistence: bool,
}

impl AdmissionPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_connected: config.max_connected_audio_devices,
            paired_set_enabled: config.paired_set_enabled,
            paired_set_coexistence: config.paired_set_coexistence,
        }
    }

    /// Decide whether `candidate` may connect given the current `fleet`.
    pub fn can_admit(&self, candidate: &Candidate, fleet: &[PeerSnapshot]) -> Admission {
        if candidate.policy == ConnectionPolicy::Forbidden {
            return Admission::Reject(RejectReason::PolicyForbidden);
        }
        if candidate.is_paired_set_member() && !self.paired_set_enabled {
            return Admission::Reject(RejectReason::PairedSetDisabled);
        }

        let active: Vec<&PeerSnapshot> = fleet.iter().filter(|p| p.occupies_slot()).collect();

        if active.iter().any(|p| p.peer == candidate.peer) {
            return Admission::Allow;
        }

        let connected = active.len();
        let paired_connected = active.iter().filter(|p| p.is_paired_set_member()).count();
        let legacy_connected = connected - paired_connected;

        if self.max_connected == 1 && connected > 0 {
            return Admission::AllowAfterEvicting(active.iter().map(|p| p.peer).collect());
        }

        let free = self.max_connected.saturating_sub(connected);

        if let Some(sibling) = candidate.paired_sibling {
            if !self.paired_set_coexistence && legacy_connected > 0 {
                return Admission::Reject(RejectReason::CoexistenceDisabled);
            }
            if paired_connected >= PAIRED_SET_SLOTS {
                return Admission::Reject(RejectReason::PairedSlotsFull);
            }
            return match paired_connected {
                0 if free >= PAIRED_SET_SLOTS => Admission::Allow,
                1 => {
                    let is_twin = active
                        .iter()
                        .any(|p| p.is_paired_set_member() && p.peer == sibling);
                    if !is_twin {
                        Admission::Reject(RejectReason::PairMismatch)
                    } else if free >= 1 {
                        Admission::Allow
                    } else {
                        Admission::Reject(RejectReason::TooManyConnections)
                    }
                }
                _ => Admission::Reject(RejectReason::TooManyConnections),
            };
        }

        if !self.paired_set_coexistence && paired_connected > 0 {
            return Admission::Reject(RejectReason::CoexistenceDisabled);
        }
        let needed = if paired_connected == 1 { 2 } else { 1 };
        if free >= needed {
            Admission::Allow
        } else {
            Admission::Reject(RejectReason::TooManyConnections)
        }
    }
}

/// Count peers holding a connection slot: Connecting, Connected, or admitted
/// and not yet acted on.
pub fn connected_count(fleet: &[PeerSnapshot]) -> usize {
    fleet.iter().filter(|p| p.occupies_slot()).count()
}

//! Error types for a2dp-core.
//!
//! Nothing inside the engine is fatal. Every failure a caller can observe is
//! one of the variants below, returned synchronously from the service facade.
//!
//! | Error | Cause | Peer afterwards |
//! |-------|-------|-----------------|
//! | [`Error::Rejected`] | Admission or policy refused the peer | Disconnected |
//! | [`Error::RegistryFull`] | `max_state_machines` reached | Untracked |
//! | [`Error::NotConnected`] | Operation needs a connected/connecting peer | Unchanged |
//! | [`Error::DeviceNotFound`] | Peer has no state machine | Untracked |
//! | [`Error::ServiceNotRunning`] | `start()` not called or `stop()` already ran | Unchanged |
//!
//! Native command failures and transition timeouts never surface here: the
//! state machine recovers from them on its own by falling back to
//! Disconnected.

use std::fmt;

use thiserror::Error;

use a2dp_types::{ParseError, PeerId};

/// Errors returned by the engine.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The connection was refused.
    #[error("Connection to {peer} rejected: {reason}")]
    Rejected {
        /// The refused peer.
        peer: PeerId,
        /// Why it was refused.
        reason: RejectReason,
    },

    /// The registry already tracks the maximum number of peers.
    #[error("Cannot connect: state machine limit ({limit}) reached")]
    RegistryFull {
        /// The configured cap.
        limit: usize,
    },

    /// The peer is not connected or connecting.
    #[error("Device {0} is not connected")]
    NotConnected(PeerId),

    /// The peer has no state machine.
    #[error("Device {0} not found")]
    DeviceNotFound(PeerId),

    /// The service has not been started or has been stopped.
    #[error("Service is not running")]
    ServiceNotRunning,

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Failed to parse an engine value.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Structured reasons for refusing a connection.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new reasons
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum RejectReason {
    /// Paired-set devices are disabled by configuration.
    PairedSetDisabled,
    /// Both paired-set slots are already in use.
    PairedSlotsFull,
    /// A different paired set is already connected.
    PairMismatch,
    /// No free connection slot.
    TooManyConnections,
    /// Legacy and paired-set devices may not share the fleet.
    CoexistenceDisabled,
    /// The persisted connection policy forbids this peer.
    PolicyForbidden,
    /// The peer is neither bonded nor bonding.
    NotBonded,
    /// Incoming connections are refused in quiet mode.
    QuietMode,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PairedSetDisabled => write!(f, "paired-set devices are disabled"),
            Self::PairedSlotsFull => write!(f, "paired-set slots are full"),
            Self::PairMismatch => write!(f, "another paired set is connected"),
            Self::TooManyConnections => write!(f, "too many connections"),
            Self::CoexistenceDisabled => {
                write!(f, "legacy and paired-set devices cannot coexist")
            }
            Self::PolicyForbidden => write!(f, "connection policy is forbidden"),
            Self::NotBonded => write!(f, "device is not bonded"),
            Self::QuietMode => write!(f, "quiet mode is enabled"),
        }
    }
}

impl Error {
    /// Create a rejection error.
    pub fn rejected(peer: PeerId, reason: RejectReason) -> Self {
        Self::Rejected { peer, reason }
    }

    /// Create a configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// The rejection reason, if this is a rejection.
    pub fn reject_reason(&self) -> Option<RejectReason> {
        match self {
            Self::Rejected { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}

/// Result type alias using a2dp-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

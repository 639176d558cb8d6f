//! Connection engine for A2DP audio sinks.
//!
//! This crate tracks every remote audio peer of one adapter through a
//! per-peer connection state machine, decides which peers may connect, and
//! arbitrates the single active audio route.
//!
//! # Features
//!
//! - **Per-peer state machines**: Disconnected, Connecting, Connected and
//!   Disconnecting, with deferred commands and a connect timeout
//! - **Admission policy**: capacity limits, single-slot eviction and
//!   paired-set (two-earbud) slot arithmetic
//! - **Active device arbitration**: serialized switches, volume
//!   store/restore, paired-set hand-off
//! - **Event fan-out**: connection, playing, active-device and codec changes
//!   broadcast to any number of subscribers
//! - **Mock collaborators**: recording native stack, routing, policy store
//!   and adapter for tests and simulation
//!
//! # Architecture
//!
//! | Component | Role |
//! |-----------|------|
//! | [`PeerConnection`] | State of one peer |
//! | [`ConnectionStateMachine`] | Lifecycle of one peer, one tokio task each |
//! | [`AdmissionPolicy`] | Pure admission decision over a fleet snapshot |
//! | [`DeviceRegistry`] | Peer to machine map, bounded by `max_state_machines` |
//! | [`ActiveDeviceArbiter`] | The single active route |
//! | [`EventDispatcher`] | Native events to the right machine |
//! | [`A2dpService`] | Facade over all of the above |
//!
//! Machines never call back into the service. They send notices to a
//! reactor task, which drives the arbiter and the collaborators.
//!
//! # Quick Start
//!
//! ```
//! use a2dp_core::mock::MockEnvironment;
//! use a2dp_core::{A2dpService, ActivationOutcome, EngineConfig, StackEvent};
//! use a2dp_types::{ConnectionState, PeerId};
//!
//! #[tokio::main]
//! async fn main() -> a2dp_core::Result<()> {
//!     let env = MockEnvironment::new();
//!     let service = A2dpService::new(EngineConfig::default(), env.collaborators())?;
//!     service.start()?;
//!
//!     let headset: PeerId = "00:11:22:33:44:55".parse()?;
//!     service.connect(headset)?;
//!     service.handle_stack_event(StackEvent::ConnectionStateChanged {
//!         peer: headset,
//!         state: ConnectionState::Connected,
//!     });
//!     service.settle().await;
//!
//!     assert_eq!(service.set_active(Some(headset)), ActivationOutcome::Success);
//!     assert_eq!(service.active_device(), Some(headset));
//!     service.stop();
//!     Ok(())
//! }
//! ```

pub mod admission;
pub mod arbiter;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod mock;
pub mod peer;
pub mod registry;
pub mod service;
pub mod state_machine;
pub mod traits;

// Core exports
pub use admission::{Admission, AdmissionPolicy, Candidate};
pub use arbiter::{ActivationFailure, ActivationOutcome, ActiveDeviceArbiter};
pub use config::EngineConfig;
pub use dispatcher::{DispatchOutcome, EventDispatcher};
pub use error::{Error, RejectReason, Result};
pub use events::{EngineEvent, EventBroadcaster, EventReceiver, EventSender};
pub use peer::{Command, PeerConnection, PeerSnapshot};
pub use registry::{DeviceRegistry, MachineHandle};
pub use service::{A2dpService, ServiceDump};
pub use state_machine::{ConnectionStateMachine, IncomingGate, MachineNotice, Message, StackEvent};
pub use traits::{
    AdapterProperties, AudioRouting, Collaborators, NativeStack, PolicyStore, RouteChangeHints,
};

// Re-export from a2dp-types
pub use a2dp_types::{
    AudioState, BondState, CodecConfig, CodecStatus, CodecType, ConnectionPolicy,
    ConnectionState, PeerId, PlayingState,
};

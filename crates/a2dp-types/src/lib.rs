//! Platform-agnostic types for the A2DP connection engine.
//!
//! This crate provides the value types exchanged between the engine
//! (a2dp-core) and the collaborators around it: peer addresses, connection
//! and audio states, bonding and policy values, and codec snapshots.
//!
//! # Example
//!
//! ```
//! use a2dp_types::{ConnectionState, PeerId};
//!
//! let peer: PeerId = "AA:BB:CC:DD:EE:01".parse().unwrap();
//! assert!(ConnectionState::Connecting.is_connecting_or_connected());
//! assert_eq!(peer.to_string(), "AA:BB:CC:DD:EE:01");
//! ```

pub mod error;
pub mod types;

pub use error::{ParseError, ParseResult};
pub use types::{
    AudioState, BondState, ChannelMode, CodecConfig, CodecStatus, CodecType, ConnectionPolicy,
    ConnectionState, OptionalCodecSupport, PeerId, PlayingState,
};

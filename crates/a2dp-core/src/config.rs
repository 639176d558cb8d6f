//! Engine configuration.
//!
//! Every behavior switch the engine supports is a named field here. The
//! configuration is immutable once the service is constructed.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default number of peers that may be connecting or connected at once.
pub const DEFAULT_MAX_CONNECTED_AUDIO_DEVICES: usize = 5;

/// Default bound on tracked state machines, independent of connection state.
pub const DEFAULT_MAX_STATE_MACHINES: usize = 50;

/// Default time allowed for a connect or disconnect to settle.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Slots a paired set (two earbuds) can occupy.
pub const PAIRED_SET_SLOTS: usize = 2;

/// Events buffered per subscriber before a slow one starts lagging.
pub const DEFAULT_EVENT_CAPACITY: usize = 100;

/// Configuration for the connection engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum peers concurrently Connecting or Connected.
    pub max_connected_audio_devices: usize,
    /// Maximum tracked peers regardless of state.
    pub max_state_machines: usize,
    /// Connect/disconnect timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Whether paired-set (two-earbud) devices may connect at all.
    pub paired_set_enabled: bool,
    /// Whether legacy devices may be connected alongside a paired set.
    pub paired_set_coexistence: bool,
    /// Whether the audio path is offloaded to the controller.
    pub offload_enabled: bool,
    /// Make a newly connected peer active when only one slot exists.
    pub auto_activate_single_device: bool,
    /// Capacity of the outward event broadcast channel.
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_connected_audio_devices: DEFAULT_MAX_CONNECTED_AUDIO_DEVICES,
            max_state_machines: DEFAULT_MAX_STATE_MACHINES,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT.as_millis() as u64,
            paired_set_enabled: false,
            paired_set_coexistence: true,
            offload_enabled: false,
            auto_activate_single_device: true,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl EngineConfig {
    /// Create a config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the connection capacity.
    pub fn max_connected_audio_devices(mut self, max: usize) -> Self {
        self.max_connected_audio_devices = max;
        self
    }

    /// Set the state machine cap.
    pub fn max_state_machines(mut self, max: usize) -> Self {
        self.max_state_machines = max;
        self
    }

    /// Set the connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Enable or disable paired-set support.
    pub fn paired_set_enabled(mut self, enabled: bool) -> Self {
        self.paired_set_enabled = enabled;
        self
    }

    /// Allow or forbid legacy devices alongside a paired set.
    pub fn paired_set_coexistence(mut self, enabled: bool) -> Self {
        self.paired_set_coexistence = enabled;
        self
    }

    /// Enable or disable offload mode.
    pub fn offload_enabled(mut self, enabled: bool) -> Self {
        self.offload_enabled = enabled;
        self
    }

    /// Enable or disable auto-activation in single-slot fleets.
    pub fn auto_activate_single_device(mut self, enabled: bool) -> Self {
        self.auto_activate_single_device = enabled;
        self
    }

    /// The connect timeout as a [`Duration`].
    pub fn connect_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Validate the configuration and return an error if invalid.
    ///
    /// Checks that:
    /// - at least one audio device may connect
    /// - the state machine cap can hold every connectable peer
    /// - the connect timeout is non-zero
    /// - paired-set support has room for both earbuds
    /// - the event channel has capacity
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.max_connected_audio_devices == 0 {
            problems.push("max_connected_audio_devices must be >= 1".to_string());
        }
        if self.max_state_machines < self.max_connected_audio_devices {
            problems.push(format!(
                "max_state_machines ({}) must be >= max_connected_audio_devices ({})",
                self.max_state_machines, self.max_connected_audio_devices
            ));
        }
        if self.connect_timeout_ms == 0 {
            problems.push("connect_timeout_ms must be > 0".to_string());
        }
        if self.paired_set_enabled && self.max_connected_audio_devices < PAIRED_SET_SLOTS {
            problems.push(format!(
                "paired_set_enabled requires max_connected_audio_devices >= {}",
                PAIRED_SET_SLOTS
            ));
        }
        if self.event_capacity == 0 {
            problems.push("event_capacity must be > 0".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::InvalidConfig(problems.join("; ")))
        }
    }

    /// Parse and validate a TOML configuration.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }
}

//! Core value types shared by the connection engine and its collaborators.

use core::fmt;
use core::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// Stable identity of a remote peer (a 48-bit Bluetooth device address).
///
/// Displayed and parsed in the usual colon-separated, upper-case hex form.
///
/// # Examples
///
/// ```
/// use a2dp_types::PeerId;
///
/// let peer: PeerId = "00:11:22:aa:bb:cc".parse().unwrap();
/// assert_eq!(peer.to_string(), "00:11:22:AA:BB:CC");
/// assert_eq!(peer.octets(), [0x00, 0x11, 0x22, 0xAA, 0xBB, 0xCC]);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "String", into = "String"))]
pub struct PeerId([u8; 6]);

impl PeerId {
    /// Create a peer id from raw address octets (most significant first).
    #[must_use]
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// Raw address octets.
    #[must_use]
    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

impl FromStr for PeerId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseError::InvalidAddress(s.to_string());
        let mut octets = [0u8; 6];
        let mut parts = s.split(':');
        for octet in &mut octets {
            let part = parts.next().ok_or_else(invalid)?;
            if part.len() != 2 {
                return Err(invalid());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Self(octets))
    }
}

impl TryFrom<String> for PeerId {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PeerId> for String {
    fn from(value: PeerId) -> Self {
        value.to_string()
    }
}

/// Profile connection state of a single peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ConnectionState {
    /// No profile connection.
    #[default]
    Disconnected,
    /// Connection being established.
    Connecting,
    /// Profile connection established.
    Connected,
    /// Connection being torn down.
    Disconnecting,
}

impl ConnectionState {
    /// States that occupy a connection slot for admission purposes.
    pub const CONNECTING_OR_CONNECTED: [ConnectionState; 2] =
        [ConnectionState::Connecting, ConnectionState::Connected];

    /// Whether the state occupies a connection slot.
    #[must_use]
    pub fn is_connecting_or_connected(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected)
    }

    /// Whether the state is an in-flight transition guarded by the connect timeout.
    #[must_use]
    pub fn is_transient(self) -> bool {
        matches!(self, Self::Connecting | Self::Disconnecting)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

impl FromStr for ConnectionState {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "disconnected" => Ok(Self::Disconnected),
            "connecting" => Ok(Self::Connecting),
            "connected" => Ok(Self::Connected),
            "disconnecting" => Ok(Self::Disconnecting),
            _ => Err(ParseError::unknown("connection state", s)),
        }
    }
}

/// Audio streaming state as broadcast to listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum PlayingState {
    /// Audio is streaming to the peer.
    Playing,
    /// No audio is streaming.
    #[default]
    NotPlaying,
}

impl PlayingState {
    /// Convert from the per-peer playing flag.
    #[must_use]
    pub fn from_playing(playing: bool) -> Self {
        if playing {
            Self::Playing
        } else {
            Self::NotPlaying
        }
    }
}

/// Audio sub-state reported by the native stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum AudioState {
    /// Streaming started.
    Started,
    /// Streaming stopped locally.
    Stopped,
    /// Streaming suspended by the remote peer.
    RemoteSuspend,
}

impl FromStr for AudioState {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "started" => Ok(Self::Started),
            "stopped" => Ok(Self::Stopped),
            "remote_suspend" => Ok(Self::RemoteSuspend),
            _ => Err(ParseError::unknown("audio state", s)),
        }
    }
}

/// Pairing state reported by the bonding collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum BondState {
    /// Not bonded.
    #[default]
    None,
    /// Bonding in progress.
    Bonding,
    /// Bonded.
    Bonded,
}

/// Persisted per-peer connection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ConnectionPolicy {
    /// Connections are allowed.
    Allowed,
    /// Connections are refused regardless of capacity.
    Forbidden,
    /// Never set; typically service discovery has not completed.
    #[default]
    Unknown,
}

impl fmt::Display for ConnectionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allowed => write!(f, "allowed"),
            Self::Forbidden => write!(f, "forbidden"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Whether a peer supports any optional (non-mandatory) codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum OptionalCodecSupport {
    /// Not yet determined.
    #[default]
    Unknown,
    /// At least one optional codec is selectable.
    Supported,
    /// Only mandatory codecs are selectable.
    NotSupported,
}

/// Audio codec family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
#[non_exhaustive]
pub enum CodecType {
    /// SBC, the mandatory codec.
    Sbc,
    /// AAC.
    Aac,
    /// aptX.
    AptX,
    /// aptX HD.
    AptXHd,
    /// LDAC.
    Ldac,
    /// Vendor codec identified by its raw type value.
    Vendor(u32),
}

impl CodecType {
    /// Whether every sink must support this codec.
    #[must_use]
    pub fn is_mandatory(self) -> bool {
        matches!(self, Self::Sbc)
    }
}

/// Channel layout of an audio stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ChannelMode {
    /// Single channel.
    Mono,
    /// Two channels.
    #[default]
    Stereo,
}

/// A single codec configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CodecConfig {
    /// Codec family.
    pub codec_type: CodecType,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Bits per sample.
    pub bits_per_sample: u8,
    /// Channel layout.
    pub channel_mode: ChannelMode,
    /// Codec-specific parameter (e.g. LDAC playback quality).
    #[cfg_attr(feature = "serde", serde(default))]
    pub codec_specific: i64,
}

impl CodecConfig {
    /// Create a config with no codec-specific parameter.
    #[must_use]
    pub fn new(
        codec_type: CodecType,
        sample_rate: u32,
        bits_per_sample: u8,
        channel_mode: ChannelMode,
    ) -> Self {
        Self {
            codec_type,
            sample_rate,
            bits_per_sample,
            channel_mode,
            codec_specific: 0,
        }
    }

    /// Whether two configs feed the audio path identically.
    ///
    /// Only sample rate, bit depth and channel mode matter; a codec swap with
    /// the same PCM parameters does not require the audio framework to restart
    /// its output.
    ///
    /// # Examples
    ///
    /// ```
    /// use a2dp_types::{ChannelMode, CodecConfig, CodecType};
    ///
    /// let sbc = CodecConfig::new(CodecType::Sbc, 44_100, 16, ChannelMode::Stereo);
    /// let aac = CodecConfig::new(CodecType::Aac, 44_100, 16, ChannelMode::Stereo);
    /// let hd = CodecConfig::new(CodecType::AptXHd, 48_000, 24, ChannelMode::Stereo);
    /// assert!(sbc.same_audio_feeding_parameters(&aac));
    /// assert!(!sbc.same_audio_feeding_parameters(&hd));
    /// ```
    #[must_use]
    pub fn same_audio_feeding_parameters(&self, other: &CodecConfig) -> bool {
        self.sample_rate == other.sample_rate
            && self.bits_per_sample == other.bits_per_sample
            && self.channel_mode == other.channel_mode
    }
}

/// Current codec configuration plus the capability sets negotiated with a peer.
///
/// The engine treats this as an opaque snapshot; it only records the latest
/// value and passes it along.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CodecStatus {
    /// Configuration currently in use.
    pub config: CodecConfig,
    /// Codecs supported locally.
    #[cfg_attr(feature = "serde", serde(default))]
    pub local_capabilities: Vec<CodecConfig>,
    /// Codecs both sides can use.
    #[cfg_attr(feature = "serde", serde(default))]
    pub selectable_capabilities: Vec<CodecConfig>,
}

impl CodecStatus {
    /// Create a status with only a current config and no capability lists.
    #[must_use]
    pub fn new(config: CodecConfig) -> Self {
        Self {
            config,
            local_capabilities: Vec::new(),
            selectable_capabilities: Vec::new(),
        }
    }

    /// Whether any selectable codec is optional.
    #[must_use]
    pub fn supports_optional_codecs(&self) -> bool {
        self.selectable_capabilities
            .iter()
            .any(|c| !c.codec_type.is_mandatory())
    }
}

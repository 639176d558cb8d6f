//! Error types for value parsing in a2dp-types.

use thiserror::Error;

/// Errors that can occur when parsing engine value types.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// A peer address was not six colon-separated hex octets.
    #[error("Invalid peer address '{0}': expected AA:BB:CC:DD:EE:FF")]
    InvalidAddress(String),

    /// A textual enum value did not match any known variant.
    #[error("Unknown {kind} '{value}'")]
    UnknownVariant {
        /// Name of the type being parsed.
        kind: &'static str,
        /// The offending input.
        value: String,
    },
}

impl ParseError {
    pub(crate) fn unknown(kind: &'static str, value: &str) -> Self {
        Self::UnknownVariant {
            kind,
            value: value.to_string(),
        }
    }
}

/// Result type alias using a2dp-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;

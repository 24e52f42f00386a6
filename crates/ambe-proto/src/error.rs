//! Error types for packet framing and parsing

use thiserror::Error;

/// Result type alias for protocol operations
pub type Result<T> = std::result::Result<T, ProtoError>;

/// Errors that can occur while building or parsing packets
#[derive(Debug, Error)]
pub enum ProtoError {
    /// Header, length, or parity check failed on a received packet
    #[error("Malformed packet: {reason}")]
    MalformedPacket {
        /// Which check failed
        reason: String,
    },

    /// A typed accessor was used on a packet with a different shape
    #[error("Invalid payload: {reason}")]
    InvalidPayload {
        /// Which field or type was expected
        reason: String,
    },

    /// A rate string could not be parsed
    #[error("Invalid rate value: {value}")]
    InvalidRate {
        /// The offending input
        value: String,
    },
}

impl ProtoError {
    /// Create a malformed packet error
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedPacket {
            reason: reason.into(),
        }
    }

    /// Create an invalid payload error
    pub fn invalid_payload(reason: impl Into<String>) -> Self {
        Self::InvalidPayload {
            reason: reason.into(),
        }
    }
}

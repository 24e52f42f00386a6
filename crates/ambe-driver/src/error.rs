//! Error types for driver operations

use thiserror::Error;

/// Result type alias for driver operations
pub type Result<T> = std::result::Result<T, DriverError>;

/// Errors that can occur while talking to a vocoder device
#[derive(Debug, Error)]
pub enum DriverError {
    /// Packet framing or parsing failed
    #[error(transparent)]
    Proto(#[from] ambe_proto::ProtoError),

    /// A response packet had the wrong type, field, or channel
    #[error("Invalid response: {reason}")]
    InvalidResponse {
        /// What was expected
        reason: String,
    },

    /// The chip reported a non-zero status for a request
    #[error("{command} request failed with status {status}")]
    ChipCommandFailed {
        /// The request that failed
        command: String,
        /// Status byte returned by the chip
        status: u8,
    },

    /// A transport write failed; the scheduler terminates and the process
    /// is expected to restart
    #[error("Device send failed: {reason}")]
    DeviceSendFailed {
        /// Reason for failure
        reason: String,
    },

    /// The transport reader reached EOF or a hard error without `stop`
    #[error("Device link lost: {reason}")]
    DeviceLinkLost {
        /// Reason for failure
        reason: String,
    },

    /// Another process holds the device
    #[error("Device busy: {path}")]
    DeviceBusy {
        /// Path of the contested device
        path: String,
    },

    /// Every channel on every registered device is in use
    #[error("No channels left")]
    NoChannelsLeft,

    /// A response did not arrive within the caller's deadline; the request
    /// keeps running in the background
    #[error("Deadline exceeded after {waited_ms}ms")]
    DeadlineExceeded {
        /// How long the caller waited
        waited_ms: u64,
    },

    /// Bad URI, rate, flag, or file format
    #[error("Invalid configuration: {reason}")]
    InvalidConfiguration {
        /// What was wrong
        reason: String,
    },

    /// Operation called in the wrong lifecycle state
    #[error("Invalid state: {reason}")]
    InvalidState {
        /// Current state description
        reason: String,
    },

    /// The device does not implement the requested capability
    #[error("Unsupported operation: {operation}")]
    Unsupported {
        /// The capability that is missing
        operation: String,
    },

    /// I/O error during device communication
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },

    /// Serial port error
    #[error("Serial port error: {source}")]
    Serial {
        /// Underlying serial port error
        #[from]
        source: serialport::Error,
    },
}

impl DriverError {
    /// Create an invalid response error
    pub fn invalid_response(reason: impl Into<String>) -> Self {
        Self::InvalidResponse {
            reason: reason.into(),
        }
    }

    /// Create a send failure error
    pub fn send_failed(reason: impl Into<String>) -> Self {
        Self::DeviceSendFailed {
            reason: reason.into(),
        }
    }

    /// Create a link loss error
    pub fn link_lost(reason: impl Into<String>) -> Self {
        Self::DeviceLinkLost {
            reason: reason.into(),
        }
    }

    /// Create an invalid configuration error
    pub fn invalid_configuration(reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            reason: reason.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(reason: impl Into<String>) -> Self {
        Self::InvalidState {
            reason: reason.into(),
        }
    }

    /// Create an unsupported operation error
    pub fn unsupported(operation: impl Into<String>) -> Self {
        Self::Unsupported {
            operation: operation.into(),
        }
    }
}

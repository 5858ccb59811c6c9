//! Broker error types and wire error codes.

use thiserror::Error;

use crate::ids::ConnectionId;

// ── Wire error codes ────────────────────────────────────────────────

/// Channel name is malformed, unknown, or the channel refuses subscriptions.
pub const INVALID_CHANNEL: &str = "invalid-channel";
/// Inbound frame was not valid JSON or did not match the message schema.
pub const MESSAGE_PARSE_ERROR: &str = "message-parse-error";
/// Inbound frame carried a `type` the broker does not understand.
pub const UNKNOWN_MESSAGE_TYPE: &str = "unknown-message-type";
/// Publish payload or inbound frame exceeds `maxPayloadBytes`.
pub const PAYLOAD_TOO_LARGE: &str = "payload-too-large";
/// Internal broker failure.
pub const INTERNAL_ERROR: &str = "internal-error";

/// Errors raised by broker operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Channel name fails validation.
    #[error("invalid channel name '{name}': {reason}")]
    InvalidChannelName {
        /// The offending name.
        name: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// Channel does not exist.
    #[error("channel '{0}' does not exist")]
    ChannelNotFound(String),

    /// Channel has been deactivated and refuses new subscriptions.
    #[error("channel '{0}' is inactive")]
    ChannelInactive(String),

    /// Connection is not registered (or already unregistered).
    #[error("connection {0} is not registered")]
    UnknownConnection(ConnectionId),

    /// Payload exceeds the configured size limit.
    #[error("payload of {size} bytes exceeds the {max} byte limit")]
    PayloadTooLarge {
        /// Serialized payload size.
        size: usize,
        /// Configured limit.
        max: usize,
    },

    /// The dispatcher queue is closed.
    #[error("dispatcher is not accepting events")]
    DispatcherStopped,

    /// `start` was called on a broker that is already running.
    #[error("broker is already running")]
    AlreadyRunning,

    /// Configuration rejected by validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// JSON (de)serialization failure.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BrokerError {
    /// Wire error code reported to clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidChannelName { .. }
            | Self::ChannelNotFound(_)
            | Self::ChannelInactive(_) => INVALID_CHANNEL,
            Self::PayloadTooLarge { .. } => PAYLOAD_TOO_LARGE,
            Self::Serialization(_) => MESSAGE_PARSE_ERROR,
            Self::UnknownConnection(_)
            | Self::DispatcherStopped
            | Self::AlreadyRunning
            | Self::InvalidConfig(_) => INTERNAL_ERROR,
        }
    }
}

/// Errors raised while decoding an inbound wire message.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Not JSON, not an object, or fields of the wrong shape.
    #[error("could not parse message: {0}")]
    Parse(String),

    /// Well-formed JSON with an unrecognized `type`.
    #[error("unknown message type '{0}'")]
    UnknownType(String),

    /// Frame larger than the configured limit.
    #[error("message of {size} bytes exceeds the {max} byte limit")]
    TooLarge {
        /// Frame size.
        size: usize,
        /// Configured limit.
        max: usize,
    },
}

impl ProtocolError {
    /// Wire error code reported to clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Parse(_) => MESSAGE_PARSE_ERROR,
            Self::UnknownType(_) => UNKNOWN_MESSAGE_TYPE,
            Self::TooLarge { .. } => PAYLOAD_TOO_LARGE,
        }
    }
}

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

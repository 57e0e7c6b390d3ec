//! Error types for smqtt.

use std::io;

/// Result type alias for smqtt.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for smqtt operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Transport failure while reading or writing a socket.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// A constructor or setter received an out-of-range value.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Malformed or unrecognized wire bytes.
    #[error("invalid message format: {0}")]
    InvalidMessageFormat(String),

    /// The buffer does not hold a complete frame yet.
    #[error("incomplete packet: need {needed} more bytes")]
    Incomplete { needed: usize },

    /// Frame exceeds the configured maximum size.
    #[error("packet too large: {size} bytes (max {max})")]
    PacketTooLarge { size: usize, max: usize },

    /// A well-formed frame arrived in the wrong state.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Unexpected packet received.
    #[error("unexpected packet: expected {expected}, got {got}")]
    UnexpectedPacket { expected: String, got: String },

    /// Connection refused by broker.
    #[error("connection refused: return code {0}")]
    ConnectionRefused(u8),

    /// The broker rejected a subscription.
    #[error("subscription to topic {topic} failed with code: {code}")]
    OperationFailed { topic: String, code: u8 },

    /// Connection closed by peer.
    #[error("connection closed")]
    ConnectionClosed,

    /// The connection was cancelled while an operation was in progress.
    #[error("operation cancelled")]
    Cancelled,

    /// Timeout error.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Invalid configuration.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Broker is already running.
    #[error("broker already running")]
    AlreadyRunning,
}

impl Error {
    pub(crate) fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        Error::InvalidMessageFormat(msg.into())
    }
}

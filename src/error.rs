//! Error types for mqtt3.

use std::io;

use crate::types::ConnectReturnCode;

/// Result type alias for mqtt3.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for mqtt3 operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The buffer holds a proper prefix of a packet; `needed` more bytes
    /// are required before decoding can make progress.
    #[error("incomplete packet: need {needed} more bytes")]
    Incomplete { needed: usize },

    /// Packet exceeds the configured maximum size.
    #[error("packet too large: {size} bytes (max {max})")]
    PacketTooLarge { size: usize, max: usize },

    /// Output buffer too small for the encoded packet.
    #[error("buffer too small: need {required}, have {available}")]
    BufferTooSmall { required: usize, available: usize },

    /// Packet violates the MQTT 3.1.1 wire format.
    #[error("malformed packet: {0}")]
    MalformedPacket(&'static str),

    /// Unknown or reserved packet type nibble.
    #[error("invalid packet type: {0}")]
    InvalidPacketType(u8),

    /// QoS value outside 0..=2.
    #[error("invalid qos: {0}")]
    InvalidQoS(u8),

    /// String field is not valid UTF-8 or contains a NUL character.
    #[error("invalid utf-8 string")]
    InvalidUtf8,

    /// CONNECT carried an unsupported protocol name or level.
    #[error("unsupported protocol level: {0}")]
    UnsupportedVersion(u8),

    /// Peer sent a packet that is illegal in the current state.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Broker refused the connection with the given CONNACK code.
    #[error("connection refused: {0:?}")]
    ConnectionRefused(ConnectReturnCode),

    /// Authentication failed.
    #[error("authentication failed")]
    AuthenticationFailed,

    /// Publish or subscribe denied by a topic filter.
    #[error("not authorized: {0}")]
    NotAuthorized(String),

    /// No packet arrived within 1.5 x keepalive.
    #[error("keepalive timeout")]
    KeepaliveTimeout,

    /// Connection closed by peer or transport failure.
    #[error("connection closed")]
    ConnectionClosed,

    /// Session was taken over by a newer connection with the same client id.
    #[error("session taken over")]
    SessionTakenOver,

    /// Bounded queue overflowed.
    #[error("queue overflow")]
    QueueOverflow,

    /// A plugin filter vote did not complete within the configured timeout.
    #[error("plugin call timed out: {0}")]
    PluginTimeout(String),

    /// Unexpected packet received.
    #[error("unexpected packet: expected {expected}, got {got}")]
    UnexpectedPacket { expected: String, got: String },

    /// Timed out waiting for a peer response.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Invalid configuration.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Broker is already running.
    #[error("broker already running")]
    AlreadyRunning,

    /// Broker is shutting down.
    #[error("broker shutting down")]
    ShuttingDown,

    /// Internal fault; fatal for the connection only.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error means "keep reading, the packet is not complete yet".
    pub fn is_incomplete(&self) -> bool {
        matches!(self, Error::Incomplete { .. })
    }
}

//! Error types for the device session core.

/// Top-level error type for the voice-assistant session core.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// Transport-level failure (connect, write, close).
    #[error("transport error: {0}")]
    Transport(String),

    /// The peer closed or reset the connection mid-write.
    #[error("transport closed by peer")]
    TransportClosed,

    /// Operation requires an established connection.
    #[error("not connected")]
    NotConnected,

    /// The server never completed the handshake within the timeout.
    #[error("handshake timeout")]
    HandshakeTimeout,

    /// The serialized write path is busy (best-effort writers drop the send).
    #[error("write lock busy")]
    LockBusy,

    /// Inbound payload failed to parse as structured data.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// A reconnect attempt is already in progress or inside the cooldown.
    #[error("reconnect already in progress")]
    ReconnectBusy,

    /// All bounded reconnect attempts failed.
    #[error("reconnect attempts exhausted")]
    ReconnectExhausted,

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Hardware collaborator failure (wake word, audio subsystem).
    #[error("hardware error: {0}")]
    Hardware(String),

    /// Endpoint provisioning error.
    #[error("provision error: {0}")]
    Provision(String),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, DeviceError>;

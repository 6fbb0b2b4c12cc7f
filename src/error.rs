//! Error types for the Gully client.

use thiserror::Error;

use crate::lifecycle::MatchPhase;

/// Errors that can occur when using the Gully client.
#[derive(Debug, Error)]
pub enum GullyError {
    /// Failed to send a message through the transport.
    #[error("transport send error: {0}")]
    TransportSend(String),

    /// Failed to receive a message from the transport.
    #[error("transport receive error: {0}")]
    TransportReceive(String),

    /// The transport connection was closed unexpectedly.
    #[error("transport connection closed")]
    TransportClosed,

    /// Failed to serialize or deserialize a protocol message.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Attempted an operation that requires an active connection, but the client is not connected.
    #[error("not connected to server")]
    NotConnected,

    /// A local operation was invoked in a match phase that does not permit it.
    #[error("operation not valid in phase {phase:?}")]
    PhaseViolation {
        /// The phase the lifecycle was in when the operation was attempted.
        phase: MatchPhase,
    },

    /// A move was submitted while the input gate is closed (a previous move
    /// has not yet been acknowledged by the server).
    #[error("input gate closed: awaiting server acknowledgement")]
    InputGated,

    /// A voice operation was attempted while no match is in progress.
    #[error("voice requires a match in progress")]
    NotInMatch,

    /// Attempted a room operation but the client is not in a room.
    #[error("not in a room")]
    NotInRoom,

    /// Peer media negotiation failed (capture device denied, peer-connection
    /// operation rejected).
    #[error("negotiation failure: {0}")]
    Negotiation(String),

    /// An operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A specialized [`Result`] type for Gully client operations.
pub type Result<T> = std::result::Result<T, GullyError>;

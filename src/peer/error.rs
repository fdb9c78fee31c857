use thiserror::Error;

use super::connection::ConnectionState;

/// Errors that can occur during peer communication.
#[derive(Debug, Error)]
pub enum PeerError {
    /// Network I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer sent an invalid handshake.
    #[error("invalid handshake")]
    InvalidHandshake,

    /// The peer's info hash doesn't match ours.
    #[error("info hash mismatch")]
    InfoHashMismatch,

    /// The remote end presented our own peer id.
    #[error("connected to ourselves")]
    SelfConnection,

    /// Another connection to the same peer already exists.
    #[error("duplicate connection")]
    DuplicateConnection,

    /// Received a malformed protocol message.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Received an unknown message ID.
    #[error("invalid message id: {0}")]
    InvalidMessageId(u8),

    /// The connection was closed by the peer.
    #[error("connection closed")]
    ConnectionClosed,

    /// Operation timed out.
    #[error("timeout")]
    Timeout,

    /// Protocol violation by the peer.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The connection state machine does not allow this step.
    #[error("invalid transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },
}

impl PeerError {
    /// Returns true if the error was caused by the remote peer misbehaving.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            PeerError::InvalidHandshake
                | PeerError::InfoHashMismatch
                | PeerError::InvalidMessage(_)
                | PeerError::InvalidMessageId(_)
                | PeerError::Protocol(_)
        )
    }
}

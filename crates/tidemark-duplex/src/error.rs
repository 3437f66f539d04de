use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DuplexError {
    /// The connection has already completed (served and torn down, or
    /// rejected); no further calls are possible.
    #[error("connection already completed")]
    ConnectionCompleted,

    #[error("transport closed")]
    TransportClosed,

    #[error("handshake required before accepting or rejecting")]
    HandshakeRequired,

    #[error("protocol violation: unexpected {0} message")]
    ProtocolViolation(&'static str),
}

pub type DuplexResult<T> = Result<T, DuplexError>;

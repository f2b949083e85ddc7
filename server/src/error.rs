use thiserror::Error;

use whiteboard_protocol::{SessionId, ValidationError};

/// Per-session failure taxonomy. None of these are fatal to the relay
/// process; the worst outcome any of them carries is the termination of
/// the one session involved.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Malformed or out-of-state message. Fail-soft: the message is
    /// dropped, logged, and the connection survives.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The peer's socket or receiver is gone. The session is removed;
    /// the relay never retries.
    #[error("transport error: session {0} is unreachable")]
    Transport(SessionId),
    /// The peer's bounded outbound queue overflowed on a message that
    /// cannot be dropped. That one session is disconnected.
    #[error("capacity error: outbound queue overflow for session {0}")]
    Capacity(SessionId),
}

impl From<ValidationError> for RelayError {
    fn from(err: ValidationError) -> Self {
        RelayError::Protocol(err.to_string())
    }
}

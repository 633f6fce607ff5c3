use thiserror::Error;

use crate::message::{MessageKind, ProcessId, TokenKind};

/// Errors that can occur in the ring node library
#[derive(Error, Debug)]
pub enum RingError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// An inbound message no subscription claimed. The state machine can no
    /// longer be trusted, so this terminates the process.
    #[error("no subscription claimed {kind} message from process {source_id} with payload {payload:?}")]
    UnclaimedMessage {
        kind: MessageKind,
        payload: String,
        source_id: ProcessId,
    },

    /// Attempt to forward a token the participant does not hold
    #[error("tried to forward the {0} token while not holding it")]
    TokenNotHeld(TokenKind),

    /// Transport-level failure; non-recoverable for the receive loop
    #[error("Transport error: {0}")]
    Transport(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

/// Result type alias using RingError
pub type Result<T> = std::result::Result<T, RingError>;

impl From<String> for RingError {
    fn from(s: String) -> Self {
        RingError::Other(s)
    }
}

impl From<&str> for RingError {
    fn from(s: &str) -> Self {
        RingError::Other(s.to_string())
    }
}

impl From<serde_json::Error> for RingError {
    fn from(err: serde_json::Error) -> Self {
        RingError::Serialization(err.to_string())
    }
}

//! Wire-level data model: message kinds, token state, and the packet type
//! exchanged between ring participants.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a participant; doubles as its position in the ring.
pub type ProcessId = usize;

/// Signed sequence value carried by a token. The ping token conventionally
/// carries a positive value, the pong token its negation.
pub type TokenValue = i64;

/// The closed set of message kinds circulating in the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    /// Ping token transfer; holding ping grants critical-section entry.
    Ping,
    /// Pong token transfer; the ping token's mirror.
    Pong,
    /// Operator control message arming a one-shot send omission.
    FaultInject,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::Ping => write!(f, "PING"),
            MessageKind::Pong => write!(f, "PONG"),
            MessageKind::FaultInject => write!(f, "FAULT"),
        }
    }
}

impl MessageKind {
    /// The token this message kind transfers, if it is a token message.
    pub fn token_kind(&self) -> Option<TokenKind> {
        match self {
            MessageKind::Ping => Some(TokenKind::Ping),
            MessageKind::Pong => Some(TokenKind::Pong),
            MessageKind::FaultInject => None,
        }
    }
}

/// One of the two circulating tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TokenKind {
    Ping,
    Pong,
}

impl TokenKind {
    /// Payload string used by `FaultInject` messages to name a token.
    pub fn control_payload(&self) -> &'static str {
        match self {
            TokenKind::Ping => "PING",
            TokenKind::Pong => "PONG",
        }
    }

    /// Parse a `FaultInject` payload. Unknown payloads yield `None` and are
    /// reported by the caller, never treated as fatal.
    pub fn parse_control(payload: &str) -> Option<Self> {
        match payload {
            "PING" => Some(TokenKind::Ping),
            "PONG" => Some(TokenKind::Pong),
            _ => None,
        }
    }
}

impl From<TokenKind> for MessageKind {
    fn from(kind: TokenKind) -> Self {
        match kind {
            TokenKind::Ping => MessageKind::Ping,
            TokenKind::Pong => MessageKind::Pong,
        }
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.control_payload())
    }
}

/// A message as produced by the transport on receive and by the dispatcher
/// on send. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub kind: MessageKind,
    /// String-encoded token value, or a control string for `FaultInject`.
    pub payload: String,
    pub source: ProcessId,
    /// Lamport timestamp assigned by the sending transport.
    pub logical_time: u64,
}

impl Message {
    pub fn new(
        kind: MessageKind,
        payload: impl Into<String>,
        source: ProcessId,
        logical_time: u64,
    ) -> Self {
        Self {
            kind,
            payload: payload.into(),
            source,
            logical_time,
        }
    }
}

/// Local token state at one participant. `present` means the participant
/// currently holds the token and has not yet forwarded it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token {
    pub value: TokenValue,
    pub present: bool,
}

impl Token {
    pub fn new(value: TokenValue) -> Self {
        Self {
            value,
            present: false,
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {}]",
            self.value,
            if self.present { "held" } else { "away" }
        )
    }
}

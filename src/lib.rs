//! Loss-tolerant ring mutual exclusion.
//!
//! Implements Misra's dual-token ping-pong algorithm: participants form a
//! logical ring by process id, critical-section permission circulates with
//! the ping token, and a deliberately dropped message is repaired by local
//! regeneration of the lost token's sibling.

pub mod config;
pub mod console;
pub mod dispatch;
pub mod error;
pub mod message;
pub mod participant;
pub mod transport;

// Re-export commonly used types
pub use config::{DelayRange, RingConfig};
pub use dispatch::{Dispatcher, SubscriptionId};
pub use error::{Result, RingError};
pub use message::{Message, MessageKind, ProcessId, Token, TokenKind, TokenValue};
pub use participant::{MisraState, Participant, ProtocolEvent};
pub use transport::{ChannelCommunicator, Communicator};

//! Transport boundary. The core only sees the [`Communicator`] trait: a
//! point-to-point sender, a blocking receiver, and process identity with a
//! Lamport clock. The shipped implementation is an in-process full mesh of
//! tokio channels; a networked transport plugs in behind the same trait.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use crate::error::{Result, RingError};
use crate::message::{Message, MessageKind, ProcessId};

/// Point-to-point message transport between ring participants.
///
/// Delivery is FIFO per sender-receiver pair; arrivals from different senders
/// may interleave. Transport failures are non-recoverable for the caller's
/// receive loop.
#[async_trait]
pub trait Communicator: Send + Sync {
    /// Send one message to a single recipient; returns the message as
    /// transmitted (useful for logging, not required for correctness).
    async fn send(
        &self,
        kind: MessageKind,
        payload: String,
        recipient: ProcessId,
    ) -> Result<Message>;

    /// Send one message to a set of recipients with a single timestamp.
    async fn send_many(
        &self,
        kind: MessageKind,
        payload: String,
        recipients: &[ProcessId],
    ) -> Result<Message>;

    /// Send to every process except the local one.
    async fn send_others(&self, kind: MessageKind, payload: String) -> Result<Message>;

    /// Block until the next inbound message. `None` means the transport has
    /// shut down and no further messages will arrive.
    async fn recv(&self) -> Option<Message>;

    fn process_id(&self) -> ProcessId;

    fn process_count(&self) -> usize;

    /// Current Lamport clock value; monotonically non-decreasing.
    fn logical_clock(&self) -> u64;
}

/// In-memory mesh transport: every process owns one inbox and holds a sender
/// handle to every other inbox. A single mpsc queue per receiver preserves
/// FIFO order per sender link.
pub struct ChannelCommunicator {
    id: ProcessId,
    count: usize,
    clock: AtomicU64,
    links: Vec<mpsc::UnboundedSender<Message>>,
    inbox: Mutex<mpsc::UnboundedReceiver<Message>>,
}

impl ChannelCommunicator {
    /// Build a fully connected mesh of `count` communicators.
    pub fn mesh(count: usize) -> Vec<Arc<Self>> {
        let mut senders = Vec::with_capacity(count);
        let mut receivers = Vec::with_capacity(count);
        for _ in 0..count {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.push(tx);
            receivers.push(rx);
        }

        receivers
            .into_iter()
            .enumerate()
            .map(|(id, rx)| {
                Arc::new(Self {
                    id,
                    count,
                    clock: AtomicU64::new(0),
                    links: senders.clone(),
                    inbox: Mutex::new(rx),
                })
            })
            .collect()
    }

    /// Advance the clock for a send event and stamp a message with it.
    fn stamp(&self, kind: MessageKind, payload: String) -> Message {
        let time = self.clock.fetch_add(1, Ordering::SeqCst) + 1;
        Message::new(kind, payload, self.id, time)
    }

    fn deliver(&self, recipient: ProcessId, message: Message) -> Result<()> {
        let link = self.links.get(recipient).ok_or_else(|| {
            RingError::Transport(format!("no process {recipient} in a ring of {}", self.count))
        })?;
        link.send(message)
            .map_err(|_| RingError::Transport(format!("process {recipient} is gone")))
    }
}

#[async_trait]
impl Communicator for ChannelCommunicator {
    async fn send(
        &self,
        kind: MessageKind,
        payload: String,
        recipient: ProcessId,
    ) -> Result<Message> {
        let message = self.stamp(kind, payload);
        self.deliver(recipient, message.clone())?;
        Ok(message)
    }

    async fn send_many(
        &self,
        kind: MessageKind,
        payload: String,
        recipients: &[ProcessId],
    ) -> Result<Message> {
        let message = self.stamp(kind, payload);
        for &recipient in recipients {
            self.deliver(recipient, message.clone())?;
        }
        Ok(message)
    }

    async fn send_others(&self, kind: MessageKind, payload: String) -> Result<Message> {
        let others: Vec<ProcessId> = (0..self.count).filter(|&p| p != self.id).collect();
        self.send_many(kind, payload, &others).await
    }

    async fn recv(&self) -> Option<Message> {
        let mut inbox = self.inbox.lock().await;
        let message = inbox.recv().await?;
        // Lamport receive rule: jump past the sender's stamp, then tick.
        self.clock.fetch_max(message.logical_time, Ordering::SeqCst);
        self.clock.fetch_add(1, Ordering::SeqCst);
        Some(message)
    }

    fn process_id(&self) -> ProcessId {
        self.id
    }

    fn process_count(&self) -> usize {
        self.count
    }

    fn logical_clock(&self) -> u64 {
        self.clock.load(Ordering::SeqCst)
    }
}

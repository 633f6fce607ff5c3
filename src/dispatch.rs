//! Subscription-based message dispatch. One receive loop per process pulls
//! messages off the transport and hands each to every interested handler
//! before fetching the next, so handlers observe a serialized FIFO stream.
//!
//! Subscriptions are keyed by [`MessageKind`] rather than by free-form
//! predicates; the kind set is closed, which keeps dispatch cheap and makes
//! an unclaimed message an unambiguous protocol violation.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info};

use crate::error::{Result, RingError};
use crate::message::{Message, MessageKind, ProcessId};
use crate::transport::Communicator;

/// Stable handle returned by [`Dispatcher::subscribe`].
pub type SubscriptionId = u64;

type Handler = Box<dyn Fn(&Message) + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    kind: MessageKind,
    handler: Handler,
}

/// Routes inbound messages to subscribers and forwards outbound sends to the
/// transport with logging.
pub struct Dispatcher {
    communicator: Arc<dyn Communicator>,
    subscriptions: Mutex<Vec<Subscription>>,
    next_id: AtomicU64,
    listening: AtomicBool,
}

impl Dispatcher {
    pub fn new(communicator: Arc<dyn Communicator>) -> Arc<Self> {
        Arc::new(Self {
            communicator,
            subscriptions: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            listening: AtomicBool::new(false),
        })
    }

    /// Register a handler for one message kind. Handlers run on the receive
    /// loop and must be fast and non-blocking.
    pub fn subscribe(
        &self,
        kind: MessageKind,
        handler: impl Fn(&Message) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.registry().push(Subscription {
            id,
            kind,
            handler: Box::new(handler),
        });
        id
    }

    /// Remove a subscription; no-op if the id is unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.registry().retain(|sub| sub.id != id);
    }

    /// Send one message to a single recipient.
    pub async fn send(
        &self,
        kind: MessageKind,
        payload: impl Into<String>,
        recipient: ProcessId,
    ) -> Result<Message> {
        let payload = payload.into();
        debug!(
            process = self.process_id(),
            recipient,
            kind = %kind,
            payload = %payload,
            "sending message"
        );
        self.communicator.send(kind, payload, recipient).await
    }

    /// Send one message to a set of recipients.
    pub async fn send_many(
        &self,
        kind: MessageKind,
        payload: impl Into<String>,
        recipients: &[ProcessId],
    ) -> Result<Message> {
        let payload = payload.into();
        debug!(
            process = self.process_id(),
            ?recipients,
            kind = %kind,
            payload = %payload,
            "sending message to set"
        );
        self.communicator.send_many(kind, payload, recipients).await
    }

    /// Send to every other process.
    pub async fn send_others(
        &self,
        kind: MessageKind,
        payload: impl Into<String>,
    ) -> Result<Message> {
        let payload = payload.into();
        debug!(
            process = self.process_id(),
            kind = %kind,
            payload = %payload,
            "sending message to all others"
        );
        self.communicator.send_others(kind, payload).await
    }

    pub fn process_id(&self) -> ProcessId {
        self.communicator.process_id()
    }

    pub fn process_count(&self) -> usize {
        self.communicator.process_count()
    }

    pub fn logical_clock(&self) -> u64 {
        self.communicator.logical_clock()
    }

    /// Start the receive loop. Idempotent: only the first call spawns it.
    ///
    /// A fatal dispatch error (an unclaimed message) means the protocol state
    /// can no longer be trusted; it is reported and the process terminates.
    pub fn listen(self: &Arc<Self>) {
        if self.listening.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.receive_loop().await {
                error!(process = this.process_id(), error = %e, "receive loop hit a protocol violation");
                std::process::exit(1);
            }
        });
    }

    async fn receive_loop(&self) -> Result<()> {
        while let Some(message) = self.communicator.recv().await {
            debug!(
                process = self.process_id(),
                source = message.source,
                kind = %message.kind,
                payload = %message.payload,
                time = message.logical_time,
                "received message"
            );
            self.dispatch(&message)?;
        }
        info!(process = self.process_id(), "transport closed, receive loop exiting");
        Ok(())
    }

    /// Invoke every live subscription matching the message, in registration
    /// order, to completion. A message nobody claims is a correctness bug,
    /// not a recoverable event.
    fn dispatch(&self, message: &Message) -> Result<()> {
        let registry = self.registry();
        let mut claimed = 0usize;
        for sub in registry.iter() {
            if sub.kind == message.kind {
                (sub.handler)(message);
                claimed += 1;
            }
        }
        if claimed == 0 {
            return Err(RingError::UnclaimedMessage {
                kind: message.kind,
                payload: message.payload.clone(),
                source_id: message.source,
            });
        }
        Ok(())
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, Vec<Subscription>> {
        self.subscriptions
            .lock()
            .expect("subscription registry poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ChannelCommunicator;
    use std::time::Duration;

    fn pair() -> (Arc<Dispatcher>, Arc<Dispatcher>) {
        let mut mesh = ChannelCommunicator::mesh(2).into_iter();
        let a = Dispatcher::new(mesh.next().unwrap());
        let b = Dispatcher::new(mesh.next().unwrap());
        (a, b)
    }

    #[tokio::test]
    async fn test_handlers_run_in_registration_order() {
        let (a, _b) = pair();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second"] {
            let order = Arc::clone(&order);
            a.subscribe(MessageKind::Ping, move |_| {
                order.lock().unwrap().push(tag);
            });
        }
        a.subscribe(MessageKind::Pong, |_| panic!("wrong kind invoked"));

        let message = Message::new(MessageKind::Ping, "1", 1, 1);
        a.dispatch(&message).unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_unclaimed_message_is_fatal() {
        let (a, _b) = pair();
        a.subscribe(MessageKind::Ping, |_| {});

        let message = Message::new(MessageKind::Pong, "-1", 1, 1);
        let err = a.dispatch(&message).unwrap_err();
        assert!(matches!(err, RingError::UnclaimedMessage { .. }));
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_handler() {
        let (a, _b) = pair();
        let id = a.subscribe(MessageKind::Ping, |_| {});
        a.subscribe(MessageKind::Ping, |_| {});

        a.unsubscribe(id);
        // Unknown ids are a no-op.
        a.unsubscribe(9999);

        let message = Message::new(MessageKind::Ping, "1", 1, 1);
        assert!(a.dispatch(&message).is_ok());
        assert_eq!(a.registry().len(), 1);
    }

    #[tokio::test]
    async fn test_send_many_reaches_every_named_recipient() {
        let mut mesh = ChannelCommunicator::mesh(3).into_iter();
        let a = Dispatcher::new(mesh.next().unwrap());
        let b = Dispatcher::new(mesh.next().unwrap());
        let c = Dispatcher::new(mesh.next().unwrap());

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        for d in [&b, &c] {
            let tx = tx.clone();
            d.subscribe(MessageKind::FaultInject, move |message| {
                let _ = tx.send(message.clone());
            });
            d.listen();
        }

        let before = a.logical_clock();
        a.send_many(MessageKind::FaultInject, "PING", &[1, 2])
            .await
            .unwrap();
        assert!(a.logical_clock() > before);

        for _ in 0..2 {
            let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .expect("message not delivered")
                .unwrap();
            assert_eq!(received.source, 0);
            assert_eq!(received.payload, "PING");
        }
    }

    #[tokio::test]
    async fn test_listen_is_idempotent() {
        let (a, b) = pair();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        b.subscribe(MessageKind::Ping, move |message| {
            let _ = tx.send(message.clone());
        });

        b.listen();
        b.listen();

        a.send(MessageKind::Ping, "1", 1).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("message not delivered")
            .unwrap();
        assert_eq!(received.payload, "1");

        // A second listen() must not have started a competing loop that
        // could consume or duplicate deliveries.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }
}

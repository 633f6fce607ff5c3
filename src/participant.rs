//! Ring participant: Misra's dual-token mutual-exclusion state machine.
//!
//! Two tokens circulate around the ring. Holding `ping` grants entry to the
//! critical section; `pong` is its negated mirror. A participant that
//! receives a token whose value equals the last value it forwarded (`m`)
//! knows the sibling token was lost in transit and regenerates the pair
//! locally. When both tokens meet at one participant a full lap has
//! completed and a new, strictly larger round value is minted.
//!
//! All token state is owned by a single actor task; dispatcher callbacks
//! only forward inbound messages into the actor's queue, so every
//! read-modify-write on the state is serialized without locks.

use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::{RingConfig, TimingConfig};
use crate::dispatch::Dispatcher;
use crate::error::{Result, RingError};
use crate::message::{Message, MessageKind, ProcessId, Token, TokenKind, TokenValue};

/// Outcome of applying one received token to the state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenUpdate {
    /// Sequence magnitude below the last forwarded value; state untouched.
    Stale,
    /// Token recorded as present, nothing else inferred.
    Accepted,
    /// The sibling token was lost; a fresh pair was manufactured locally.
    Regenerated,
    /// Both tokens met here; a new round value was minted.
    Incarnated,
}

/// Observable protocol milestones, published on a broadcast channel for
/// tests and external observers. Lagging subscribers may miss events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolEvent {
    EnteredCs { value: TokenValue },
    LeftCs,
    Forwarded { kind: TokenKind, value: TokenValue, to: ProcessId },
    Omitted { kind: TokenKind, value: TokenValue },
    Regenerated { value: TokenValue },
    Incarnated { value: TokenValue },
    StaleDiscarded { kind: TokenKind, value: TokenValue },
}

/// The Misra algorithm variables for one participant.
///
/// `m` is the last value this participant forwarded, signed to encode which
/// token it was. It is updated only at the moment a token is sent, never on
/// receipt; the staleness and regeneration rules both compare against it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MisraState {
    pub ping: Token,
    pub pong: Token,
    pub m: TokenValue,
    pub omit_next_ping: bool,
    pub omit_next_pong: bool,
}

impl MisraState {
    pub fn new() -> Self {
        Self {
            ping: Token::new(1),
            pong: Token::new(-1),
            m: 0,
            omit_next_ping: false,
            omit_next_pong: false,
        }
    }

    /// Apply an arriving ping token.
    pub fn receive_ping(&mut self, value: TokenValue) -> TokenUpdate {
        if value.abs() < self.m.abs() {
            return TokenUpdate::Stale;
        }
        self.ping = Token {
            value,
            present: true,
        };
        if self.m == value {
            // The pong we sent after this ping never made it anywhere:
            // had it arrived, the receiver's forward would have moved m past
            // this value before the ping came back around.
            self.regenerate(value);
            return TokenUpdate::Regenerated;
        }
        TokenUpdate::Accepted
    }

    /// Apply an arriving pong token.
    pub fn receive_pong(&mut self, value: TokenValue) -> TokenUpdate {
        if value.abs() < self.m.abs() {
            return TokenUpdate::Stale;
        }
        self.pong = Token {
            value,
            present: true,
        };
        if self.m == value {
            // The sibling ping was lost after our last forward.
            self.regenerate(value);
            return TokenUpdate::Regenerated;
        }
        if self.ping.present && self.pong.present {
            self.incarnate(value);
            return TokenUpdate::Incarnated;
        }
        TokenUpdate::Accepted
    }

    /// Manufacture a fresh token pair in place of a lost sibling.
    fn regenerate(&mut self, value: TokenValue) {
        self.ping = Token {
            value: value.abs(),
            present: true,
        };
        self.pong = Token {
            value: -value.abs(),
            present: true,
        };
    }

    /// Both tokens met here: advance the round value.
    fn incarnate(&mut self, value: TokenValue) {
        self.ping.value = value.abs() + 1;
        self.pong.value = -self.ping.value;
    }

    /// Arm a one-shot omission of the next outbound send of `kind`.
    pub fn arm_omission(&mut self, kind: TokenKind) {
        match kind {
            TokenKind::Ping => self.omit_next_ping = true,
            TokenKind::Pong => self.omit_next_pong = true,
        }
    }

    /// Release a token for sending: clears `present`, records `m`, and
    /// reports whether an injected fault consumed this send. Releasing a
    /// token that is not held means the state machine reached an impossible
    /// state and must fail loudly.
    pub fn release_for_send(&mut self, kind: TokenKind) -> Result<(TokenValue, bool)> {
        match kind {
            TokenKind::Ping => {
                if !self.ping.present {
                    return Err(RingError::TokenNotHeld(kind));
                }
                self.ping.present = false;
                self.m = self.ping.value;
                Ok((self.ping.value, std::mem::take(&mut self.omit_next_ping)))
            }
            TokenKind::Pong => {
                if !self.pong.present {
                    return Err(RingError::TokenNotHeld(kind));
                }
                self.pong.present = false;
                self.m = self.pong.value;
                Ok((self.pong.value, std::mem::take(&mut self.omit_next_pong)))
            }
        }
    }
}

impl Default for MisraState {
    fn default() -> Self {
        Self::new()
    }
}

/// One ring participant, driven by an inbox fed from its dispatcher
/// subscriptions. Construct it before calling [`Dispatcher::listen`] so no
/// message can arrive unclaimed.
pub struct Participant {
    dispatcher: Arc<Dispatcher>,
    timing: TimingConfig,
    seeds_tokens: bool,
    state: MisraState,
    inbox: mpsc::UnboundedReceiver<Message>,
    events: broadcast::Sender<ProtocolEvent>,
}

impl Participant {
    pub fn new(dispatcher: Arc<Dispatcher>, config: &RingConfig) -> Self {
        let (tx, inbox) = mpsc::unbounded_channel();
        for kind in [MessageKind::Ping, MessageKind::Pong, MessageKind::FaultInject] {
            let tx = tx.clone();
            dispatcher.subscribe(kind, move |message| {
                // The actor may already be gone during shutdown; dropping the
                // message then is fine.
                let _ = tx.send(message.clone());
            });
        }

        let (events, _) = broadcast::channel(1024);
        Self {
            seeds_tokens: dispatcher.process_id() == config.ring.coordinator,
            timing: config.timing.clone(),
            dispatcher,
            state: MisraState::new(),
            inbox,
            events,
        }
    }

    /// Subscribe to protocol milestones. Call before [`Participant::run`].
    pub fn subscribe_events(&self) -> broadcast::Receiver<ProtocolEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: ProtocolEvent) {
        let _ = self.events.send(event);
    }

    /// Drive the participant until the transport shuts down.
    pub async fn run(mut self) -> Result<()> {
        let id = self.dispatcher.process_id();
        if self.seeds_tokens {
            self.state.ping.present = true;
            self.state.pong.present = true;
            info!(process = id, "seeded the initial ping/pong pair");
        }

        loop {
            // Wait until holding ping permits critical-section entry.
            while !self.state.ping.present {
                match self.inbox.recv().await {
                    Some(message) => self.apply(&message),
                    None => return Ok(()),
                }
            }

            let value = self.state.ping.value;
            info!(process = id, value, "entered critical section");
            self.emit(ProtocolEvent::EnteredCs { value });
            sleep(self.timing.cs_hold.sample()).await;
            info!(process = id, "left critical section");
            self.emit(ProtocolEvent::LeftCs);

            // Absorb anything that arrived during the critical section so a
            // pong that caught up with us is forwarded in this cycle.
            while let Ok(message) = self.inbox.try_recv() {
                self.apply(&message);
            }

            sleep(self.timing.ping_forward_delay.sample()).await;
            self.forward(TokenKind::Ping).await?;
            // Pong never travels ahead of its sibling ping: it is forwarded
            // only here, after ping has left this participant.
            if self.state.pong.present {
                sleep(self.timing.pong_forward_delay.sample()).await;
                self.forward(TokenKind::Pong).await?;
            }
        }
    }

    /// Apply one inbound message to the state.
    fn apply(&mut self, message: &Message) {
        let id = self.dispatcher.process_id();
        match message.kind {
            MessageKind::Ping | MessageKind::Pong => {
                let value: TokenValue = match message.payload.parse() {
                    Ok(v) => v,
                    Err(_) => {
                        warn!(
                            process = id,
                            source = message.source,
                            payload = %message.payload,
                            "unparseable token payload, ignoring"
                        );
                        return;
                    }
                };
                let (kind, update) = if message.kind == MessageKind::Ping {
                    (TokenKind::Ping, self.state.receive_ping(value))
                } else {
                    (TokenKind::Pong, self.state.receive_pong(value))
                };
                match update {
                    TokenUpdate::Stale => {
                        debug!(
                            process = id,
                            kind = %kind,
                            value,
                            m = self.state.m,
                            "an old token arrived, ignoring it"
                        );
                        self.emit(ProtocolEvent::StaleDiscarded { kind, value });
                    }
                    TokenUpdate::Accepted => {}
                    TokenUpdate::Regenerated => {
                        info!(
                            process = id,
                            value = self.state.ping.value,
                            "sibling token lost, regenerated the pair"
                        );
                        self.emit(ProtocolEvent::Regenerated {
                            value: self.state.ping.value,
                        });
                    }
                    TokenUpdate::Incarnated => {
                        info!(
                            process = id,
                            value = self.state.ping.value,
                            "tokens met, incarnated a new round"
                        );
                        self.emit(ProtocolEvent::Incarnated {
                            value: self.state.ping.value,
                        });
                    }
                }
            }
            MessageKind::FaultInject => match TokenKind::parse_control(&message.payload) {
                Some(kind) => {
                    warn!(process = id, kind = %kind, "armed omission of the next send");
                    self.state.arm_omission(kind);
                }
                None => {
                    warn!(
                        process = id,
                        source = message.source,
                        payload = %message.payload,
                        "unexpected fault payload, ignoring"
                    );
                }
            },
        }
    }

    /// Forward a held token to the ring successor, honoring an armed
    /// omission by behaving exactly as if the message were lost in transit.
    async fn forward(&mut self, kind: TokenKind) -> Result<()> {
        let id = self.dispatcher.process_id();
        let next = (id + 1) % self.dispatcher.process_count();
        let (value, omitted) = self.state.release_for_send(kind)?;
        if omitted {
            warn!(process = id, kind = %kind, value, "omitting send, simulating message loss");
            self.emit(ProtocolEvent::Omitted { kind, value });
            return Ok(());
        }
        self.dispatcher
            .send(kind.into(), value.to_string(), next)
            .await?;
        self.emit(ProtocolEvent::Forwarded { kind, value, to: next });
        Ok(())
    }
}

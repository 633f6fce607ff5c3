//! Integration tests driving a full ring of participants over the
//! in-memory mesh transport.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

use misra_ring::config::{DelayRange, RingConfig};
use misra_ring::dispatch::Dispatcher;
use misra_ring::message::{MessageKind, ProcessId, TokenKind};
use misra_ring::participant::{Participant, ProtocolEvent};
use misra_ring::transport::{ChannelCommunicator, Communicator};

/// A ring configuration with delays short enough for tests.
fn test_config(process_count: usize) -> RingConfig {
    let mut config = RingConfig::default();
    config.ring.process_count = process_count;
    config.timing.cs_hold = DelayRange::new(20, 30);
    config.timing.ping_forward_delay = DelayRange::new(1, 3);
    config.timing.pong_forward_delay = DelayRange::new(1, 2);
    config
}

/// Spawn a full ring and merge every participant's protocol events into a
/// single stream tagged with the emitting process id.
fn start_ring(
    config: &RingConfig,
) -> (
    Vec<Arc<Dispatcher>>,
    mpsc::UnboundedReceiver<(ProcessId, ProtocolEvent)>,
) {
    let mesh = ChannelCommunicator::mesh(config.ring.process_count);
    let (tx, rx) = mpsc::unbounded_channel();
    let mut dispatchers = Vec::new();

    for communicator in mesh {
        let process = communicator.process_id();
        let dispatcher = Dispatcher::new(communicator);
        let participant = Participant::new(Arc::clone(&dispatcher), config);

        let mut events = participant.subscribe_events();
        let tx = tx.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if tx.send((process, event)).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        dispatcher.listen();
        tokio::spawn(participant.run());
        dispatchers.push(dispatcher);
    }

    (dispatchers, rx)
}

#[tokio::test]
async fn test_every_participant_gets_a_turn_and_at_most_one_is_in_cs() {
    let config = test_config(3);
    let (_dispatchers, mut events) = start_ring(&config);

    let body = async {
        let mut cs_entries: HashMap<ProcessId, usize> = HashMap::new();
        let mut in_cs = 0usize;
        let mut first_forward: Vec<(ProcessId, TokenKind)> = Vec::new();

        while let Some((process, event)) = events.recv().await {
            match event {
                ProtocolEvent::EnteredCs { .. } => {
                    in_cs += 1;
                    assert!(in_cs <= 1, "two participants in the critical section");
                    *cs_entries.entry(process).or_default() += 1;
                }
                ProtocolEvent::LeftCs => {
                    in_cs = in_cs.saturating_sub(1);
                }
                ProtocolEvent::Forwarded { kind, .. } => {
                    first_forward.push((process, kind));
                }
                _ => {}
            }
            if cs_entries.len() == 3 && cs_entries.values().all(|&n| n >= 3) {
                break;
            }
        }

        // Bootstrap ordering: the coordinator's very first forwards are
        // ping, then pong, in that order.
        let p0: Vec<TokenKind> = first_forward
            .iter()
            .filter(|(p, _)| *p == 0)
            .map(|(_, k)| *k)
            .take(2)
            .collect();
        assert_eq!(p0, vec![TokenKind::Ping, TokenKind::Pong]);
    };

    timeout(Duration::from_secs(20), body)
        .await
        .expect("ring made no progress");
}

#[tokio::test]
async fn test_incarnation_values_increase_monotonically() {
    let config = test_config(3);
    let (_dispatchers, mut events) = start_ring(&config);

    let body = async {
        let mut last_incarnation: HashMap<ProcessId, i64> = HashMap::new();
        let mut seen = 0usize;

        while let Some((process, event)) = events.recv().await {
            if let ProtocolEvent::Incarnated { value } = event {
                if let Some(&previous) = last_incarnation.get(&process) {
                    assert!(
                        value > previous,
                        "incarnation value went from {previous} to {value} at process {process}"
                    );
                }
                last_incarnation.insert(process, value);
                seen += 1;
                if seen >= 10 {
                    break;
                }
            }
        }
    };

    timeout(Duration::from_secs(20), body)
        .await
        .expect("not enough incarnations observed");
}

#[tokio::test]
async fn test_pong_loss_is_repaired_by_regeneration() {
    let config = test_config(3);
    let (dispatchers, mut events) = start_ring(&config);

    // Operator drops process 1's next pong send.
    dispatchers[0]
        .send(
            MessageKind::FaultInject,
            TokenKind::Pong.control_payload(),
            1,
        )
        .await
        .unwrap();

    let body = async {
        let mut omitted = false;
        let mut regenerated = false;
        let mut incarnations_after_repair = 0usize;

        while let Some((process, event)) = events.recv().await {
            match event {
                ProtocolEvent::Omitted { kind, .. } => {
                    assert_eq!(kind, TokenKind::Pong);
                    assert_eq!(process, 1);
                    omitted = true;
                }
                ProtocolEvent::Regenerated { .. } => {
                    assert!(omitted, "regeneration before any loss");
                    regenerated = true;
                }
                ProtocolEvent::Incarnated { .. } if regenerated => {
                    // The regenerated pair is circulating again.
                    incarnations_after_repair += 1;
                    if incarnations_after_repair >= 2 {
                        return;
                    }
                }
                _ => {}
            }
        }
        panic!("event stream ended before the ring recovered");
    };

    timeout(Duration::from_secs(30), body)
        .await
        .expect("ring did not recover from a single pong loss");
}

#[tokio::test]
async fn test_ping_fault_suppresses_the_next_ping_send() {
    let config = test_config(3);
    let (dispatchers, mut events) = start_ring(&config);

    dispatchers[0]
        .send(
            MessageKind::FaultInject,
            TokenKind::Ping.control_payload(),
            1,
        )
        .await
        .unwrap();

    let body = async {
        while let Some((process, event)) = events.recv().await {
            if let ProtocolEvent::Omitted { kind, .. } = event {
                assert_eq!(process, 1);
                assert_eq!(kind, TokenKind::Ping);
                return;
            }
        }
        panic!("event stream ended without an omission");
    };

    timeout(Duration::from_secs(20), body)
        .await
        .expect("injected ping fault never fired");
}

#[tokio::test]
async fn test_unknown_fault_payload_is_ignored() {
    let config = test_config(2);
    let (dispatchers, mut events) = start_ring(&config);

    dispatchers[0]
        .send(MessageKind::FaultInject, "EXPLODE", 1)
        .await
        .unwrap();

    // The bogus control message must not stop the ring or drop a token.
    let body = async {
        let mut entries_at_p1 = 0usize;
        while let Some((process, event)) = events.recv().await {
            if process == 1 && matches!(event, ProtocolEvent::EnteredCs { .. }) {
                entries_at_p1 += 1;
                if entries_at_p1 >= 3 {
                    return;
                }
            }
        }
        panic!("event stream ended early");
    };

    timeout(Duration::from_secs(20), body)
        .await
        .expect("ring stalled after an unknown fault payload");
}

//! Operator control surface: a line-oriented console on the coordinator
//! that injects one-shot send omissions into named participants.
//!
//! Commands have the shape `<letter> <processId>`: `q` drops the target's
//! next ping send, `w` its next pong send. Bad input is reported and
//! ignored, never fatal.

use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use crate::dispatch::Dispatcher;
use crate::error::Result;
use crate::message::{MessageKind, ProcessId, TokenKind};

/// Parse one console line into a fault command.
pub fn parse_command(line: &str, process_count: usize) -> std::result::Result<(TokenKind, ProcessId), String> {
    let mut parts = line.split_whitespace();
    let letter = parts.next().ok_or_else(|| "empty command".to_string())?;
    let target = parts
        .next()
        .ok_or_else(|| format!("missing process id in {line:?}"))?;
    if parts.next().is_some() {
        return Err(format!("trailing input in {line:?}"));
    }

    let kind = match letter {
        "q" => TokenKind::Ping,
        "w" => TokenKind::Pong,
        other => return Err(format!("unknown command {other:?}, expected q or w")),
    };
    let target: ProcessId = target
        .parse()
        .map_err(|_| format!("{target:?} is not a process id"))?;
    if target >= process_count {
        return Err(format!(
            "process {target} is outside the ring of {process_count} processes"
        ));
    }
    Ok((kind, target))
}

/// Read fault commands from stdin until it closes, sending each as a
/// `FaultInject` message to the named participant.
pub async fn run_console(dispatcher: Arc<Dispatcher>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    info!("operator console ready: `q <id>` drops a ping send, `w <id>` a pong send");

    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        match parse_command(&line, dispatcher.process_count()) {
            Ok((kind, target)) => {
                info!(target, kind = %kind, "injecting send omission");
                dispatcher
                    .send(MessageKind::FaultInject, kind.control_payload(), target)
                    .await?;
            }
            Err(reason) => warn!(%reason, "ignoring console input"),
        }
    }
    Ok(())
}

//! The UI channel: newline-delimited JSON packets between the parent
//! process and this worker. stdin carries task envelopes and body-fetch
//! requests; stdout carries store deltas and one-line replies. Log output
//! never touches stdout.

use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::error::SyncError;
use crate::store::Delta;

/// How long the channel may stay broken before the worker assumes its
/// parent died and terminates itself.
pub const ORPHAN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// Run the local phase, then interrupt the foreground worker.
    TaskQueued(Value),
    /// Queue ids for on-demand body fetch, then interrupt.
    NeedBodies(Vec<String>),
}

pub fn parse_packet(line: &str) -> Result<Packet, SyncError> {
    let value: Value =
        serde_json::from_str(line).map_err(|e| SyncError::Channel(format!("bad packet: {}", e)))?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| SyncError::Channel("packet has no type".into()))?;

    match kind {
        "task-queued" => {
            let task = value
                .get("task")
                .cloned()
                .ok_or_else(|| SyncError::Channel("task-queued without task".into()))?;
            Ok(Packet::TaskQueued(task))
        }
        "need-bodies" => {
            let ids = value
                .get("ids")
                .and_then(Value::as_array)
                .ok_or_else(|| SyncError::Channel("need-bodies without ids".into()))?
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect();
            Ok(Packet::NeedBodies(ids))
        }
        other => Err(SyncError::Channel(format!("unknown packet type {}", other))),
    }
}

/// Tracks how long the inbound channel has been closed or broken. The
/// listener feeds it; once the threshold passes the worker exits.
pub struct OrphanWatch {
    armed: bool,
    broken_since: Option<Instant>,
}

impl OrphanWatch {
    /// `armed = false` (the `--orphan` flag) disables the liveness check
    /// entirely, for debugging against a detached worker.
    pub fn new(armed: bool) -> OrphanWatch {
        OrphanWatch {
            armed,
            broken_since: None,
        }
    }

    pub fn alive(&mut self) {
        self.broken_since = None;
    }

    /// Report a broken read; true once the channel has been continuously
    /// broken for the full timeout.
    pub fn broken(&mut self, now: Instant) -> bool {
        if !self.armed {
            return false;
        }
        let since = *self.broken_since.get_or_insert(now);
        now.duration_since(since) >= ORPHAN_TIMEOUT
    }
}

/// Owns stdout. Deltas from the store observers and direct replies are
/// serialized here, one JSON document per line.
pub async fn run_writer(delta_rx: flume::Receiver<Delta>, reply_rx: flume::Receiver<Value>) {
    let mut stdout = tokio::io::stdout();
    loop {
        let value = tokio::select! {
            delta = delta_rx.recv_async() => match delta {
                Ok(delta) => match serde_json::to_value(&delta) {
                    Ok(value) => value,
                    Err(e) => {
                        warn!("unserializable delta: {}", e);
                        continue;
                    }
                },
                Err(_) => return,
            },
            reply = reply_rx.recv_async() => match reply {
                Ok(value) => value,
                Err(_) => return,
            },
        };

        let mut line = value.to_string();
        line.push('\n');
        if stdout.write_all(line.as_bytes()).await.is_err() {
            // Parent went away; the orphan watchdog handles shutdown.
            return;
        }
        let _ = stdout.flush().await;
    }
}

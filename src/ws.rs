//! Live progress fan-out to connected viewers.
//!
//! Every event received from a runner, plus run start/finish notifications,
//! is delivered to all currently connected WebSocket clients. Delivery is
//! at-most-once and unfiltered: viewers discard events for runs they are not
//! displaying, and a reconnecting viewer recovers state from the run store,
//! not from this stream.

use axum::{
    body::Bytes,
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::warn;

use crate::models::RunStatus;
use crate::runner::protocol::RunEvent;

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

// ── WebSocket message types ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum WsMessage {
    RunStarted {
        run_id: i64,
    },
    RunEvent {
        run_id: i64,
        event: RunEvent,
    },
    RunFinished {
        run_id: i64,
        status: RunStatus,
    },
}

// ── WebSocket handler ────────────────────────────────────────────────

/// WebSocket handler that subscribes the client to the broadcast channel.
pub async fn ws_handler_with_sender(
    ws: WebSocketUpgrade,
    tx: broadcast::Sender<String>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, tx))
}

async fn handle_socket(socket: WebSocket, tx: broadcast::Sender<String>) {
    let (sender, receiver) = socket.split();
    let rx = tx.subscribe();
    run_socket_loop(sender, receiver, rx).await;
}

/// Core WebSocket loop with ping/pong keepalive.
///
/// Combines broadcast forwarding, client message receiving, and periodic
/// ping/pong health checking into a single select loop. If no Pong is
/// received within [`PONG_TIMEOUT`] after a Ping is sent, the connection
/// is considered dead and the loop exits.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: broadcast::Receiver<String>,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately; consume it so the first real
    // ping fires after PING_INTERVAL has elapsed.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            // ── Periodic ping ───────────────────────────────────────
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    // Connection is dead — no pong received in time
                    break;
                }
                if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            // ── Broadcast forwarding ────────────────────────────────
            result = rx.recv() => {
                match result {
                    Ok(msg) => {
                        if sender.send(Message::Text(msg.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        // Missed some messages; continue receiving
                        continue;
                    }
                }
            }

            // ── Client messages (pong, close, etc.) ─────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        // Ignore other messages from client (Text, Binary, Ping)
                    }
                    Some(Err(_)) => break,
                }
            }
        }
    }

    // Best-effort close frame
    let _ = sender.send(Message::Close(None)).await;
}

// ── Broadcast helper ─────────────────────────────────────────────────

/// Serialize and broadcast a WsMessage to all connected WebSocket clients.
/// Returns silently even if no clients are connected.
pub fn broadcast_message(tx: &broadcast::Sender<String>, msg: &WsMessage) {
    match serde_json::to_string(msg) {
        Ok(json) => {
            let _ = tx.send(json); // Ignore error if no receivers
        }
        Err(e) => {
            warn!(error = %e, "Failed to serialize WsMessage");
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_started_serialization() {
        let msg = WsMessage::RunStarted { run_id: 5 };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"RunStarted\""));
        assert!(json.contains("\"run_id\":5"));
    }

    #[test]
    fn test_run_event_wraps_wire_envelope() {
        let msg = WsMessage::RunEvent {
            run_id: 2,
            event: RunEvent::RunStart {
                title: "smoke".to_string(),
            },
        };
        let json = serde_json::to_string(&msg).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["type"], "RunEvent");
        assert_eq!(parsed["data"]["run_id"], 2);
        assert_eq!(parsed["data"]["event"]["type"], "run:start");
        assert_eq!(parsed["data"]["event"]["payload"]["title"], "smoke");
    }

    #[test]
    fn test_run_finished_serialization() {
        let msg = WsMessage::RunFinished {
            run_id: 9,
            status: RunStatus::Failed,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"RunFinished\""));
        assert!(json.contains("\"status\":\"failed\""));
    }

    #[test]
    fn test_roundtrip_deserialization() {
        let msg = WsMessage::RunFinished {
            run_id: 1,
            status: RunStatus::Completed,
        };
        let json = serde_json::to_string(&msg).unwrap();
        let deserialized: WsMessage = serde_json::from_str(&json).unwrap();
        match deserialized {
            WsMessage::RunFinished { run_id, status } => {
                assert_eq!(run_id, 1);
                assert_eq!(status, RunStatus::Completed);
            }
            _ => panic!("Expected RunFinished variant"),
        }
    }

    #[tokio::test]
    async fn test_broadcast_delivers_to_all_subscribers() {
        let (tx, _) = tokio::sync::broadcast::channel::<String>(16);
        let mut rx1 = tx.subscribe();
        let mut rx2 = tx.subscribe();

        broadcast_message(&tx, &WsMessage::RunStarted { run_id: 1 });

        let received1 = rx1.recv().await.unwrap();
        let received2 = rx2.recv().await.unwrap();
        assert!(received1.contains("RunStarted"));
        assert_eq!(received1, received2);
    }

    #[tokio::test]
    async fn test_broadcast_no_receivers_does_not_panic() {
        let (tx, _) = tokio::sync::broadcast::channel::<String>(16);
        broadcast_message(&tx, &WsMessage::RunStarted { run_id: 1 });
    }

    #[test]
    fn test_keepalive_constants() {
        // PONG_TIMEOUT must exceed PING_INTERVAL so a fresh connection is
        // not immediately considered dead.
        assert!(PONG_TIMEOUT > PING_INTERVAL);
    }
}

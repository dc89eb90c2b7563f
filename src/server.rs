//! The realtime channel (spec §6): a WebSocket endpoint that accepts the
//! four subscriber commands and fans out status transitions as they occur.
//! Everything that decides *what* a command does lives in
//! [`crate::ingress`]; this module only owns the wire framing.

use std::sync::Arc;

use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use serde::Serialize;
use tracing::{debug, warn};

use crate::broadcaster::StatusUpdate;
use crate::classify;
use crate::ingress::{self, Command, Reply};
use crate::supervisor::Supervisor;

#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<Supervisor>,
}

/// Server→client `individualTunnelStatus` message (spec §6).
#[derive(Debug, Serialize)]
struct IndividualTunnelStatus<'a> {
    name: &'a str,
    status: &'a crate::state::StatusRecord,
}

/// Server→client `error` message (spec §6). Informational only — it never
/// substitutes for a status transition, which is published separately
/// (spec §7: errors are never thrown across the handler boundary).
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorNotice<'a> {
    name: &'a str,
    error: &'a str,
    error_kind: &'static str,
}

/// One outbound envelope. Mirrors [`Reply`] plus the two broadcast-only
/// variants that don't originate from a command reply.
#[derive(Debug, Serialize)]
#[serde(tag = "message", content = "payload")]
enum OutgoingMessage<'a> {
    #[serde(rename = "tunnelStatus")]
    TunnelStatus(&'a std::collections::HashMap<String, crate::state::StatusRecord>),
    #[serde(rename = "individualTunnelStatus")]
    IndividualTunnelStatus(IndividualTunnelStatus<'a>),
    #[serde(rename = "diagnosticResult")]
    DiagnosticResult(&'a crate::state::DiagnosticResult),
    #[serde(rename = "error")]
    Error(ErrorNotice<'a>),
}

fn kind_str(kind: classify::ErrorKind) -> &'static str {
    match kind {
        classify::ErrorKind::Auth => "auth",
        classify::ErrorKind::Network => "network",
        classify::ErrorKind::PortConflict => "portConflict",
        classify::ErrorKind::Permission => "permission",
        classify::ErrorKind::Timeout => "timeout",
        classify::ErrorKind::Unknown => "unknown",
    }
}

pub fn router(supervisor: Arc<Supervisor>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(healthz))
        .with_state(AppState { supervisor })
}

/// Process liveness, distinct from any tunnel's status — returns 200 for
/// as long as the supervisor's actor set is reachable at all.
async fn healthz() -> &'static str {
    "ok"
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    // Subscribe before sending the snapshot, not after: a status change
    // published between snapshot and subscribe would otherwise be lost
    // (spec §4.5, §6).
    let mut updates = state.supervisor.broadcaster().subscribe();
    let snapshot = state.supervisor.snapshot();
    if send_json(&mut sender, &OutgoingMessage::TunnelStatus(&snapshot)).await.is_err() {
        return;
    }

    let supervisor = state.supervisor.clone();
    let mut fanout_sender = sender;

    loop {
        tokio::select! {
            update = updates.recv() => {
                match update {
                    Ok(StatusUpdate { name, record }) => {
                        if record.status == "failed" {
                            if let Some(reason) = record.reason.as_deref() {
                                let kind = classify::classify(reason);
                                let notice = ErrorNotice { name: &name, error: reason, error_kind: kind_str(kind) };
                                if send_json(&mut fanout_sender, &OutgoingMessage::Error(notice)).await.is_err() {
                                    break;
                                }
                            }
                        }
                        let payload = IndividualTunnelStatus { name: &name, status: &record };
                        if send_json(&mut fanout_sender, &OutgoingMessage::IndividualTunnelStatus(payload)).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "subscriber lagged behind status broadcasts");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if !handle_incoming(&text, &supervisor, &mut fanout_sender).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(error = %e, "websocket receive error");
                        break;
                    }
                }
            }
        }
    }
}

/// Decode and dispatch one inbound text frame. Returns `false` if the
/// connection should be torn down.
async fn handle_incoming(
    text: &str,
    supervisor: &Arc<Supervisor>,
    sender: &mut futures_util::stream::SplitSink<WebSocket, Message>,
) -> bool {
    let command: Command = match serde_json::from_str(text) {
        Ok(command) => command,
        Err(e) => {
            let notice = ErrorNotice { name: "", error: &format!("malformed command: {e}"), error_kind: "unknown" };
            return send_json(sender, &OutgoingMessage::Error(notice)).await.is_ok();
        }
    };

    match ingress::handle_command(supervisor, command).await {
        Some(Reply::TunnelStatus(map)) => send_json(sender, &OutgoingMessage::TunnelStatus(&map)).await.is_ok(),
        Some(Reply::DiagnosticResult(result)) => {
            send_json(sender, &OutgoingMessage::DiagnosticResult(&result)).await.is_ok()
        }
        Some(Reply::Error { name, error }) => {
            let name = name.unwrap_or_default();
            let notice = ErrorNotice { name: &name, error: &error, error_kind: kind_str(classify::classify(&error)) };
            send_json(sender, &OutgoingMessage::Error(notice)).await.is_ok()
        }
        None => true,
    }
}

async fn send_json(
    sender: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    message: &OutgoingMessage<'_>,
) -> Result<(), axum::Error> {
    use futures_util::SinkExt;
    let text = serde_json::to_string(message).expect("status messages are always serializable");
    sender.send(Message::Text(text)).await
}

use futures_util::StreamExt;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_strings_are_stable() {
        assert_eq!(kind_str(classify::ErrorKind::Auth), "auth");
        assert_eq!(kind_str(classify::ErrorKind::Network), "network");
        assert_eq!(kind_str(classify::ErrorKind::PortConflict), "portConflict");
        assert_eq!(kind_str(classify::ErrorKind::Permission), "permission");
        assert_eq!(kind_str(classify::ErrorKind::Timeout), "timeout");
        assert_eq!(kind_str(classify::ErrorKind::Unknown), "unknown");
    }
}

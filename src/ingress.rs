//! Command Ingress (spec §4.7): translates the four subscriber-facing
//! commands into calls on the [`Supervisor`], independent of whatever
//! transport carries them. `server.rs` is the only caller — kept separate
//! so the command vocabulary doesn't leak axum/websocket types into the
//! supervisor itself.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::TunnelConfig;
use crate::state::{DiagnosticResult, StatusRecord};
use crate::supervisor::Supervisor;

/// One inbound command (spec §6's client→server message table).
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "message", content = "payload", rename_all = "camelCase")]
pub enum Command {
    ConnectToHost(TunnelConfig),
    CloseTunnel { name: String },
    GetTunnelStatus,
    Diagnose { name: String },
}

/// One outbound reply (spec §6's server→client message table).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "message", content = "payload", rename_all = "camelCase")]
pub enum Reply {
    TunnelStatus(HashMap<String, StatusRecord>),
    DiagnosticResult(DiagnosticResult),
    Error { name: Option<String>, error: String },
}

/// Handle one command and produce the (at most one) immediate reply.
/// Status broadcasts triggered by the command arrive separately, over the
/// [`crate::broadcaster::StatusBroadcaster`] subscription (spec §4.7).
pub async fn handle_command(supervisor: &Arc<Supervisor>, command: Command) -> Option<Reply> {
    match command {
        Command::ConnectToHost(config) => {
            if let Err(e) = config.validate() {
                return Some(Reply::Error { name: Some(config.name), error: e.to_string() });
            }
            supervisor.connect(config);
            None
        }
        Command::CloseTunnel { name } => {
            supervisor.disconnect(&name);
            None
        }
        Command::GetTunnelStatus => Some(Reply::TunnelStatus(supervisor.snapshot())),
        Command::Diagnose { name } => match supervisor.diagnose(&name).await {
            Some(result) => Some(Reply::DiagnosticResult(result)),
            None => Some(Reply::Error { name: Some(name), error: "No such tunnel".to_string() }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcaster::StatusBroadcaster;
    use crate::config::InMemoryConfigStore;

    fn supervisor() -> Arc<Supervisor> {
        Supervisor::new(Arc::new(InMemoryConfigStore::new()), Arc::new(StatusBroadcaster::new()))
    }

    #[tokio::test]
    async fn diagnose_on_unknown_tunnel_replies_with_error() {
        let supervisor = supervisor();
        let reply = handle_command(&supervisor, Command::Diagnose { name: "ghost".to_string() }).await;
        match reply {
            Some(Reply::Error { name, .. }) => assert_eq!(name.as_deref(), Some("ghost")),
            other => panic!("expected Error reply, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn get_tunnel_status_replies_with_empty_snapshot_initially() {
        let supervisor = supervisor();
        let reply = handle_command(&supervisor, Command::GetTunnelStatus).await;
        match reply {
            Some(Reply::TunnelStatus(map)) => assert!(map.is_empty()),
            other => panic!("expected TunnelStatus reply, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_tunnel_on_unknown_name_does_not_panic() {
        let supervisor = supervisor();
        let reply = handle_command(&supervisor, Command::CloseTunnel { name: "ghost".to_string() }).await;
        assert!(reply.is_none());
    }
}

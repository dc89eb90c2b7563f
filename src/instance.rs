//! The Tunnel Instance (spec §4.3): owns exactly one live SSH connection and
//! its reverse port forward for a tunnel. Everything here is driven by a
//! single background task per `start()` call; state is communicated to the
//! owning [`crate::supervisor::Supervisor`] actor purely through
//! [`InstanceEvent`]s, never through shared mutable state (spec §5).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::ChannelMsg;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};

use crate::classify::is_remote_closure;
use crate::config::{HostConfig, SshAuth, TunnelConfig};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);
const KEEPALIVE_MAX: usize = 10;

/// Stderr text emitted by OpenSSH servers for a pty-less session that the
/// supervisor should not treat as a stream error (spec §4.3 edge cases).
const BENIGN_STDERR: &str = "pseudo-terminal will not be allocated";

/// A forced remote closure is signalled by the source host's SSH server
/// exiting the keepalive channel with this status (spec §4.3).
const FORCED_CLOSE_EXIT_CODE: u32 = 255;

/// Events emitted by a running [`Instance`] onto the owning actor's channel.
#[derive(Debug, Clone)]
pub enum InstanceEvent {
    /// The reverse forward was registered and the tunnel is serving traffic.
    Ready,
    /// The keepalive/session channel closed on its own (not via `stop()`).
    StreamClosed { exit_code: Option<u32>, remote_closure: bool },
    /// Non-fatal stderr text from the keepalive channel.
    StreamErr(String),
    /// Connect, authenticate, or forward setup failed.
    Error { reason: String, remote_closure: bool },
    /// The instance has fully torn down and will emit nothing further.
    Closed,
}

/// Handle to a running tunnel connection. Dropping it does not stop the
/// connection — call [`Instance::stop`] explicitly (spec §4.3: `stop()` must
/// be idempotent and explicit, not implicit in `Drop`, so the supervisor
/// controls exactly when a teardown is attributed to a manual disconnect).
pub struct Instance {
    cancel: CancellationToken,
}

impl Instance {
    /// Start connecting in the background. Returns immediately; progress is
    /// reported via `events` (spec §4.3: `start()` must not block the actor).
    #[instrument(skip(config, events), fields(tunnel = %config.name))]
    pub fn start(config: TunnelConfig, events: mpsc::UnboundedSender<InstanceEvent>) -> Self {
        let cancel = CancellationToken::new();
        tokio::spawn(run(config, events, cancel.clone()));
        Self { cancel }
    }

    /// Idempotent: calling this more than once, or after the instance has
    /// already closed on its own, is a no-op.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

/// Bridges connections the endpoint's SSH server hands back over the forward.
/// Holds `source`, not `endpoint`: the control connection this handler is
/// attached to is the one made *to the endpoint*, so the loopback it must
/// reach for each forwarded connection is the source's (spec §1, §4.3).
struct ForwardHandler {
    source: HostConfig,
}

#[async_trait]
impl russh::client::Handler for ForwardHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: russh::Channel<russh::client::Msg>,
        _connected_address: &str,
        _connected_port: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut russh::client::Session,
    ) -> Result<(), Self::Error> {
        let target = format!("{}:{}", self.source.host, self.source.port);
        tokio::spawn(async move {
            match tokio::net::TcpStream::connect(&target).await {
                Ok(mut stream) => {
                    let mut channel_stream = channel.into_stream();
                    let _ = tokio::io::copy_bidirectional(&mut channel_stream, &mut stream).await;
                }
                Err(e) => {
                    warn!(target = %target, error = %e, "forwarded connection could not reach source");
                    let _ = channel.close().await;
                }
            }
        });
        Ok(())
    }
}

async fn run(config: TunnelConfig, events: mpsc::UnboundedSender<InstanceEvent>, cancel: CancellationToken) {
    let connect_future = connect_and_forward(&config);

    let (mut handle, mut channel) = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            let _ = events.send(InstanceEvent::Closed);
            return;
        }
        result = tokio::time::timeout(CONNECT_TIMEOUT, connect_future) => {
            match result {
                Ok(Ok(pair)) => pair,
                Ok(Err(reason)) => {
                    let remote_closure = is_remote_closure(&reason);
                    let _ = events.send(InstanceEvent::Error { reason, remote_closure });
                    let _ = events.send(InstanceEvent::Closed);
                    return;
                }
                Err(_) => {
                    let _ = events.send(InstanceEvent::Error {
                        reason: "Connection timeout".to_string(),
                        remote_closure: false,
                    });
                    let _ = events.send(InstanceEvent::Closed);
                    return;
                }
            }
        }
    };

    let _ = events.send(InstanceEvent::Ready);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = channel.close().await;
                drop(handle);
                let _ = events.send(InstanceEvent::Closed);
                return;
            }
            msg = channel.wait() => {
                match msg {
                    Some(ChannelMsg::ExtendedData { ref data, .. }) => {
                        let text = String::from_utf8_lossy(data).trim().to_string();
                        if !text.to_lowercase().contains(BENIGN_STDERR) && !text.is_empty() {
                            let _ = events.send(InstanceEvent::StreamErr(text));
                        }
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        let remote_closure = exit_status == FORCED_CLOSE_EXIT_CODE;
                        let _ = events.send(InstanceEvent::StreamClosed {
                            exit_code: Some(exit_status),
                            remote_closure,
                        });
                        let _ = events.send(InstanceEvent::Closed);
                        return;
                    }
                    Some(ChannelMsg::Eof) | None => {
                        let _ = events.send(InstanceEvent::StreamClosed { exit_code: None, remote_closure: true });
                        let _ = events.send(InstanceEvent::Closed);
                        return;
                    }
                    _ => {}
                }
            }
        }
    }
}

/// Opens the control connection that actually holds the reverse forward.
/// Per spec §1/§4.3 the bind (`boundPort`) lives on the *endpoint* host, so
/// this connection — the one `tcpip_forward` is called against — is made to
/// `config.endpoint`, not `config.source`. A `tcpip-forward` global request
/// asks the connection's remote peer to bind the port and hand back
/// `forwarded-tcpip` channels for each inbound connection; dialing the
/// source here would bind `boundPort` on the wrong host entirely.
async fn connect_and_forward(
    config: &TunnelConfig,
) -> Result<(russh::client::Handle<ForwardHandler>, russh::Channel<russh::client::Msg>), String> {
    let ssh_config = Arc::new(russh::client::Config {
        keepalive_interval: Some(KEEPALIVE_INTERVAL),
        keepalive_max: KEEPALIVE_MAX,
        ..Default::default()
    });
    let handler = ForwardHandler { source: config.source.clone() };

    let mut handle = russh::client::connect(
        ssh_config,
        (config.endpoint.host.as_str(), config.endpoint.ssh_port),
        handler,
    )
    .await
    .map_err(|e| format!("SSH error: {e}"))?;

    let authenticated = match &config.endpoint.auth {
        SshAuth::Password(password) => handle
            .authenticate_password(&config.endpoint.user, password)
            .await
            .map_err(|e| format!("SSH error: {e}"))?,
        SshAuth::PrivateKey { path, passphrase } => {
            let key = russh_keys::load_secret_key(path, passphrase.as_deref())
                .map_err(|e| format!("SSH error: failed to load key: {e}"))?;
            handle
                .authenticate_publickey(&config.endpoint.user, Arc::new(key))
                .await
                .map_err(|e| format!("SSH error: {e}"))?
        }
    };
    if !authenticated {
        return Err("Authentication failed".to_string());
    }

    handle
        .tcpip_forward("0.0.0.0", config.endpoint.port as u32)
        .await
        .map_err(|e| format!("Port forwarding failed: {e}"))?;

    let channel = handle.channel_open_session().await.map_err(|e| format!("SSH error: {e}"))?;

    Ok((handle, channel))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forced_close_exit_code_is_remote_closure() {
        assert_eq!(FORCED_CLOSE_EXIT_CODE, 255);
    }

    #[test]
    fn benign_stderr_is_recognized_case_insensitively() {
        let text = "Pseudo-terminal will not be allocated because stdin is not a terminal.";
        assert!(text.to_lowercase().contains(BENIGN_STDERR));
    }
}

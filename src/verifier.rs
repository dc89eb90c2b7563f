//! The Verifier (spec §4.2): a pure, stateless probe that answers "is the
//! endpoint actually reachable through this tunnel's source host right now".
//!
//! `probe` opens its own short-lived SSH connection to the source host and
//! execs a reachability check against the endpoint — it never touches the
//! long-lived [`crate::instance::Instance`] connection, so a slow or wedged
//! probe can never stall the tunnel itself (spec §5).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::ChannelMsg;
use tracing::instrument;

use crate::classify::is_remote_closure;
use crate::config::{HostConfig, SshAuth, TunnelConfig};

/// Connection phase of a probe attempt, used only to pick the right
/// timeout/error message (spec §4.2: connect timeout vs. overall timeout).
const CONNECT_TIMEOUT: Duration = Duration::from_secs(8);
const OVERALL_TIMEOUT: Duration = Duration::from_secs(15);

/// Outcome of one verification attempt.
#[derive(Debug, Clone)]
pub struct VerifierOutcome {
    pub ok: bool,
    pub reason: Option<String>,
    /// Whether the failure looked like the source host's SSH server
    /// terminating the session rather than the endpoint being unreachable
    /// (spec §4.1, §4.4's remote-closure override).
    pub remote_closure: bool,
}

impl VerifierOutcome {
    fn ok() -> Self {
        Self { ok: true, reason: None, remote_closure: false }
    }

    fn failed(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        let remote_closure = is_remote_closure(&reason);
        Self { ok: false, reason: Some(reason), remote_closure }
    }
}

struct AcceptAllHostKeys;

#[async_trait]
impl russh::client::Handler for AcceptAllHostKeys {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Probe whether `config.endpoint` is reachable from `config.source`.
///
/// Connects to the source host, execs a `nc`-based reachability check
/// against the endpoint, and parses the single `PORT_ACTIVE`/`PORT_INACTIVE`
/// token it prints. Total and side-effect-free beyond the transient SSH
/// session it opens and tears down (spec §4.2).
#[instrument(skip(config), fields(tunnel = %config.name))]
pub async fn probe(config: &TunnelConfig) -> VerifierOutcome {
    match tokio::time::timeout(OVERALL_TIMEOUT, run_probe(&config.source, &config.endpoint)).await {
        Ok(outcome) => outcome,
        Err(_) => VerifierOutcome::failed("Verification timeout"),
    }
}

async fn run_probe(source: &HostConfig, endpoint: &HostConfig) -> VerifierOutcome {
    let ssh_config = Arc::new(russh::client::Config::default());
    let handler = AcceptAllHostKeys;

    let connect_future = russh::client::connect(ssh_config, (source.host.as_str(), source.ssh_port), handler);
    let mut handle = match tokio::time::timeout(CONNECT_TIMEOUT, connect_future).await {
        Ok(Ok(handle)) => handle,
        Ok(Err(e)) => return VerifierOutcome::failed(format!("Connection error during verification: {e}")),
        Err(_) => return VerifierOutcome::failed("Connection timeout during verification"),
    };

    let authenticated = match authenticate(&mut handle, source).await {
        Ok(authenticated) => authenticated,
        Err(reason) => return VerifierOutcome::failed(reason),
    };
    if !authenticated {
        return VerifierOutcome::failed("Authentication failed");
    }

    let mut channel = match handle.channel_open_session().await {
        Ok(channel) => channel,
        Err(e) => return VerifierOutcome::failed(format!("SSH error during verification: {e}")),
    };

    let command = format!(
        "nc -z -w3 {} {} >/dev/null 2>&1 && echo PORT_ACTIVE || echo PORT_INACTIVE",
        endpoint.host, endpoint.port
    );
    if let Err(e) = channel.exec(true, command.as_str()).await {
        return VerifierOutcome::failed(format!("SSH error during verification: {e}"));
    }

    let mut stdout = String::new();
    loop {
        match channel.wait().await {
            Some(ChannelMsg::Data { ref data }) => {
                stdout.push_str(&String::from_utf8_lossy(data));
            }
            Some(ChannelMsg::ExtendedData { .. }) | Some(ChannelMsg::Eof) => {}
            Some(ChannelMsg::ExitStatus { .. }) | None => break,
            _ => {}
        }
    }

    let stdout = stdout.trim();
    if stdout.is_empty() {
        return VerifierOutcome::failed("No data received from port check");
    }
    if stdout.contains("PORT_ACTIVE") {
        return VerifierOutcome::ok();
    }
    VerifierOutcome::failed("Port is not accessible on remote host")
}

async fn authenticate(
    handle: &mut russh::client::Handle<AcceptAllHostKeys>,
    source: &HostConfig,
) -> Result<bool, String> {
    match &source.auth {
        SshAuth::Password(password) => handle
            .authenticate_password(&source.user, password)
            .await
            .map_err(|e| format!("SSH error during verification: {e}")),
        SshAuth::PrivateKey { path, passphrase } => {
            let key = russh_keys::load_secret_key(path, passphrase.as_deref())
                .map_err(|e| format!("SSH error during verification: failed to load key: {e}"))?;
            handle
                .authenticate_publickey(&source.user, Arc::new(key))
                .await
                .map_err(|e| format!("SSH error during verification: {e}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_outcome_carries_no_reason() {
        let outcome = VerifierOutcome::ok();
        assert!(outcome.ok);
        assert!(outcome.reason.is_none());
        assert!(!outcome.remote_closure);
    }

    #[test]
    fn failed_outcome_flags_remote_closure_from_reason() {
        let outcome = VerifierOutcome::failed("Connection closed by remote host");
        assert!(!outcome.ok);
        assert!(outcome.remote_closure);
    }

    #[test]
    fn failed_outcome_does_not_flag_unrelated_reason() {
        let outcome = VerifierOutcome::failed("Port is not accessible on remote host");
        assert!(!outcome.ok);
        assert!(!outcome.remote_closure);
    }
}

//! The Supervisor (spec §4.4): one serialized actor per tunnel `name`,
//! coordinating connect / verify / retry / disconnect. This is the core of
//! the crate — every other component exists to feed events into, or be
//! driven by, the per-name state machine implemented here.
//!
//! Grounded on the cancellable-reconnect-loop pattern (a `CancellationToken`
//! racing a sleep inside `tokio::select!`) and on giving each entity its own
//! owned event queue so no two events for the same name are ever handled
//! concurrently (spec §5, §9).

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::broadcaster::StatusBroadcaster;
use crate::classify;
use crate::config::{RetryPolicy, TunnelConfig, TunnelConfigStore};
use crate::instance::{Instance, InstanceEvent};
use crate::liveness::LivenessTargets;
use crate::state::{DiagnosticResult, Phase, TunnelState};
use crate::verifier;

/// Number of consecutive failed re-verifications tolerated in `Unstable`
/// before the tunnel is handed to the retry policy (spec §9 open question:
/// the source's `maxVerificationAttempts=3`, retained as-is).
const MAX_VERIFICATION_ATTEMPTS: u32 = 3;

/// Re-verify delay while `Unstable` (spec §5 fixed timeouts).
const UNSTABLE_CONFIRM_INTERVAL: Duration = Duration::from_secs(3);

/// How long `manualDisconnect` stays set after a user `Disconnect` (spec §3, §4.7).
const MANUAL_DISCONNECT_GRACE: Duration = Duration::from_secs(5);

/// Events processed by one tunnel's actor, in receipt order (spec §4.4).
#[derive(Debug)]
pub enum TunnelEvent {
    Connect(TunnelConfig),
    Disconnect,
    Instance(InstanceEvent),
    VerifierResult(verifier::VerifierOutcome),
    RetryTimerFired,
    LivenessPoke,
    RefreshTimerFired,
    ManualDisconnectGraceElapsed,
    Diagnose(oneshot::Sender<DiagnosticResult>),
}

/// Outcome of applying the bounded retry policy to one failure (spec §4.4).
#[derive(Debug, PartialEq)]
enum RetryDecision {
    ArmTimer { retry_count: u32, max_retries: u32, interval: Duration },
    Exhausted,
}

/// Increment `retry_count` and decide whether the sequence is exhausted.
/// Pure and side-effect-free beyond the counters on `state` (spec §4.4's
/// retry policy steps 1-2).
fn decide_retry(state: &mut TunnelState, policy: &RetryPolicy) -> RetryDecision {
    state.retry_count += 1;
    if state.retry_count > policy.max_retries {
        state.retries_exhausted = true;
        RetryDecision::Exhausted
    } else {
        RetryDecision::ArmTimer {
            retry_count: state.retry_count,
            max_retries: policy.max_retries,
            interval: policy.retry_interval(),
        }
    }
}

/// Apply the remote-closure override (spec §4.4): clear the sticky
/// exhaustion flag and reset `retry_count` the first time a remote closure
/// is seen within a sequence; subsequent ones in the same sequence just
/// increment the tally.
fn apply_remote_closure_override(state: &mut TunnelState) {
    state.retries_exhausted = false;
    if state.remote_closure_count == 0 {
        state.retry_count = 0;
    }
    state.remote_closure_count += 1;
}

/// One tunnel's actor state. Owned exclusively by the task running
/// [`Actor::run`] — never touched from any other task (spec §5, §9).
struct Actor {
    name: String,
    state: TunnelState,
    config: Option<TunnelConfig>,
    instance: Option<Instance>,
    verifier_cancel: Option<CancellationToken>,
    retry_timer: Option<CancellationToken>,
    refresh_timer: Option<CancellationToken>,
    /// True while the in-flight `Verifying` phase was entered from
    /// `Connected` (periodic refresh or liveness poke) rather than from a
    /// fresh connect — distinguishes "first verification" from
    /// "re-verification", which fail differently (spec §9 open question).
    reverify: bool,
    tx: mpsc::UnboundedSender<TunnelEvent>,
    broadcaster: Arc<StatusBroadcaster>,
}

impl Actor {
    fn new(name: String, tx: mpsc::UnboundedSender<TunnelEvent>, broadcaster: Arc<StatusBroadcaster>) -> Self {
        Self {
            name,
            state: TunnelState::fresh(),
            config: None,
            instance: None,
            verifier_cancel: None,
            retry_timer: None,
            refresh_timer: None,
            reverify: false,
            tx,
            broadcaster,
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<TunnelEvent>) {
        while let Some(event) = rx.recv().await {
            self.handle(event);
        }
    }

    #[instrument(skip(self, event), fields(tunnel = %self.name))]
    fn handle(&mut self, event: TunnelEvent) {
        match event {
            TunnelEvent::Connect(config) => self.on_connect(config),
            TunnelEvent::Disconnect => self.on_disconnect(),
            TunnelEvent::ManualDisconnectGraceElapsed => {
                self.state.manual_disconnect = false;
            }
            TunnelEvent::Instance(ev) => self.on_instance_event(ev),
            TunnelEvent::VerifierResult(outcome) => self.on_verifier_result(outcome),
            TunnelEvent::RetryTimerFired => self.on_retry_timer_fired(),
            TunnelEvent::LivenessPoke | TunnelEvent::RefreshTimerFired => self.maybe_trigger_reverify(),
            TunnelEvent::Diagnose(reply) => {
                let _ = reply.send(DiagnosticResult {
                    name: self.name.clone(),
                    phase: self.state.phase.as_wire_str().to_string(),
                    retry_count: self.state.retry_count,
                    has_inflight_verifier: self.verifier_cancel.is_some(),
                    manual_disconnect: self.state.manual_disconnect,
                });
            }
        }
    }

    fn on_connect(&mut self, config: TunnelConfig) {
        if let Err(e) = config.validate() {
            self.state.phase = Phase::Failed { reason: e.to_string(), retry_exhausted: false };
            self.publish();
            return;
        }

        self.cancel_verifier();
        self.cancel_retry_timer();
        self.cancel_refresh_timer();
        self.stop_instance();

        self.state.manual_disconnect = false;
        self.state.reset_retry_sequence();
        self.state.phase = Phase::Connecting;
        self.config = Some(config.clone());
        self.publish();
        self.spawn_instance(config);
    }

    fn on_disconnect(&mut self) {
        if self.state.manual_disconnect && matches!(self.state.phase, Phase::Disconnected) {
            // Already disconnected and still within the grace window: a
            // second rapid Disconnect is a no-op (spec §8 idempotence).
            return;
        }

        self.cancel_verifier();
        self.cancel_retry_timer();
        self.cancel_refresh_timer();
        self.stop_instance();

        self.state.manual_disconnect = true;
        self.state.phase = Phase::Disconnected;
        self.state.last_reason = None;
        self.publish();
        self.arm_manual_disconnect_grace();
    }

    fn on_instance_event(&mut self, event: InstanceEvent) {
        if matches!(self.state.phase, Phase::Disconnected | Phase::Failed { .. }) {
            return; // stale event from a torn-down or superseded instance
        }

        match event {
            InstanceEvent::Ready => {
                if matches!(self.state.phase, Phase::Connecting) {
                    self.state.phase = Phase::Verifying;
                    self.reverify = false;
                    self.publish();
                    self.spawn_verifier();
                }
            }
            InstanceEvent::StreamErr(text) => {
                self.state.last_reason = Some(text.clone());
                let kind = classify::classify(&text);
                if kind != classify::ErrorKind::Unknown {
                    let remote_closure = classify::is_remote_closure(&text);
                    self.handle_failure(text, remote_closure, kind.is_retryable());
                }
            }
            InstanceEvent::StreamClosed { exit_code, remote_closure } => {
                let forced = remote_closure || exit_code == Some(255);
                let reason = match exit_code {
                    Some(code) if !forced => format!("Stream closed (exit code {code})"),
                    _ => "Connection closed by remote host".to_string(),
                };
                self.handle_failure(reason, forced, true);
            }
            InstanceEvent::Error { reason, remote_closure } => {
                let kind = classify::classify(&reason);
                self.handle_failure(reason, remote_closure, kind.is_retryable());
            }
            InstanceEvent::Closed => {
                self.instance = None;
            }
        }
    }

    fn on_verifier_result(&mut self, outcome: verifier::VerifierOutcome) {
        self.verifier_cancel = None;

        match self.state.phase {
            Phase::Verifying => {
                if outcome.ok {
                    if self.retry_timer.is_some() {
                        return; // invariant 3: a later retry already superseded this
                    }
                    self.state.phase = Phase::Connected;
                    self.state.last_reason = None;
                    self.publish();
                    self.arm_refresh_timer();
                } else if outcome.remote_closure {
                    self.handle_failure(outcome.reason.unwrap_or_default(), true, true);
                } else {
                    let kind = classify::classify(outcome.reason.as_deref().unwrap_or(""));
                    if self.reverify && kind.is_retryable() {
                        self.state.last_reason = outcome.reason;
                        self.state.phase = Phase::Unstable { failed_verifications: 1 };
                        self.publish();
                        self.arm_confirm_timer();
                    } else {
                        self.handle_failure(outcome.reason.unwrap_or_default(), false, kind.is_retryable());
                    }
                }
            }
            Phase::Unstable { failed_verifications } => {
                if outcome.ok {
                    self.state.phase = Phase::Connected;
                    self.state.last_reason = None;
                    self.publish();
                    self.arm_refresh_timer();
                } else if outcome.remote_closure {
                    self.handle_failure(outcome.reason.unwrap_or_default(), true, true);
                } else if failed_verifications + 1 >= MAX_VERIFICATION_ATTEMPTS {
                    self.handle_failure(outcome.reason.unwrap_or_default(), false, true);
                } else {
                    self.state.last_reason = outcome.reason;
                    self.state.phase = Phase::Unstable { failed_verifications: failed_verifications + 1 };
                    self.publish();
                    self.arm_confirm_timer();
                }
            }
            _ => {
                // Superseded by a newer Connect/Disconnect/retry; discard
                // (spec §4.4's verifier race rule, §8's boundary case).
            }
        }
    }

    fn on_retry_timer_fired(&mut self) {
        self.retry_timer = None;
        if self.state.manual_disconnect {
            return;
        }
        let Some(config) = self.config.clone() else { return };
        self.stop_instance();
        self.state.phase = Phase::Connecting;
        self.publish();
        self.spawn_instance(config);
    }

    fn maybe_trigger_reverify(&mut self) {
        match self.state.phase {
            Phase::Connected => {
                if self.verifier_cancel.is_some() {
                    return; // double-verify guard
                }
                self.cancel_refresh_timer();
                self.state.phase = Phase::Verifying;
                self.reverify = true;
                self.publish();
                self.spawn_verifier();
            }
            Phase::Unstable { .. } => {
                if self.verifier_cancel.is_none() {
                    self.spawn_verifier();
                }
            }
            _ => {}
        }
    }

    fn handle_failure(&mut self, reason: String, remote_closure: bool, retryable: bool) {
        self.cancel_verifier();
        self.cancel_refresh_timer();
        self.stop_instance();
        self.state.last_reason = Some(reason.clone());

        if remote_closure {
            apply_remote_closure_override(&mut self.state);
        } else if !retryable {
            self.state.phase = Phase::Failed { reason, retry_exhausted: self.state.retries_exhausted };
            self.publish();
            return;
        }

        self.run_retry_policy();
    }

    fn run_retry_policy(&mut self) {
        let Some(config) = self.config.clone() else { return };
        match decide_retry(&mut self.state, &config.retry_policy) {
            RetryDecision::Exhausted => {
                self.state.phase = Phase::Failed {
                    reason: "Max retries exhausted".to_string(),
                    retry_exhausted: true,
                };
                self.publish();
            }
            RetryDecision::ArmTimer { retry_count, max_retries, interval } => {
                self.state.phase = Phase::Retrying { retry_count, max_retries, next_retry_in: interval };
                self.publish();
                self.arm_retry_timer(interval);
            }
        }
    }

    fn publish(&self) {
        let retry_timer_armed = self.retry_timer.is_some();
        self.broadcaster.publish(&self.name, self.state.to_status_record(), retry_timer_armed);
    }

    fn spawn_instance(&mut self, config: TunnelConfig) {
        let (instance_tx, mut instance_rx) = mpsc::unbounded_channel();
        let instance = Instance::start(config, instance_tx);
        let forward_tx = self.tx.clone();
        tokio::spawn(async move {
            while let Some(event) = instance_rx.recv().await {
                if forward_tx.send(TunnelEvent::Instance(event)).is_err() {
                    break;
                }
            }
        });
        self.instance = Some(instance);
    }

    fn stop_instance(&mut self) {
        if let Some(instance) = self.instance.take() {
            instance.stop();
        }
    }

    fn spawn_verifier(&mut self) {
        let Some(config) = self.config.clone() else { return };
        let token = CancellationToken::new();
        let token_clone = token.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token_clone.cancelled() => {}
                outcome = verifier::probe(&config) => {
                    let _ = tx.send(TunnelEvent::VerifierResult(outcome));
                }
            }
        });
        self.verifier_cancel = Some(token);
    }

    fn cancel_verifier(&mut self) {
        if let Some(token) = self.verifier_cancel.take() {
            token.cancel();
        }
    }

    fn arm_retry_timer(&mut self, interval: Duration) {
        let token = CancellationToken::new();
        let token_clone = token.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token_clone.cancelled() => {}
                _ = tokio::time::sleep(interval) => {
                    let _ = tx.send(TunnelEvent::RetryTimerFired);
                }
            }
        });
        self.retry_timer = Some(token);
    }

    fn cancel_retry_timer(&mut self) {
        if let Some(token) = self.retry_timer.take() {
            token.cancel();
        }
    }

    fn arm_refresh_timer(&mut self) {
        let Some(config) = self.config.clone() else { return };
        self.arm_timer_for(config.refresh_interval());
    }

    fn arm_confirm_timer(&mut self) {
        self.arm_timer_for(UNSTABLE_CONFIRM_INTERVAL);
    }

    fn arm_timer_for(&mut self, interval: Duration) {
        let token = CancellationToken::new();
        let token_clone = token.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token_clone.cancelled() => {}
                _ = tokio::time::sleep(interval) => {
                    let _ = tx.send(TunnelEvent::RefreshTimerFired);
                }
            }
        });
        self.refresh_timer = Some(token);
    }

    fn cancel_refresh_timer(&mut self) {
        if let Some(token) = self.refresh_timer.take() {
            token.cancel();
        }
    }

    fn arm_manual_disconnect_grace(&mut self) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(MANUAL_DISCONNECT_GRACE).await;
            let _ = tx.send(TunnelEvent::ManualDisconnectGraceElapsed);
        });
    }
}

/// Owns every tunnel's actor handle and is the sole entry point the rest of
/// the crate (Command Ingress, Liveness Scanner, the server) uses to reach
/// them (spec §4.4, §9's "single `Supervisor` value" note).
pub struct Supervisor {
    handles: RwLock<HashMap<String, mpsc::UnboundedSender<TunnelEvent>>>,
    config_store: Arc<dyn TunnelConfigStore>,
    broadcaster: Arc<StatusBroadcaster>,
}

impl Supervisor {
    pub fn new(config_store: Arc<dyn TunnelConfigStore>, broadcaster: Arc<StatusBroadcaster>) -> Arc<Self> {
        Arc::new(Self { handles: RwLock::new(HashMap::new()), config_store, broadcaster })
    }

    /// Command Ingress's `connectToHost` (spec §4.7).
    pub fn connect(&self, config: TunnelConfig) {
        let name = config.name.clone();
        self.config_store.put(config.clone());
        let tx = self.get_or_spawn(&name);
        let _ = tx.send(TunnelEvent::Connect(config));
    }

    /// Command Ingress's `closeTunnel` (spec §4.7). A name with no running
    /// actor has nothing to disconnect — a no-op, per spec §7.
    pub fn disconnect(&self, name: &str) {
        if let Some(tx) = self.handles.read().expect("supervisor handles lock poisoned").get(name) {
            let _ = tx.send(TunnelEvent::Disconnect);
        }
    }

    /// Command Ingress's `diagnose` (spec §4.7). Returns `None` for a name
    /// with no actor at all (never connected).
    pub async fn diagnose(&self, name: &str) -> Option<DiagnosticResult> {
        let tx = self.handles.read().expect("supervisor handles lock poisoned").get(name)?.clone();
        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(TunnelEvent::Diagnose(reply_tx)).ok()?;
        reply_rx.await.ok()
    }

    /// Full current status map, for `getTunnelStatus` (spec §4.7) and for
    /// seeding a new subscriber.
    pub fn snapshot(&self) -> HashMap<String, crate::state::StatusRecord> {
        self.broadcaster.snapshot()
    }

    pub fn broadcaster(&self) -> Arc<StatusBroadcaster> {
        self.broadcaster.clone()
    }

    /// Posts an event to an existing actor only; never spawns one. Used by
    /// the Liveness Scanner, which must never create state for a name it
    /// didn't already see connected (spec §4.6).
    pub(crate) fn post(&self, name: &str, event: TunnelEvent) {
        if let Some(tx) = self.handles.read().expect("supervisor handles lock poisoned").get(name) {
            let _ = tx.send(event);
        }
    }

    fn get_or_spawn(&self, name: &str) -> mpsc::UnboundedSender<TunnelEvent> {
        if let Some(tx) = self.handles.read().expect("supervisor handles lock poisoned").get(name) {
            return tx.clone();
        }

        let mut handles = self.handles.write().expect("supervisor handles lock poisoned");
        if let Some(tx) = handles.get(name) {
            return tx.clone();
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let actor = Actor::new(name.to_string(), tx.clone(), self.broadcaster.clone());
        tokio::spawn(actor.run(rx));
        handles.insert(name.to_string(), tx.clone());
        tx
    }
}

/// Adapts [`Supervisor`] to what the Liveness Scanner needs, using the
/// broadcaster's last-known status instead of reaching into actor internals
/// (spec §4.6: the scanner only ever posts events, never reads state).
pub struct SupervisorLivenessTargets {
    pub supervisor: Arc<Supervisor>,
}

impl LivenessTargets for SupervisorLivenessTargets {
    fn live_names(&self) -> Vec<String> {
        self.supervisor
            .broadcaster
            .snapshot()
            .into_iter()
            .filter(|(_, record)| record.status == "connected" || record.status == "unstable")
            .map(|(name, _)| name)
            .collect()
    }

    fn post(&self, name: &str, event: TunnelEvent) {
        self.supervisor.post(name, event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy { max_retries, retry_interval_ms: 5000 }
    }

    #[test]
    fn decide_retry_arms_timer_while_under_the_limit() {
        let mut state = TunnelState::fresh();
        let decision = decide_retry(&mut state, &policy(3));
        assert_eq!(
            decision,
            RetryDecision::ArmTimer { retry_count: 1, max_retries: 3, interval: Duration::from_secs(5) }
        );
        assert!(!state.retries_exhausted);
    }

    #[test]
    fn decide_retry_exhausts_after_max_retries() {
        let mut state = TunnelState::fresh();
        state.retry_count = 3;
        let decision = decide_retry(&mut state, &policy(3));
        assert_eq!(decision, RetryDecision::Exhausted);
        assert!(state.retries_exhausted);
    }

    #[test]
    fn zero_max_retries_exhausts_on_first_failure() {
        let mut state = TunnelState::fresh();
        let decision = decide_retry(&mut state, &policy(0));
        assert_eq!(decision, RetryDecision::Exhausted);
    }

    #[test]
    fn remote_closure_override_clears_exhaustion_and_resets_count_once() {
        let mut state = TunnelState::fresh();
        state.retry_count = 5;
        state.retries_exhausted = true;

        apply_remote_closure_override(&mut state);
        assert!(!state.retries_exhausted);
        assert_eq!(state.retry_count, 0);
        assert_eq!(state.remote_closure_count, 1);

        // A second remote closure in the same sequence increments normally
        // instead of resetting again.
        state.retry_count = 2;
        apply_remote_closure_override(&mut state);
        assert_eq!(state.retry_count, 2);
        assert_eq!(state.remote_closure_count, 2);
    }

    #[tokio::test]
    async fn connect_then_disconnect_then_connect_resets_counters() {
        let store: Arc<dyn TunnelConfigStore> = Arc::new(crate::config::InMemoryConfigStore::new());
        let broadcaster = Arc::new(StatusBroadcaster::new());
        let supervisor = Supervisor::new(store, broadcaster);

        let config = crate::config::TunnelConfig {
            name: "t1".to_string(),
            source: crate::config::HostConfig {
                host: "source.example.com".to_string(),
                ssh_port: 22,
                user: "alice".to_string(),
                auth: crate::config::SshAuth::Password("hunter2".to_string()),
                port: 8080,
            },
            endpoint: crate::config::HostConfig {
                host: "endpoint.example.com".to_string(),
                ssh_port: 22,
                user: "bob".to_string(),
                auth: crate::config::SshAuth::Password("hunter2".to_string()),
                port: 9090,
            },
            retry_policy: policy(3),
            refresh_interval_ms: 30_000,
        };

        supervisor.connect(config.clone());
        tokio::task::yield_now().await;
        supervisor.disconnect("t1");
        tokio::task::yield_now().await;

        let diag = supervisor.diagnose("t1").await.expect("actor should exist");
        assert!(diag.manual_disconnect);
        assert_eq!(diag.retry_count, 0);
    }
}

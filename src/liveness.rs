//! Liveness Scanner (spec §4.6): a single periodic task that pokes every
//! connected tunnel and lets the supervisor decide what, if anything, to do
//! about it. The scanner never reads or writes `TunnelState` itself — it
//! only posts events, so it can never race the state machine (spec §4.6,
//! §9's "verifier side-effect isolation" note applied to this component
//! too).

use std::time::Duration;

use tracing::debug;

use crate::supervisor::TunnelEvent;

/// Names currently tracked by the supervisor, with a channel to post events
/// to each one's actor. Implemented as a plain trait so the scanner doesn't
/// need to know about `Supervisor`'s internals.
pub trait LivenessTargets: Send + Sync {
    /// Names whose phase is `Connected` or `Unstable` right now.
    fn live_names(&self) -> Vec<String>;
    fn post(&self, name: &str, event: TunnelEvent);
}

/// Run the scanner loop forever, waking every `interval`. Intended to be
/// spawned once at startup and left running for the process lifetime.
pub async fn run(targets: impl LivenessTargets, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // first tick fires immediately; skip it

    loop {
        ticker.tick().await;
        let names = targets.live_names();
        debug!(count = names.len(), "liveness scan");
        for name in names {
            targets.post(&name, TunnelEvent::LivenessPoke);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct FakeTargets {
        names: Vec<String>,
        posted: Arc<Mutex<Vec<String>>>,
    }

    impl LivenessTargets for FakeTargets {
        fn live_names(&self) -> Vec<String> {
            self.names.clone()
        }

        fn post(&self, name: &str, _event: TunnelEvent) {
            self.posted.lock().unwrap().push(name.to_string());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn pokes_every_live_name_on_each_tick() {
        let posted = Arc::new(Mutex::new(Vec::new()));
        let targets = FakeTargets { names: vec!["t1".to_string(), "t2".to_string()], posted: posted.clone() };

        let handle = tokio::spawn(run(targets, Duration::from_secs(1)));
        tokio::time::advance(Duration::from_secs(1)).await;
        tokio::task::yield_now().await;
        handle.abort();

        let posted = posted.lock().unwrap();
        assert!(posted.contains(&"t1".to_string()));
        assert!(posted.contains(&"t2".to_string()));
    }
}

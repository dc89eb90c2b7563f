//! The per-tunnel state machine's data model (spec §3, §9).
//!
//! `Phase` is a tagged sum type so invariants like "Connected carries no
//! retry payload" are enforced by the type rather than by convention.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Observable phase of one tunnel. Carries per-phase payloads instead of a
/// bare discriminant plus loose fields, per the DESIGN NOTES in spec §9.
#[derive(Debug, Clone, PartialEq)]
pub enum Phase {
    Disconnected,
    Connecting,
    Verifying,
    Connected,
    Unstable { failed_verifications: u32 },
    Retrying {
        retry_count: u32,
        max_retries: u32,
        next_retry_in: Duration,
    },
    Failed { reason: String, retry_exhausted: bool },
}

impl Phase {
    pub fn as_wire_str(&self) -> &'static str {
        match self {
            Phase::Disconnected => "disconnected",
            Phase::Connecting => "connecting",
            Phase::Verifying => "verifying",
            Phase::Connected => "connected",
            Phase::Unstable { .. } => "unstable",
            Phase::Retrying { .. } => "retrying",
            Phase::Failed { .. } => "failed",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Phase::Connected)
    }
}

/// Per-`name` supervisor-owned bookkeeping (spec §3). Mutated only by the
/// actor task that owns `name` (spec §5, §9) — never shared across tasks.
#[derive(Debug, Clone)]
pub struct TunnelState {
    pub phase: Phase,
    pub retry_count: u32,
    pub retries_exhausted: bool,
    pub remote_closure_count: u32,
    pub manual_disconnect: bool,
    pub last_reason: Option<String>,
}

impl TunnelState {
    pub fn fresh() -> Self {
        Self {
            phase: Phase::Disconnected,
            retry_count: 0,
            retries_exhausted: false,
            remote_closure_count: 0,
            manual_disconnect: false,
            last_reason: None,
        }
    }

    /// Reset retry bookkeeping for a fresh sequence: either a user-issued
    /// `connect` or the first remote closure seen within a sequence
    /// (spec §4.4's "remote-closure override").
    pub fn reset_retry_sequence(&mut self) {
        self.retry_count = 0;
        self.retries_exhausted = false;
        self.remote_closure_count = 0;
    }

    /// Wire-level status snapshot for this tunnel (spec §6's `StatusRecord`).
    pub fn to_status_record(&self) -> StatusRecord {
        let (retry_count, max_retries, next_retry_in) = match &self.phase {
            Phase::Retrying { retry_count, max_retries, next_retry_in } => {
                (Some(*retry_count), Some(*max_retries), Some(next_retry_in.as_secs()))
            }
            _ => (None, None, None),
        };

        let reason = match &self.phase {
            Phase::Failed { reason, .. } => Some(reason.clone()),
            _ => self.last_reason.clone(),
        };

        StatusRecord {
            connected: self.phase.is_connected(),
            status: self.phase.as_wire_str().to_string(),
            retry_count,
            max_retries,
            next_retry_in,
            reason,
            manual_disconnect: self.manual_disconnect,
            retry_exhausted: self.retries_exhausted,
        }
    }
}

/// Status payload broadcast to subscribers (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusRecord {
    pub connected: bool,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_retry_in: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub manual_disconnect: bool,
    pub retry_exhausted: bool,
}

/// Response to a `diagnose` command (spec §4.7, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticResult {
    pub name: String,
    pub phase: String,
    pub retry_count: u32,
    pub has_inflight_verifier: bool,
    pub manual_disconnect: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_state_is_disconnected_with_clean_counters() {
        let state = TunnelState::fresh();
        assert_eq!(state.phase, Phase::Disconnected);
        assert_eq!(state.retry_count, 0);
        assert!(!state.retries_exhausted);
        assert!(!state.manual_disconnect);
    }

    #[test]
    fn connected_status_record_carries_no_retry_fields() {
        let mut state = TunnelState::fresh();
        state.phase = Phase::Connected;
        let record = state.to_status_record();
        assert!(record.connected);
        assert_eq!(record.status, "connected");
        assert!(record.retry_count.is_none());
        assert!(record.next_retry_in.is_none());
    }

    #[test]
    fn retrying_status_record_carries_retry_fields() {
        let mut state = TunnelState::fresh();
        state.phase = Phase::Retrying {
            retry_count: 2,
            max_retries: 3,
            next_retry_in: Duration::from_secs(5),
        };
        let record = state.to_status_record();
        assert!(!record.connected);
        assert_eq!(record.status, "retrying");
        assert_eq!(record.retry_count, Some(2));
        assert_eq!(record.max_retries, Some(3));
        assert_eq!(record.next_retry_in, Some(5));
    }

    #[test]
    fn failed_status_record_normalizes_reason_from_phase() {
        let mut state = TunnelState::fresh();
        state.phase = Phase::Failed {
            reason: "Max retries exhausted".to_string(),
            retry_exhausted: true,
        };
        let record = state.to_status_record();
        assert_eq!(record.status, "failed");
        assert_eq!(record.reason.as_deref(), Some("Max retries exhausted"));
        assert!(record.retry_exhausted);
    }

    #[test]
    fn reset_retry_sequence_clears_all_three_counters() {
        let mut state = TunnelState::fresh();
        state.retry_count = 2;
        state.retries_exhausted = true;
        state.remote_closure_count = 1;

        state.reset_retry_sequence();

        assert_eq!(state.retry_count, 0);
        assert!(!state.retries_exhausted);
        assert_eq!(state.remote_closure_count, 0);
    }
}

//! Status Broadcaster (spec §4.5): the single cross-handler piece of shared
//! state in the whole crate. Holds the authoritative last-status map and
//! fans out every update to current subscribers.
//!
//! Grounded on the broadcast-sender-plus-locked-map pattern used for
//! multi-subscriber fan-out with an authoritative last-known-state map.

use std::collections::HashMap;
use std::sync::RwLock;

use tokio::sync::broadcast;

use crate::state::StatusRecord;

const CHANNEL_CAPACITY: usize = 256;

/// One status update, as published to subscribers.
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub name: String,
    pub record: StatusRecord,
}

/// Publishes per-tunnel status transitions and retains the last-known
/// status for every tunnel the supervisor has ever touched.
pub struct StatusBroadcaster {
    last: RwLock<HashMap<String, StatusRecord>>,
    sender: broadcast::Sender<StatusUpdate>,
}

impl StatusBroadcaster {
    pub fn new() -> Self {
        let (sender, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self { last: RwLock::new(HashMap::new()), sender }
    }

    /// Subscribe to future updates. Callers should immediately follow this
    /// with [`StatusBroadcaster::snapshot`] to get the current map — there
    /// is an inherent gap between snapshot and subscribe that callers in
    /// this crate close by subscribing first (spec §4.5, §6).
    pub fn subscribe(&self) -> broadcast::Receiver<StatusUpdate> {
        self.sender.subscribe()
    }

    /// Full last-status map, sent once to a new subscriber (spec §4.5, §6).
    pub fn snapshot(&self) -> HashMap<String, StatusRecord> {
        self.last.read().expect("status map lock poisoned").clone()
    }

    /// Publish a status update for `name`. Applies the two guards from
    /// spec §4.5 before the record is recorded or fanned out:
    ///
    /// - a `Connected` publish is dropped if a retry timer is armed for
    ///   `name` (invariant 3 never holds the opposite at the same instant).
    /// - a `Failed` publish with `retry_exhausted` normalizes its reason to
    ///   `"Max retries exhausted"`.
    pub fn publish(&self, name: &str, mut record: StatusRecord, retry_timer_armed: bool) {
        if record.connected && retry_timer_armed {
            return;
        }
        if record.status == "failed" && record.retry_exhausted {
            record.reason = Some("Max retries exhausted".to_string());
        }

        {
            let mut last = self.last.write().expect("status map lock poisoned");
            last.insert(name.to_string(), record.clone());
        }

        // Fan out after releasing the write guard: subscribers may be slow,
        // and a blocked send must never hold up other tunnels' publishes.
        let _ = self.sender.send(StatusUpdate { name: name.to_string(), record });
    }
}

impl Default for StatusBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected_record() -> StatusRecord {
        StatusRecord {
            connected: true,
            status: "connected".to_string(),
            retry_count: None,
            max_retries: None,
            next_retry_in: None,
            reason: None,
            manual_disconnect: false,
            retry_exhausted: false,
        }
    }

    #[test]
    fn publish_updates_snapshot() {
        let broadcaster = StatusBroadcaster::new();
        broadcaster.publish("t1", connected_record(), false);

        let snap = broadcaster.snapshot();
        assert_eq!(snap.get("t1").unwrap().status, "connected");
    }

    #[test]
    fn connected_publish_dropped_when_retry_timer_armed() {
        let broadcaster = StatusBroadcaster::new();
        broadcaster.publish("t1", connected_record(), true);

        assert!(broadcaster.snapshot().get("t1").is_none());
    }

    #[test]
    fn failed_reason_normalized_when_retries_exhausted() {
        let broadcaster = StatusBroadcaster::new();
        let mut record = connected_record();
        record.connected = false;
        record.status = "failed".to_string();
        record.retry_exhausted = true;
        record.reason = Some("connection refused".to_string());

        broadcaster.publish("t1", record, false);

        let snap = broadcaster.snapshot();
        assert_eq!(snap.get("t1").unwrap().reason.as_deref(), Some("Max retries exhausted"));
    }

    #[test]
    fn subscribers_receive_fanned_out_updates() {
        let broadcaster = StatusBroadcaster::new();
        let mut rx = broadcaster.subscribe();

        broadcaster.publish("t1", connected_record(), false);

        let update = rx.try_recv().expect("update should be available");
        assert_eq!(update.name, "t1");
    }
}

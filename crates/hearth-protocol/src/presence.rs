//! Peer presence derived from transport events.
//!
//! A peer may hold several connections at once (two devices, or a reconnect
//! racing its own disconnect), so the tracker counts them: the peer is online
//! while its count is positive. Counts saturate at zero, which makes the
//! result independent of the order in which connect and disconnect events
//! arrive.

use std::collections::HashMap;

use serde::Serialize;

use crate::message::timestamp_now_ms;
use crate::transport::{ConnectionState, TransportEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
    /// The local transport is down, so the peer's state can't be observed.
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub user_id: String,
    /// True only while the peer is known to be online.
    pub is_online: bool,
    /// Last time the peer was observed online, unix millis.
    pub last_seen: Option<u64>,
    pub status: PresenceStatus,
}

impl PresenceRecord {
    fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            is_online: false,
            last_seen: None,
            status: PresenceStatus::Offline,
        }
    }
}

/// A change worth telling the application about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceChange {
    Online(String),
    Offline(String),
    /// Local transport went down; these peers are now `Unknown`.
    Unobservable(Vec<String>),
}

#[derive(Debug, Default)]
pub struct PresenceTracker {
    records: HashMap<String, PresenceRecord>,
    connections: HashMap<String, u32>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one transport event into the presence table.
    pub fn apply(&mut self, event: &TransportEvent) -> Option<PresenceChange> {
        let now = timestamp_now_ms();
        match event {
            TransportEvent::PeerConnected(user_id) => self.peer_connected(user_id, now),
            TransportEvent::PeerDisconnected(user_id) => self.peer_disconnected(user_id),
            TransportEvent::StateChanged(ConnectionState::Connected) => None,
            TransportEvent::StateChanged(_) => self.local_disconnected(now),
            _ => None,
        }
    }

    pub fn peer_connected(&mut self, user_id: &str, now: u64) -> Option<PresenceChange> {
        let count = self.connections.entry(user_id.to_string()).or_insert(0);
        *count = count.saturating_add(1);

        let record = self
            .records
            .entry(user_id.to_string())
            .or_insert_with(|| PresenceRecord::new(user_id));
        let was_online = record.is_online;
        record.is_online = true;
        record.last_seen = Some(now);
        record.status = PresenceStatus::Online;

        tracing::debug!(peer = user_id, connections = *count, "peer connected");
        (!was_online).then(|| PresenceChange::Online(user_id.to_string()))
    }

    /// `last_seen` keeps its last-known value.
    pub fn peer_disconnected(&mut self, user_id: &str) -> Option<PresenceChange> {
        let count = self.connections.entry(user_id.to_string()).or_insert(0);
        *count = count.saturating_sub(1);
        let remaining = *count;

        let record = self
            .records
            .entry(user_id.to_string())
            .or_insert_with(|| PresenceRecord::new(user_id));
        tracing::debug!(peer = user_id, connections = remaining, "peer disconnected");
        if remaining > 0 {
            return None;
        }

        let was_online = record.is_online;
        record.is_online = false;
        record.status = PresenceStatus::Offline;
        was_online.then(|| PresenceChange::Offline(user_id.to_string()))
    }

    /// Every online peer becomes `Unknown`. Counts are cleared since the
    /// server re-announces peers after the next connect.
    pub fn local_disconnected(&mut self, now: u64) -> Option<PresenceChange> {
        self.connections.clear();
        let mut degraded = Vec::new();
        for record in self.records.values_mut() {
            if record.is_online {
                record.is_online = false;
                record.last_seen = Some(now);
                record.status = PresenceStatus::Unknown;
                degraded.push(record.user_id.clone());
            }
        }
        if degraded.is_empty() {
            return None;
        }
        degraded.sort();
        tracing::debug!(peers = degraded.len(), "presence unknown while offline");
        Some(PresenceChange::Unobservable(degraded))
    }

    pub fn get(&self, user_id: &str) -> Option<&PresenceRecord> {
        self.records.get(user_id)
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.records.get(user_id).is_some_and(|r| r.is_online)
    }

    /// All records, sorted by user id.
    pub fn snapshot(&self) -> Vec<PresenceRecord> {
        let mut records: Vec<_> = self.records.values().cloned().collect();
        records.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_then_disconnect() {
        let mut tracker = PresenceTracker::new();
        assert_eq!(
            tracker.peer_connected("bob", 10),
            Some(PresenceChange::Online("bob".into()))
        );
        assert_eq!(
            tracker.peer_disconnected("bob"),
            Some(PresenceChange::Offline("bob".into()))
        );

        let record = tracker.get("bob").unwrap();
        assert!(!record.is_online);
        assert_eq!(record.status, PresenceStatus::Offline);
        assert_eq!(record.last_seen, Some(10));
    }

    #[test]
    fn one_more_connect_than_disconnect_is_online() {
        let orders: [&[bool]; 4] = [
            &[true, true, false],
            &[false, true, true],
            &[true, false, true],
            &[false, false, true, true, true],
        ];
        for order in orders {
            let mut tracker = PresenceTracker::new();
            for (i, connect) in order.iter().enumerate() {
                let now = u64::try_from(i).unwrap();
                if *connect {
                    tracker.peer_connected("bob", now);
                } else {
                    tracker.peer_disconnected("bob");
                }
            }
            assert!(tracker.is_online("bob"), "order {order:?}");
        }
    }

    #[test]
    fn second_connection_keeps_peer_online() {
        let mut tracker = PresenceTracker::new();
        tracker.peer_connected("bob", 1);
        assert_eq!(tracker.peer_connected("bob", 2), None);
        assert_eq!(tracker.peer_disconnected("bob"), None);
        assert!(tracker.is_online("bob"));
        assert_eq!(tracker.get("bob").unwrap().last_seen, Some(2));
    }

    #[test]
    fn local_disconnect_makes_online_peers_unknown() {
        let mut tracker = PresenceTracker::new();
        tracker.peer_connected("bob", 1);
        tracker.peer_connected("carol", 1);
        tracker.peer_disconnected("carol");

        let change = tracker.apply(&TransportEvent::StateChanged(ConnectionState::Disconnected));
        assert_eq!(change, Some(PresenceChange::Unobservable(vec!["bob".into()])));
        assert_eq!(tracker.get("bob").unwrap().status, PresenceStatus::Unknown);
        assert_eq!(tracker.get("carol").unwrap().status, PresenceStatus::Offline);

        // server re-announces bob after reconnect
        tracker.apply(&TransportEvent::StateChanged(ConnectionState::Connected));
        tracker.apply(&TransportEvent::PeerConnected("bob".into()));
        tracker.apply(&TransportEvent::PeerDisconnected("bob".into()));
        assert!(!tracker.is_online("bob"));
    }

    #[test]
    fn disconnect_of_unknown_peer_is_recorded_offline() {
        let mut tracker = PresenceTracker::new();
        assert_eq!(tracker.peer_disconnected("dave"), None);
        let record = tracker.get("dave").unwrap();
        assert_eq!(record.status, PresenceStatus::Offline);
        assert_eq!(record.last_seen, None);
    }

    #[test]
    fn record_serialises_camel_case() {
        let mut tracker = PresenceTracker::new();
        tracker.peer_connected("bob", 7);
        let json = serde_json::to_value(tracker.get("bob").unwrap()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"userId": "bob", "isOnline": true, "lastSeen": 7, "status": "online"})
        );
    }
}

//! Connection quality metrics, built by observing transport state changes.

use std::collections::VecDeque;
use std::time::Duration;

use serde::Serialize;

use crate::message::timestamp_now_ms;
use crate::transport::{ConnectionState, TransportEvent};

const HISTORY_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionEventKind {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRecord {
    /// Unix millis.
    pub timestamp: u64,
    pub event: ConnectionEventKind,
    /// Length of the interval this event ended: the outage for `Connected`,
    /// the connection for `Disconnected`. `None` for the first connect.
    pub duration_ms: Option<u64>,
}

/// Serialisable snapshot of the monitor.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionMetrics {
    pub total_connections: u64,
    pub total_disconnections: u64,
    pub total_reconnections: u64,
    pub average_connection_duration_ms: u64,
    pub stability: f64,
    pub uptime_ratio: f64,
    pub history: Vec<ConnectionRecord>,
}

#[derive(Debug, Default)]
pub struct ConnectionMonitor {
    history: VecDeque<ConnectionRecord>,
    total_connections: u64,
    total_disconnections: u64,
    total_reconnections: u64,
    /// Sum of completed connection intervals.
    connected_ms: u64,
    connected_since: Option<u64>,
    disconnected_since: Option<u64>,
    observed_since: Option<u64>,
}

impl ConnectionMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, event: &TransportEvent) {
        if let TransportEvent::StateChanged(state) = event {
            self.record(*state, timestamp_now_ms());
        }
    }

    /// Record a state transition at `now` (unix millis). Only the edges into
    /// and out of `Connected` count; a failed connect attempt is not a
    /// disconnection.
    pub fn record(&mut self, state: ConnectionState, now: u64) {
        self.observed_since.get_or_insert(now);
        match state {
            ConnectionState::Connected => {
                if self.connected_since.is_some() {
                    return;
                }
                if self.total_connections > 0 {
                    self.total_reconnections += 1;
                }
                let outage = self.disconnected_since.take().map(|since| now.saturating_sub(since));
                self.total_connections += 1;
                self.connected_since = Some(now);
                self.push(ConnectionRecord {
                    timestamp: now,
                    event: ConnectionEventKind::Connected,
                    duration_ms: outage,
                });
            }
            ConnectionState::Disconnected | ConnectionState::PermanentlyFailed => {
                let Some(since) = self.connected_since.take() else {
                    return;
                };
                let duration = now.saturating_sub(since);
                self.connected_ms = self.connected_ms.saturating_add(duration);
                self.total_disconnections += 1;
                self.disconnected_since = Some(now);
                self.push(ConnectionRecord {
                    timestamp: now,
                    event: ConnectionEventKind::Disconnected,
                    duration_ms: Some(duration),
                });
            }
            ConnectionState::Connecting => {}
        }
    }

    fn push(&mut self, record: ConnectionRecord) {
        if self.history.len() == HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(record);
    }

    pub fn total_connections(&self) -> u64 {
        self.total_connections
    }

    pub fn total_disconnections(&self) -> u64 {
        self.total_disconnections
    }

    pub fn total_reconnections(&self) -> u64 {
        self.total_reconnections
    }

    /// Mean length of the connections that have ended.
    pub fn average_connection_duration(&self) -> Duration {
        if self.total_disconnections == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(self.connected_ms / self.total_disconnections)
    }

    /// `connections / (connections + disconnections)`, 1.0 before any event.
    #[allow(clippy::cast_precision_loss)]
    pub fn stability(&self) -> f64 {
        let total = self.total_connections + self.total_disconnections;
        if total == 0 {
            return 1.0;
        }
        self.total_connections as f64 / total as f64
    }

    /// Share of the observed time spent connected.
    #[allow(clippy::cast_precision_loss)]
    pub fn uptime_ratio(&self, now: u64) -> f64 {
        let Some(observed_since) = self.observed_since else {
            return 0.0;
        };
        let observed = now.saturating_sub(observed_since);
        let current = self.connected_since.map_or(0, |since| now.saturating_sub(since));
        let connected = self.connected_ms.saturating_add(current);
        if observed == 0 {
            return if self.connected_since.is_some() { 1.0 } else { 0.0 };
        }
        (connected as f64 / observed as f64).min(1.0)
    }

    pub fn history(&self) -> impl Iterator<Item = &ConnectionRecord> {
        self.history.iter()
    }

    /// Clear counters and history. A live connection keeps being tracked
    /// from `now`.
    pub fn reset(&mut self, now: u64) {
        let connected = self.connected_since.is_some();
        *self = Self::default();
        if connected {
            self.connected_since = Some(now);
            self.observed_since = Some(now);
        }
    }

    pub fn snapshot(&self, now: u64) -> ConnectionMetrics {
        ConnectionMetrics {
            total_connections: self.total_connections,
            total_disconnections: self.total_disconnections,
            total_reconnections: self.total_reconnections,
            average_connection_duration_ms: u64::try_from(
                self.average_connection_duration().as_millis(),
            )
            .unwrap_or(u64::MAX),
            stability: self.stability(),
            uptime_ratio: self.uptime_ratio(now),
            history: self.history.iter().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_monitor() {
        let monitor = ConnectionMonitor::new();
        assert!((monitor.stability() - 1.0).abs() < f64::EPSILON);
        assert_eq!(monitor.average_connection_duration(), Duration::ZERO);
        assert!(monitor.uptime_ratio(1_000).abs() < f64::EPSILON);
    }

    #[test]
    fn counts_and_durations() {
        let mut monitor = ConnectionMonitor::new();
        monitor.record(ConnectionState::Connecting, 0);
        monitor.record(ConnectionState::Connected, 0);
        monitor.record(ConnectionState::Disconnected, 1_000);
        monitor.record(ConnectionState::Connecting, 1_500);
        monitor.record(ConnectionState::Disconnected, 1_600);
        monitor.record(ConnectionState::Connected, 2_000);
        monitor.record(ConnectionState::Disconnected, 5_000);

        assert_eq!(monitor.total_connections(), 2);
        assert_eq!(monitor.total_disconnections(), 2);
        assert_eq!(monitor.total_reconnections(), 1);
        assert_eq!(monitor.average_connection_duration(), Duration::from_millis(2_000));
        assert!((monitor.stability() - 0.5).abs() < f64::EPSILON);
        assert!((monitor.uptime_ratio(5_000) - 0.8).abs() < 1e-9);

        let durations: Vec<_> = monitor.history().map(|r| r.duration_ms).collect();
        assert_eq!(durations, vec![None, Some(1_000), Some(1_000), Some(3_000)]);
    }

    #[test]
    fn history_is_bounded() {
        let mut monitor = ConnectionMonitor::new();
        for i in 0..150u64 {
            monitor.record(ConnectionState::Connected, i * 10);
            monitor.record(ConnectionState::Disconnected, i * 10 + 5);
        }
        assert_eq!(monitor.history().count(), HISTORY_LIMIT);
        assert_eq!(monitor.total_connections(), 150);
        assert_eq!(monitor.history().last().unwrap().timestamp, 1_495);
    }

    #[test]
    fn reset_keeps_live_connection() {
        let mut monitor = ConnectionMonitor::new();
        monitor.record(ConnectionState::Connected, 0);
        monitor.record(ConnectionState::Disconnected, 10);
        monitor.record(ConnectionState::Connected, 20);
        monitor.reset(100);

        assert_eq!(monitor.total_connections(), 0);
        assert_eq!(monitor.history().count(), 0);
        assert!((monitor.uptime_ratio(200) - 1.0).abs() < f64::EPSILON);

        monitor.record(ConnectionState::Disconnected, 200);
        assert_eq!(monitor.total_disconnections(), 1);
        assert_eq!(monitor.average_connection_duration(), Duration::from_millis(100));
    }

    #[test]
    fn snapshot_serialises() {
        let mut monitor = ConnectionMonitor::new();
        monitor.record(ConnectionState::Connected, 0);
        let json = serde_json::to_value(monitor.snapshot(50)).unwrap();
        assert_eq!(json["totalConnections"], 1);
        assert_eq!(json["history"][0]["event"], "connected");
        assert_eq!(json["uptimeRatio"], 1.0);
    }
}

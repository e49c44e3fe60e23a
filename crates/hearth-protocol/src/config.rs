//! Client configuration, loaded from a JSON file.
//!
//! Every field has a default, so a config file only needs the values that
//! differ. Example `hearth.json`:
//! ```json
//! {
//!   "server_url": "wss://chat.example.org/ws",
//!   "directory_url": "https://chat.example.org/api",
//!   "user_id": "alice",
//!   "reconnect": { "base_delay_ms": 1000, "max_attempts": 5 }
//! }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// WebSocket endpoint of the relay server.
    pub server_url: String,
    /// Base URL of the pre-key directory.
    pub directory_url: String,
    /// Local user id, announced on connect.
    pub user_id: String,
    pub reconnect: ReconnectPolicy,
    pub heartbeat: HeartbeatConfig,
    pub crypto: CryptoConfig,
    pub ordering: OrderingConfig,
    /// Capacity of the transport's command and event channels.
    pub channel_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:8080/ws".to_string(),
            directory_url: "http://127.0.0.1:8080".to_string(),
            user_id: String::new(),
            reconnect: ReconnectPolicy::default(),
            heartbeat: HeartbeatConfig::default(),
            crypto: CryptoConfig::default(),
            ordering: OrderingConfig::default(),
            channel_capacity: 256,
        }
    }
}

/// Exponential reconnect backoff: `base * 2^(attempt-1)`, capped at `max`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Consecutive failed attempts before giving up.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            max_attempts: 8,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let delay = self.base_delay_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval_ms: u64,
    /// How long to wait for a pong before treating the link as dropped.
    pub timeout_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: 25_000,
            timeout_ms: 10_000,
        }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// How far ahead of the receiving chain a frame may be and still decrypt.
    pub max_skip: u64,
    /// Size of the one-time pre-key pool.
    pub one_time_prekey_count: u32,
    /// Replenish the pool once it falls below this many keys.
    pub prekey_low_watermark: u32,
    /// How long a rotated-out signed pre-key still accepts handshakes.
    pub signed_prekey_grace_secs: u64,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            max_skip: 256,
            one_time_prekey_count: 100,
            prekey_low_watermark: 20,
            signed_prekey_grace_secs: 7 * 24 * 3600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderingConfig {
    /// Frames allowed to wait behind a gap before the gap is skipped.
    pub max_pending: usize,
}

impl Default for OrderingConfig {
    fn default() -> Self {
        Self { max_pending: 64 }
    }
}

impl ClientConfig {
    /// Read a config file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self, ProtocolError> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| ProtocolError::Config(format!("failed to read {}: {e}", path.display())))?;
        let config: Self = serde_json::from_str(&data)
            .map_err(|e| ProtocolError::Config(format!("failed to parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse without validating.
    pub fn from_json(data: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(data).map_err(|e| ProtocolError::Config(format!("invalid config: {e}")))
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.user_id.is_empty() {
            return Err(ProtocolError::Config("user_id must be set".into()));
        }
        if self.reconnect.base_delay_ms == 0 {
            return Err(ProtocolError::Config("reconnect.base_delay_ms must be > 0".into()));
        }
        if self.reconnect.max_delay_ms < self.reconnect.base_delay_ms {
            return Err(ProtocolError::Config(
                "reconnect.max_delay_ms must be >= base_delay_ms".into(),
            ));
        }
        if self.reconnect.max_attempts == 0 {
            return Err(ProtocolError::Config("reconnect.max_attempts must be > 0".into()));
        }
        if self.heartbeat.interval_ms == 0 || self.heartbeat.timeout_ms == 0 {
            return Err(ProtocolError::Config("heartbeat intervals must be > 0".into()));
        }
        if self.channel_capacity == 0 {
            return Err(ProtocolError::Config("channel_capacity must be > 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_caps() {
        let policy = ReconnectPolicy {
            base_delay_ms: 100,
            max_delay_ms: 1000,
            max_attempts: 10,
        };
        let delays: Vec<u64> = (1..=8)
            .map(|a| u64::try_from(policy.delay_for(a).as_millis()).unwrap())
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000, 1000, 1000]);
    }

    #[test]
    fn backoff_is_non_decreasing_and_bounded() {
        let policy = ReconnectPolicy::default();
        let mut previous = Duration::ZERO;
        for attempt in 1..=200 {
            let delay = policy.delay_for(attempt);
            assert!(delay >= previous);
            assert!(delay <= Duration::from_millis(policy.max_delay_ms));
            previous = delay;
        }
    }

    #[test]
    fn partial_file_takes_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("hearth.json");
        std::fs::write(
            &path,
            r#"{"user_id": "alice", "reconnect": {"max_attempts": 3}}"#,
        )
        .unwrap();

        let config = ClientConfig::load(&path).unwrap();
        assert_eq!(config.user_id, "alice");
        assert_eq!(config.reconnect.max_attempts, 3);
        assert_eq!(config.reconnect.base_delay_ms, 500);
        assert_eq!(config.heartbeat, HeartbeatConfig::default());
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut config = ClientConfig {
            user_id: "bob".into(),
            ..ClientConfig::default()
        };
        assert!(config.validate().is_ok());

        config.reconnect.max_delay_ms = 10;
        assert!(config.validate().is_err());

        config.reconnect = ReconnectPolicy {
            max_attempts: 0,
            ..ReconnectPolicy::default()
        };
        assert!(config.validate().is_err());

        config.reconnect = ReconnectPolicy::default();
        config.user_id.clear();
        assert!(config.validate().is_err());
    }
}

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Proxy-side settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// How long a freshly accepted backend has to send `Hello`.
    pub handshake_timeout_ms: u64,

    /// A backend that sends nothing (not even a heartbeat) for this long
    /// is dropped.
    pub idle_timeout_secs: u64,
}

impl HubConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 5_000,
            idle_timeout_secs: 30,
        }
    }
}

/// Backend-side settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// This backend's name, as the proxy routes players to it.
    pub node: String,

    /// A player's state is trusted for this long after the last push or
    /// query reply. After that, a gate check re-queries the proxy.
    pub staleness_secs: u64,

    /// How long a re-query may take before the gate fails closed.
    pub query_timeout_ms: u64,

    /// Pause between reconnect attempts.
    pub reconnect_delay_ms: u64,

    /// Heartbeat period. Three missed periods without any inbound
    /// traffic drop the link.
    pub heartbeat_interval_ms: u64,
}

impl ClientConfig {
    pub fn staleness(&self) -> Duration {
        Duration::from_secs(self.staleness_secs)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            node: "backend".to_string(),
            staleness_secs: 5,
            query_timeout_ms: 2_000,
            reconnect_delay_ms: 1_000,
            heartbeat_interval_ms: 5_000,
        }
    }
}

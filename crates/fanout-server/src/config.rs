//! Server configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::websocket::lifecycle::LifecycleConfig;

/// Configuration for the fan-out server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Address siblings use to reach this host; defaults to the bound address.
    pub advertise: Option<String>,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
    /// Heartbeat interval in seconds.
    pub heartbeat_interval_secs: u64,
    /// Heartbeat timeout in seconds (close after this long without a pong).
    pub heartbeat_timeout_secs: u64,
    /// Outbound frames buffered per connection.
    pub send_buffer: usize,
    /// Max WebSocket message size in bytes.
    pub max_message_size: usize,
}

impl ServerConfig {
    /// Per-connection lifecycle settings.
    pub fn lifecycle(&self) -> LifecycleConfig {
        LifecycleConfig {
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs.max(1)),
            heartbeat_timeout: Duration::from_secs(self.heartbeat_timeout_secs),
            send_buffer: self.send_buffer,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            advertise: None,
            max_connections: 10_000,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
            send_buffer: 256,
            max_message_size: 64 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_binds_loopback_on_any_port() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.port, 0);
        assert!(cfg.advertise.is_none());
    }

    #[test]
    fn lifecycle_mapping() {
        let cfg = ServerConfig {
            heartbeat_interval_secs: 5,
            heartbeat_timeout_secs: 15,
            send_buffer: 8,
            ..ServerConfig::default()
        };
        let lc = cfg.lifecycle();
        assert_eq!(lc.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(lc.heartbeat_timeout, Duration::from_secs(15));
        assert_eq!(lc.send_buffer, 8);
    }

    #[test]
    fn zero_interval_is_clamped() {
        let cfg = ServerConfig {
            heartbeat_interval_secs: 0,
            ..ServerConfig::default()
        };
        assert_eq!(cfg.lifecycle().heartbeat_interval, Duration::from_secs(1));
    }

    #[test]
    fn serde_roundtrip() {
        let cfg = ServerConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: ServerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.max_connections, cfg.max_connections);
    }
}

//! Settings schema.

use std::time::Duration;

use fanout_core::logging::LogFormat;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FanoutSettings {
    /// Network and connection settings.
    pub server: ServerSettings,
    /// Shared presence directory settings.
    pub presence: PresenceSettings,
    /// Inter-host relay settings.
    pub relay: RelaySettings,
    /// Log output settings.
    pub logging: LoggingSettings,
}

impl FanoutSettings {
    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        let server = &self.server;
        if server.heartbeat_timeout_secs < server.heartbeat_interval_secs {
            return Err(SettingsError::invalid(
                "server.heartbeatTimeoutSecs",
                format!(
                    "{}s is shorter than the heartbeat interval ({}s)",
                    server.heartbeat_timeout_secs, server.heartbeat_interval_secs
                ),
            ));
        }
        let presence = &self.presence;
        if presence.lease_secs > 0 && presence.renew_interval_secs >= presence.lease_secs {
            return Err(SettingsError::invalid(
                "presence.renewIntervalSecs",
                format!(
                    "{}s must be shorter than the lease ({}s)",
                    presence.renew_interval_secs, presence.lease_secs
                ),
            ));
        }
        if presence.backend == PresenceBackend::Sqlite && presence.sqlite_path.trim().is_empty() {
            return Err(SettingsError::invalid(
                "presence.sqlitePath",
                "required by the sqlite backend",
            ));
        }
        Ok(())
    }
}

/// Server network and connection settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Address sibling hosts use to reach this one (`host:port`).
    ///
    /// Derived from the bound address when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advertise: Option<String>,
    /// Maximum concurrent client connections on this host.
    pub max_connections: usize,
    /// Seconds between server pings.
    pub heartbeat_interval_secs: u64,
    /// Seconds without a pong before a connection is reaped.
    pub heartbeat_timeout_secs: u64,
    /// Outbound frames buffered per connection before sends fail.
    pub send_buffer: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8444,
            advertise: None,
            max_connections: 10_000,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
            send_buffer: 256,
        }
    }
}

/// Which store backs the presence and channel directories.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceBackend {
    /// Process-local store; only correct for a single host.
    #[default]
    Memory,
    /// `SQLite` file shared by every host on the machine.
    Sqlite,
}

/// Presence directory settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PresenceSettings {
    /// Store backend.
    pub backend: PresenceBackend,
    /// Database path for the `SQLite` backend.
    pub sqlite_path: String,
    /// Lease attached to each announcement in seconds (`0` disables expiry).
    pub lease_secs: u64,
    /// Seconds between lease renewals.
    pub renew_interval_secs: u64,
}

impl PresenceSettings {
    /// Lease as a duration, `None` when disabled.
    pub fn lease(&self) -> Option<Duration> {
        (self.lease_secs > 0).then(|| Duration::from_secs(self.lease_secs))
    }

    /// Renewal interval as a duration.
    pub fn renew_interval(&self) -> Duration {
        Duration::from_secs(self.renew_interval_secs.max(1))
    }
}

impl Default for PresenceSettings {
    fn default() -> Self {
        Self {
            backend: PresenceBackend::Memory,
            sqlite_path: "presence.db".to_string(),
            lease_secs: 90,
            renew_interval_secs: 30,
        }
    }
}

/// Inter-host relay settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelaySettings {
    /// Per-relay HTTP timeout in milliseconds.
    pub timeout_ms: u64,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self { timeout_ms: 2_000 }
    }
}

/// Log output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Minimum level or `EnvFilter` directive.
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}

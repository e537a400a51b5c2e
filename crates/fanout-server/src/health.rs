//! `/health` endpoint.

use serde::Serialize;
use std::time::Instant;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// `"ok"` while serving, `"draining"` once shutdown has begun.
    pub status: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// This host's id.
    pub host: String,
    /// Current local WebSocket connection count.
    pub connections: usize,
    /// Accounts with at least one local connection.
    pub accounts: usize,
}

/// Build a health response from live counters.
pub fn health_check(
    start_time: Instant,
    host: &str,
    connections: usize,
    accounts: usize,
    draining: bool,
) -> HealthResponse {
    HealthResponse {
        status: if draining { "draining" } else { "ok" }.into(),
        uptime_secs: start_time.elapsed().as_secs(),
        host: host.to_owned(),
        connections,
        accounts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_is_ok() {
        let resp = health_check(Instant::now(), "h1:1", 0, 0, false);
        assert_eq!(resp.status, "ok");
        assert!(resp.uptime_secs < 2);
    }

    #[test]
    fn draining_status() {
        let resp = health_check(Instant::now(), "h1:1", 0, 0, true);
        assert_eq!(resp.status, "draining");
    }

    #[test]
    fn uptime_increases() {
        let start = Instant::now()
            .checked_sub(std::time::Duration::from_secs(60))
            .unwrap();
        let resp = health_check(start, "h1:1", 0, 0, false);
        assert!(resp.uptime_secs >= 59);
    }

    #[test]
    fn serialization() {
        let resp = health_check(Instant::now(), "h1:1", 3, 2, false);
        let parsed = serde_json::to_value(&resp).unwrap();
        assert_eq!(parsed["status"], "ok");
        assert_eq!(parsed["host"], "h1:1");
        assert_eq!(parsed["connections"], 3);
        assert_eq!(parsed["accounts"], 2);
        assert!(parsed["uptime_secs"].is_number());
    }
}

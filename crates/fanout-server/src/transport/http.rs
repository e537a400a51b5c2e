//! Relay transport over HTTP between hosts.
//!
//! Each envelope is POSTed as JSON to `http://{destination}/relay`, where
//! the receiving host's router validates and delivers it locally.

use std::time::Duration;

use async_trait::async_trait;
use fanout_core::{HostId, RelayEnvelope, RelayError};
use tracing::debug;

use super::InterHostTransport;

/// Path sibling hosts accept relays on.
pub const RELAY_PATH: &str = "/relay";

/// Relay transport backed by `reqwest`.
pub struct HttpRelayTransport {
    client: reqwest::Client,
}

impl HttpRelayTransport {
    /// Create a transport whose requests give up after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .user_agent(concat!("fanout/", env!("CARGO_PKG_VERSION")))
                .build()
                .unwrap_or_default(),
        }
    }

    /// URL relays for `host` are posted to.
    pub fn relay_url(host: &HostId) -> String {
        format!("http://{host}{RELAY_PATH}")
    }
}

#[async_trait]
impl InterHostTransport for HttpRelayTransport {
    async fn publish(
        &self,
        destination: &HostId,
        envelope: &RelayEnvelope,
    ) -> Result<(), RelayError> {
        let url = Self::relay_url(destination);
        let response = self
            .client
            .post(&url)
            .json(envelope)
            .send()
            .await
            .map_err(|e| RelayError::Publish {
                host: destination.to_string(),
                message: format!("request failed: {e}"),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::Publish {
                host: destination.to_string(),
                message: format!("HTTP {}", status.as_u16()),
            });
        }
        debug!(%destination, status = status.as_u16(), "relay accepted");
        Ok(())
    }
}

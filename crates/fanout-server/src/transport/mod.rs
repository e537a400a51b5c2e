//! Inter-host relay transports.
//!
//! A relay is published to exactly one destination host. Delivery is
//! at-most-once: a publish that fails is reported to the caller and never
//! retried here.

pub mod http;
pub mod memory;

use async_trait::async_trait;
use fanout_core::{HostId, RelayEnvelope, RelayError};

pub use http::HttpRelayTransport;
pub use memory::{MemoryBus, spawn_relay_listener};

/// Carries relay envelopes between hosts.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait InterHostTransport: Send + Sync {
    /// Hand `envelope` to the bus for `destination`.
    async fn publish(&self, destination: &HostId, envelope: &RelayEnvelope)
    -> Result<(), RelayError>;
}

//! # fanout-core
//!
//! Foundation types shared by every fan-out crate:
//!
//! - **Branded IDs**: `AccountId`, `HostId`, `ChannelId`, `ConnectionId`
//! - **Envelopes**: `DirectMessage`, `ChannelMessage`, `RelayEnvelope`
//! - **Errors**: handshake, delivery, directory, and relay failures via `thiserror`
//! - **Logging**: `tracing-subscriber` initialization

#![deny(unsafe_code)]

pub mod envelope;
pub mod errors;
pub mod ids;
pub mod logging;

pub use envelope::{ChannelMessage, DirectMessage, RelayEnvelope, RelayPayload};
pub use errors::{
    DeliveryError, DirectoryError, DirectoryOperation, FanoutError, HandshakeError, RelayError,
};
pub use ids::{AccountId, ChannelId, ConnectionId, HostId};

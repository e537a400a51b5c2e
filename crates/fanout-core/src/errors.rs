//! Error hierarchy for the fan-out service.
//!
//! - [`HandshakeError`]: a connection never reached the active state
//! - [`DeliveryError`]: a write to one live connection failed
//! - [`DirectoryError`]: a shared-store round trip failed
//! - [`RelayError`]: an inter-host relay was rejected or could not be sent
//! - [`FanoutError`]: top-level enum wrapping all of the above
//!
//! None of these abort process state. Callers either absorb them with
//! best-effort continuation or surface them to the narrow operation that
//! failed.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Top-level error type.
#[derive(Debug, Error)]
pub enum FanoutError {
    /// Connection handshake rejected.
    #[error("{0}")]
    Handshake(#[from] HandshakeError),

    /// Per-recipient delivery failure.
    #[error("{0}")]
    Delivery(#[from] DeliveryError),

    /// Shared directory failure.
    #[error("{0}")]
    Directory(#[from] DirectoryError),

    /// Relay failure.
    #[error("{0}")]
    Relay(#[from] RelayError),
}

impl FanoutError {
    /// Machine-readable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Handshake(e) => e.code(),
            Self::Delivery(_) => "DELIVERY_FAILED",
            Self::Directory(_) => "DIRECTORY_UNAVAILABLE",
            Self::Relay(e) => e.code(),
        }
    }
}

/// Why a connection was refused before registration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// No account id was supplied, or it was blank.
    #[error("missing account id")]
    MissingAccount,

    /// The server is at its connection limit.
    #[error("connection limit reached ({limit})")]
    AtCapacity {
        /// Configured maximum.
        limit: usize,
    },

    /// The server is shutting down.
    #[error("server is shutting down")]
    ShuttingDown,

    /// The protocol upgrade itself failed.
    #[error("upgrade failed: {0}")]
    Upgrade(String),
}

impl HandshakeError {
    /// Machine-readable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingAccount => "MISSING_ACCOUNT",
            Self::AtCapacity { .. } => "AT_CAPACITY",
            Self::ShuttingDown => "SHUTTING_DOWN",
            Self::Upgrade(_) => "UPGRADE_FAILED",
        }
    }
}

/// A frame could not be queued for one connection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// The connection's outbound buffer is full.
    #[error("outbound buffer full for {conn_id}")]
    BufferFull {
        /// Connection that rejected the frame.
        conn_id: String,
    },

    /// The connection's writer has gone away.
    #[error("connection {conn_id} is closed")]
    Closed {
        /// Connection that rejected the frame.
        conn_id: String,
    },

    /// The frame could not be serialized.
    #[error("failed to encode frame: {0}")]
    Encode(String),
}

/// Shared-directory operation that failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectoryOperation {
    /// Adding this host to an account's presence set.
    Announce,
    /// Removing this host from an account's presence set.
    Retract,
    /// Reading an account's presence set.
    Hosts,
    /// Adding an account to a channel.
    Subscribe,
    /// Removing an account from a channel.
    Unsubscribe,
    /// Reading a channel's subscribers.
    Subscribers,
    /// Deleting lapsed announcements.
    Purge,
}

impl fmt::Display for DirectoryOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Announce => write!(f, "announce"),
            Self::Retract => write!(f, "retract"),
            Self::Hosts => write!(f, "hosts"),
            Self::Subscribe => write!(f, "subscribe"),
            Self::Unsubscribe => write!(f, "unsubscribe"),
            Self::Subscribers => write!(f, "subscribers"),
            Self::Purge => write!(f, "purge"),
        }
    }
}

/// A round trip to the backing store failed.
#[derive(Debug, Error)]
#[error("directory {operation} failed for {key}: {message}")]
pub struct DirectoryError {
    /// Operation that failed.
    pub operation: DirectoryOperation,
    /// Store key involved (account or channel).
    pub key: String,
    /// Human-readable message.
    pub message: String,
    /// Original cause.
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl DirectoryError {
    /// Create a directory error.
    #[must_use]
    pub fn new(
        operation: DirectoryOperation,
        key: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            operation,
            key: key.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Attach the underlying cause.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }
}

/// A relay was rejected on arrival or could not be published.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// The relay names a different destination host.
    #[error("relay for {destination} arrived at {local}")]
    Misaddressed {
        /// Host named in the envelope.
        destination: String,
        /// Host that received it.
        local: String,
    },

    /// The relay originated on the receiving host.
    #[error("relay loop detected (origin {origin})")]
    Loop {
        /// Origin named in the envelope.
        origin: String,
    },

    /// The relay could not be decoded or contains invalid fields.
    #[error("malformed relay: {0}")]
    Malformed(String),

    /// The bus refused or failed to carry the relay.
    #[error("relay to {host} failed: {message}")]
    Publish {
        /// Destination host.
        host: String,
        /// Human-readable message.
        message: String,
    },
}

impl RelayError {
    /// Machine-readable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Misaddressed { .. } => "RELAY_MISADDRESSED",
            Self::Loop { .. } => "RELAY_LOOP",
            Self::Malformed(_) => "RELAY_MALFORMED",
            Self::Publish { .. } => "RELAY_PUBLISH_FAILED",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_display() {
        assert_eq!(HandshakeError::MissingAccount.to_string(), "missing account id");
        assert_eq!(
            HandshakeError::AtCapacity { limit: 3 }.to_string(),
            "connection limit reached (3)"
        );
    }

    #[test]
    fn directory_error_display() {
        let err = DirectoryError::new(DirectoryOperation::Announce, "alice", "store down");
        assert_eq!(
            err.to_string(),
            "directory announce failed for alice: store down"
        );
    }

    #[test]
    fn directory_error_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = DirectoryError::new(DirectoryOperation::Hosts, "bob", "io").with_source(io);
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn fanout_error_codes() {
        let e: FanoutError = HandshakeError::MissingAccount.into();
        assert_eq!(e.code(), "MISSING_ACCOUNT");
        let e: FanoutError = RelayError::Loop { origin: "h1".into() }.into();
        assert_eq!(e.code(), "RELAY_LOOP");
        let e: FanoutError = DeliveryError::Closed {
            conn_id: "c1".into(),
        }
        .into();
        assert_eq!(e.code(), "DELIVERY_FAILED");
    }

    #[test]
    fn operation_display() {
        assert_eq!(DirectoryOperation::Retract.to_string(), "retract");
        assert_eq!(DirectoryOperation::Subscribers.to_string(), "subscribers");
        assert_eq!(DirectoryOperation::Purge.to_string(), "purge");
    }
}

//! Message envelopes routed between accounts and hosts.
//!
//! Envelopes are immutable once constructed: fields are private and only
//! exposed through accessors. A [`RelayEnvelope`] wraps one of them for
//! transfer to a sibling host and is the only type that crosses the
//! inter-host bus.

use serde::{Deserialize, Serialize};

use crate::errors::RelayError;
use crate::ids::{AccountId, ChannelId, HostId};

/// A message from one account to every live connection of another.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectMessage {
    source: AccountId,
    target: AccountId,
    content: String,
}

impl DirectMessage {
    /// Build a direct message.
    #[must_use]
    pub fn new(source: AccountId, target: AccountId, content: impl Into<String>) -> Self {
        Self {
            source,
            target,
            content: content.into(),
        }
    }

    /// Sending account.
    #[must_use]
    pub fn source(&self) -> &AccountId {
        &self.source
    }

    /// Receiving account.
    #[must_use]
    pub fn target(&self) -> &AccountId {
        &self.target
    }

    /// Message body.
    #[must_use]
    pub fn content(&self) -> &str {
        &self.content
    }
}

/// A message broadcast to every subscriber of a channel except its author.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelMessage {
    channel: ChannelId,
    author: AccountId,
    content: String,
}

impl ChannelMessage {
    /// Build a channel message.
    #[must_use]
    pub fn new(channel: ChannelId, author: AccountId, content: impl Into<String>) -> Self {
        Self {
            channel,
            author,
            content: content.into(),
        }
    }

    /// Target channel.
    #[must_use]
    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    /// Authoring account (excluded from delivery).
    #[must_use]
    pub fn author(&self) -> &AccountId {
        &self.author
    }

    /// Message body.
    #[must_use]
    pub fn content(&self) -> &str {
        &self.content
    }
}

/// Payload carried by a relay.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RelayPayload {
    /// A direct message for the target's connections on the receiving host.
    Direct {
        /// The message.
        message: DirectMessage,
    },
    /// A channel message for the listed subscribers on the receiving host.
    Channel {
        /// The message.
        message: ChannelMessage,
        /// Subscribers the sender believes are present on the receiving host.
        recipients: Vec<AccountId>,
    },
}

/// A message forwarded from the host that accepted a send to a sibling host.
///
/// Receiving hosts deliver relays to local connections only and never
/// forward them again.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayEnvelope {
    origin: HostId,
    destination: HostId,
    payload: RelayPayload,
}

impl RelayEnvelope {
    /// Wrap a direct message for `destination`.
    #[must_use]
    pub fn direct(origin: HostId, destination: HostId, message: DirectMessage) -> Self {
        Self {
            origin,
            destination,
            payload: RelayPayload::Direct { message },
        }
    }

    /// Wrap a channel message for the given recipients on `destination`.
    #[must_use]
    pub fn channel(
        origin: HostId,
        destination: HostId,
        message: ChannelMessage,
        recipients: Vec<AccountId>,
    ) -> Self {
        Self {
            origin,
            destination,
            payload: RelayPayload::Channel {
                message,
                recipients,
            },
        }
    }

    /// Host that accepted the original send.
    #[must_use]
    pub fn origin(&self) -> &HostId {
        &self.origin
    }

    /// Host this relay is addressed to.
    #[must_use]
    pub fn destination(&self) -> &HostId {
        &self.destination
    }

    /// The relayed message.
    #[must_use]
    pub fn payload(&self) -> &RelayPayload {
        &self.payload
    }

    /// Check that this relay may be delivered on `local`.
    ///
    /// Rejects relays addressed elsewhere, relays that originated on this
    /// host (a loop), and payloads with blank identifiers.
    pub fn validate_for(&self, local: &HostId) -> Result<(), RelayError> {
        if self.destination != *local {
            return Err(RelayError::Misaddressed {
                destination: self.destination.to_string(),
                local: local.to_string(),
            });
        }
        if self.origin == *local || self.origin.is_blank() {
            return Err(RelayError::Loop {
                origin: self.origin.to_string(),
            });
        }
        let blank = match &self.payload {
            RelayPayload::Direct { message } => {
                message.source.is_blank() || message.target.is_blank()
            }
            RelayPayload::Channel {
                message,
                recipients,
            } => {
                message.channel.is_blank()
                    || message.author.is_blank()
                    || recipients.iter().any(AccountId::is_blank)
            }
        };
        if blank {
            return Err(RelayError::Malformed(
                "relay payload contains a blank identifier".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn dm() -> DirectMessage {
        DirectMessage::new("bob".into(), "alice".into(), "hi")
    }

    #[test]
    fn direct_message_accessors() {
        let m = dm();
        assert_eq!(m.source().as_str(), "bob");
        assert_eq!(m.target().as_str(), "alice");
        assert_eq!(m.content(), "hi");
    }

    #[test]
    fn channel_message_accessors() {
        let m = ChannelMessage::new("lobby".into(), "carol".into(), "hello all");
        assert_eq!(m.channel().as_str(), "lobby");
        assert_eq!(m.author().as_str(), "carol");
        assert_eq!(m.content(), "hello all");
    }

    #[test]
    fn relay_wire_format_is_tagged() {
        let env = RelayEnvelope::direct("h1:1".into(), "h2:1".into(), dm());
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["origin"], "h1:1");
        assert_eq!(json["destination"], "h2:1");
        assert_eq!(json["payload"]["kind"], "direct");
        assert_eq!(json["payload"]["message"]["target"], "alice");
    }

    #[test]
    fn channel_relay_carries_recipients() {
        let msg = ChannelMessage::new("lobby".into(), "carol".into(), "x");
        let env = RelayEnvelope::channel(
            "h1:1".into(),
            "h2:1".into(),
            msg,
            vec!["dave".into(), "erin".into()],
        );
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["payload"]["kind"], "channel");
        assert_eq!(json["payload"]["recipients"][1], "erin");
    }

    #[test]
    fn validate_accepts_well_formed() {
        let env = RelayEnvelope::direct("h1:1".into(), "h2:1".into(), dm());
        assert!(env.validate_for(&"h2:1".into()).is_ok());
    }

    #[test]
    fn validate_rejects_wrong_destination() {
        let env = RelayEnvelope::direct("h1:1".into(), "h2:1".into(), dm());
        assert_matches!(
            env.validate_for(&"h3:1".into()),
            Err(RelayError::Misaddressed { .. })
        );
    }

    #[test]
    fn validate_rejects_self_origin() {
        let env = RelayEnvelope::direct("h2:1".into(), "h2:1".into(), dm());
        assert_matches!(
            env.validate_for(&"h2:1".into()),
            Err(RelayError::Loop { .. })
        );
    }

    #[test]
    fn validate_rejects_blank_target() {
        let raw = r#"{"origin":"h1:1","destination":"h2:1","payload":{"kind":"direct","message":{"source":"bob","target":"","content":"x"}}}"#;
        let env: RelayEnvelope = serde_json::from_str(raw).unwrap();
        assert_matches!(
            env.validate_for(&"h2:1".into()),
            Err(RelayError::Malformed(_))
        );
    }

    #[test]
    fn unknown_kind_fails_to_parse() {
        let raw = r#"{"origin":"h1:1","destination":"h2:1","payload":{"kind":"presence"}}"#;
        assert!(serde_json::from_str::<RelayEnvelope>(raw).is_err());
    }
}

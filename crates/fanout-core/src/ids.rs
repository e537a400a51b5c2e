//! Branded ID newtypes for type safety.
//!
//! Accounts, hosts, channels, and connections are all identified by strings.
//! Each gets its own newtype so an account id can never be passed where a
//! host id is expected.
//!
//! Account, host, and channel ids are supplied from outside (request headers,
//! configuration) and only validated as non-blank. Connection ids are minted
//! locally as UUID v7 tokens.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create from a raw value, rejecting empty or whitespace-only input.
            #[must_use]
            pub fn parse(raw: impl Into<String>) -> Option<Self> {
                let raw = raw.into();
                if raw.trim().is_empty() {
                    None
                } else {
                    Some(Self(raw))
                }
            }

            /// Return the inner string as a slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Whether the id is blank (only possible through deserialization).
            #[must_use]
            pub fn is_blank(&self) -> bool {
                self.0.trim().is_empty()
            }

            /// Consume self and return the inner `String`.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl std::ops::Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

branded_id! {
    /// Identity of an authenticated principal owning zero or more connections.
    AccountId
}

branded_id! {
    /// Externally reachable identity of one server process (`host:port`).
    HostId
}

branded_id! {
    /// Name of a broadcast channel.
    ChannelId
}

/// Per-process identifier of one live connection.
///
/// Unique among concurrently open connections on this process.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Mint a fresh id (UUID v7, time-ordered).
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("conn_{}", Uuid::now_v7().simple()))
    }

    /// Mint a fresh id tagged with the peer address.
    ///
    /// The peer address alone is not unique behind proxies, so the token is
    /// always appended.
    #[must_use]
    pub fn for_peer(peer: &std::net::SocketAddr) -> Self {
        Self(format!("{peer}#{}", Uuid::now_v7().simple()))
    }

    /// Return the inner string as a slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rejects_empty() {
        assert!(AccountId::parse("").is_none());
    }

    #[test]
    fn parse_rejects_whitespace() {
        assert!(AccountId::parse("   ").is_none());
        assert!(ChannelId::parse("\t\n").is_none());
    }

    #[test]
    fn parse_accepts_value() {
        let id = AccountId::parse("alice").unwrap();
        assert_eq!(id.as_str(), "alice");
    }

    #[test]
    fn deref_to_str() {
        let id = HostId::from("10.0.0.1:8444");
        let s: &str = &id;
        assert_eq!(s, "10.0.0.1:8444");
    }

    #[test]
    fn display() {
        let id = ChannelId::from("lobby");
        assert_eq!(format!("{id}"), "lobby");
    }

    #[test]
    fn serde_is_transparent() {
        let id = AccountId::from("bob");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"bob\"");
    }

    #[test]
    fn deserialized_blank_is_detectable() {
        let id: AccountId = serde_json::from_str("\"\"").unwrap();
        assert!(id.is_blank());
    }

    #[test]
    fn generated_connection_ids_are_unique() {
        let a = ConnectionId::generate();
        let b = ConnectionId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("conn_"));
    }

    #[test]
    fn peer_connection_ids_are_unique_for_same_peer() {
        let peer: std::net::SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let a = ConnectionId::for_peer(&peer);
        let b = ConnectionId::for_peer(&peer);
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("127.0.0.1:5000#"));
    }

    #[test]
    fn hash_and_eq() {
        use std::collections::HashSet;
        let mut set = HashSet::new();
        let _ = set.insert(AccountId::from("same"));
        let _ = set.insert(AccountId::from("same"));
        assert_eq!(set.len(), 1);
    }
}

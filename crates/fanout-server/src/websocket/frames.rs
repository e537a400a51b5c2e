//! JSON text frames written to clients.

use std::sync::Arc;

use fanout_core::{
    AccountId, ChannelId, ChannelMessage, ConnectionId, DeliveryError, DirectMessage, HostId,
};
use serde::{Deserialize, Serialize};

/// Payload of the `connection.established` frame.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EstablishedData {
    /// Id assigned to the connection.
    pub connection_id: ConnectionId,
    /// Account the connection was opened for.
    pub account_id: AccountId,
    /// Host holding the connection.
    pub host: HostId,
}

/// Frames the server sends over a client connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// First frame on every connection.
    #[serde(rename = "connection.established")]
    ConnectionEstablished {
        /// Connection details.
        data: EstablishedData,
    },
    /// A direct message addressed to the connection's account.
    DirectMessage {
        /// Sending account.
        from: AccountId,
        /// Message body.
        content: String,
        /// RFC 3339 time the frame was built.
        timestamp: String,
    },
    /// A broadcast on a channel the account subscribes to.
    ChannelMessage {
        /// Channel the message was sent on.
        channel: ChannelId,
        /// Authoring account.
        author: AccountId,
        /// Message body.
        content: String,
        /// RFC 3339 time the frame was built.
        timestamp: String,
    },
}

impl ServerFrame {
    /// Frame announcing a freshly registered connection.
    pub fn established(connection_id: ConnectionId, account_id: AccountId, host: HostId) -> Self {
        Self::ConnectionEstablished {
            data: EstablishedData {
                connection_id,
                account_id,
                host,
            },
        }
    }

    /// Frame carrying a direct message.
    pub fn direct(message: &DirectMessage) -> Self {
        Self::DirectMessage {
            from: message.source().clone(),
            content: message.content().to_owned(),
            timestamp: now(),
        }
    }

    /// Frame carrying a channel message.
    pub fn channel(message: &ChannelMessage) -> Self {
        Self::ChannelMessage {
            channel: message.channel().clone(),
            author: message.author().clone(),
            content: message.content().to_owned(),
            timestamp: now(),
        }
    }

    /// Serialize once for fan-out to many connections.
    pub fn encode(&self) -> Result<Arc<String>, DeliveryError> {
        serde_json::to_string(self)
            .map(Arc::new)
            .map_err(|e| DeliveryError::Encode(e.to_string()))
    }
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn parse(frame: &ServerFrame) -> Value {
        serde_json::from_str(&frame.encode().unwrap()).unwrap()
    }

    #[test]
    fn established_shape() {
        let v = parse(&ServerFrame::established(
            "conn_1".into(),
            "alice".into(),
            "h1:8444".into(),
        ));
        assert_eq!(v["type"], "connection.established");
        assert_eq!(v["data"]["connectionId"], "conn_1");
        assert_eq!(v["data"]["accountId"], "alice");
        assert_eq!(v["data"]["host"], "h1:8444");
    }

    #[test]
    fn direct_shape() {
        let msg = DirectMessage::new("bob".into(), "alice".into(), "hi");
        let v = parse(&ServerFrame::direct(&msg));
        assert_eq!(v["type"], "direct_message");
        assert_eq!(v["from"], "bob");
        assert_eq!(v["content"], "hi");
        assert!(v["timestamp"].is_string());
        assert!(v.get("target").is_none());
    }

    #[test]
    fn channel_shape() {
        let msg = ChannelMessage::new("lobby".into(), "bob".into(), "yo");
        let v = parse(&ServerFrame::channel(&msg));
        assert_eq!(v["type"], "channel_message");
        assert_eq!(v["channel"], "lobby");
        assert_eq!(v["author"], "bob");
    }

    #[test]
    fn frames_decode_back() {
        let msg = DirectMessage::new("bob".into(), "alice".into(), "hi");
        let frame = ServerFrame::direct(&msg);
        let decoded: ServerFrame = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded, frame);
    }
}

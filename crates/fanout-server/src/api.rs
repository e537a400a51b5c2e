//! HTTP request bodies and error responses.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use fanout_core::{AccountId, ChannelId, DirectoryError, HandshakeError, RelayError};
use serde::Deserialize;
use thiserror::Error;

/// Header carrying the connecting account id.
pub const ACCOUNT_HEADER: &str = "accountid";

/// Channel used when a broadcast names none.
pub const DEFAULT_CHANNEL: &str = "lobby";

/// Query string accepted by `GET /connect`.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectQuery {
    /// Account id, used when the header is absent.
    pub account: Option<String>,
}

/// Body of `POST /direct_message`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectMessageRequest {
    /// Sending account.
    #[serde(alias = "SourceAccountId")]
    pub source_account_id: String,
    /// Receiving account.
    #[serde(alias = "TargetAccountId")]
    pub target_account_id: String,
    /// Message body.
    #[serde(alias = "Content")]
    pub content: String,
}

impl DirectMessageRequest {
    /// Validated `(source, target)` pair.
    pub fn accounts(&self) -> Result<(AccountId, AccountId), ApiError> {
        Ok((
            required_account(&self.source_account_id, "sourceAccountId")?,
            required_account(&self.target_account_id, "targetAccountId")?,
        ))
    }
}

/// Body of `POST /send_message`.
#[derive(Debug, Deserialize)]
pub struct BroadcastRequest {
    /// Channel to publish on; defaults to [`DEFAULT_CHANNEL`].
    #[serde(default, alias = "Channel")]
    pub channel: Option<String>,
    /// Authoring account.
    #[serde(alias = "Author")]
    pub author: String,
    /// Message body.
    #[serde(alias = "Content")]
    pub content: String,
}

impl BroadcastRequest {
    /// Validated `(channel, author)` pair.
    pub fn target(&self) -> Result<(ChannelId, AccountId), ApiError> {
        let channel = match self.channel.as_deref() {
            None => ChannelId::from(DEFAULT_CHANNEL),
            Some(raw) => ChannelId::parse(raw)
                .ok_or_else(|| ApiError::BadRequest("channel must not be blank".into()))?,
        };
        Ok((channel, required_account(&self.author, "author")?))
    }
}

/// Body of `POST /channels/{channel}/subscribers`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeRequest {
    /// Account to subscribe.
    pub account_id: String,
}

fn required_account(raw: &str, field: &str) -> Result<AccountId, ApiError> {
    AccountId::parse(raw).ok_or_else(|| ApiError::BadRequest(format!("{field} must not be blank")))
}

/// Error returned by HTTP handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    /// WebSocket handshake rejected.
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    /// Shared directory unavailable.
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    /// Relay rejected.
    #[error(transparent)]
    Relay(#[from] RelayError),
    /// Request body failed validation.
    #[error("{0}")]
    BadRequest(String),
}

impl ApiError {
    /// HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Handshake(HandshakeError::MissingAccount | HandshakeError::Upgrade(_))
            | Self::BadRequest(_)
            | Self::Relay(RelayError::Malformed(_)) => StatusCode::BAD_REQUEST,
            Self::Handshake(HandshakeError::AtCapacity { .. } | HandshakeError::ShuttingDown)
            | Self::Directory(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Relay(RelayError::Misaddressed { .. }) => StatusCode::MISDIRECTED_REQUEST,
            Self::Relay(RelayError::Loop { .. }) => StatusCode::LOOP_DETECTED,
            Self::Relay(RelayError::Publish { .. }) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Handshake(e) => e.code(),
            Self::Directory(_) => "DIRECTORY_UNAVAILABLE",
            Self::Relay(e) => e.code(),
            Self::BadRequest(_) => "INVALID_PARAMS",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        });
        (self.status(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fanout_core::DirectoryOperation;

    #[test]
    fn direct_request_accepts_camel_and_original_names() {
        let camel: DirectMessageRequest = serde_json::from_str(
            r#"{"sourceAccountId":"bob","targetAccountId":"alice","content":"hi"}"#,
        )
        .unwrap();
        let pascal: DirectMessageRequest = serde_json::from_str(
            r#"{"SourceAccountId":"bob","TargetAccountId":"alice","Content":"hi"}"#,
        )
        .unwrap();
        assert_eq!(camel.accounts().unwrap(), pascal.accounts().unwrap());
    }

    #[test]
    fn blank_account_is_bad_request() {
        let req = DirectMessageRequest {
            source_account_id: "bob".into(),
            target_account_id: " ".into(),
            content: "hi".into(),
        };
        let err = req.accounts().unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert!(err.to_string().contains("targetAccountId"));
    }

    #[test]
    fn broadcast_defaults_to_lobby() {
        let req: BroadcastRequest =
            serde_json::from_str(r#"{"Author":"bob","Content":"yo"}"#).unwrap();
        let (channel, author) = req.target().unwrap();
        assert_eq!(channel.as_str(), DEFAULT_CHANNEL);
        assert_eq!(author.as_str(), "bob");
    }

    #[test]
    fn status_mapping() {
        assert_eq!(
            ApiError::from(HandshakeError::MissingAccount).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(HandshakeError::AtCapacity { limit: 1 }).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::from(RelayError::Loop {
                origin: "h1:1".into()
            })
            .status(),
            StatusCode::LOOP_DETECTED
        );
        assert_eq!(
            ApiError::from(DirectoryError::new(
                DirectoryOperation::Subscribe,
                "lobby",
                "down"
            ))
            .status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn error_body_has_code_and_message() {
        let resp = ApiError::BadRequest("nope".into()).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["error"]["code"], "INVALID_PARAMS");
        assert_eq!(parsed["error"]["message"], "nope");
    }
}

//! Token issuance
//!
//! Each connection attempt requests a short-lived provider token from the
//! session collaborator. A non-success response is a hard stop for that
//! attempt; retrying is the caller's decision, never this module's.

use crate::message::Channel;
use once_cell::sync::Lazy;
use serde::Serialize;
use tracing::debug;

/// Shared HTTP client for collaborator endpoints
pub(crate) static HTTP_CLIENT: Lazy<reqwest::Client> = Lazy::new(reqwest::Client::new);

/// Errors from the token-issuance endpoint
#[derive(Debug, thiserror::Error)]
pub enum TokenFetchError {
    #[error("Token request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Token endpoint rejected request: status {status}")]
    Rejected { status: u16 },

    #[error("Token response missing token field")]
    MissingToken,
}

#[derive(Debug, Serialize)]
struct TokenRequest<'a> {
    #[serde(rename = "sessionId")]
    session_id: &'a str,
    #[serde(rename = "channelKind")]
    channel_kind: &'a str,
}

/// Issues provider tokens for a channel connection attempt
#[async_trait::async_trait]
pub trait TokenIssuer: Send + Sync {
    async fn issue(&self, session_id: &str, channel: Channel) -> Result<String, TokenFetchError>;
}

/// Token issuer backed by the session collaborator's HTTP endpoint
pub struct HttpTokenIssuer {
    url: String,
}

impl HttpTokenIssuer {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait::async_trait]
impl TokenIssuer for HttpTokenIssuer {
    async fn issue(&self, session_id: &str, channel: Channel) -> Result<String, TokenFetchError> {
        let response = HTTP_CLIENT
            .post(&self.url)
            .json(&TokenRequest {
                session_id,
                channel_kind: channel.kind(),
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TokenFetchError::Rejected {
                status: status.as_u16(),
            });
        }

        let body: serde_json::Value = response.json().await?;
        // The endpoint returns either {"token": "..."} or {"token": {"key": "..."}}
        let token = body
            .get("token")
            .and_then(|t| t.as_str().or_else(|| t.get("key").and_then(|k| k.as_str())))
            .map(String::from)
            .ok_or(TokenFetchError::MissingToken)?;

        debug!(channel = %channel, "Fetched provider token");
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extract(body: serde_json::Value) -> Option<String> {
        body.get("token")
            .and_then(|t| t.as_str().or_else(|| t.get("key").and_then(|k| k.as_str())))
            .map(String::from)
    }

    #[test]
    fn test_token_extraction_plain_string() {
        let body = serde_json::json!({"token": "abc123"});
        assert_eq!(extract(body).as_deref(), Some("abc123"));
    }

    #[test]
    fn test_token_extraction_nested_key() {
        let body = serde_json::json!({"token": {"key": "nested456"}});
        assert_eq!(extract(body).as_deref(), Some("nested456"));
    }

    #[test]
    fn test_token_extraction_missing() {
        let body = serde_json::json!({"error": "nope"});
        assert_eq!(extract(body), None);
    }

    #[test]
    fn test_token_request_field_names() {
        let req = TokenRequest {
            session_id: "s1",
            channel_kind: Channel::Remote.kind(),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["sessionId"], "s1");
        assert_eq!(json["channelKind"], "capturescreen");
    }
}

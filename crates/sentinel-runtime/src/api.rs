//! HTTP collaborators
//!
//! The fallback path, message sending, token issuance, and the key registry
//! are plain request/response calls against the deployment's PHP endpoints.
//! Every request carries the shared `X-API-SECRET` header and every response
//! is a JSON object with a `success` flag and an optional `error` string.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use sentinel_core::config::ApiConfig;
use sentinel_core::crypto::PublicKey;
use sentinel_core::errors::FetchError;
use sentinel_core::protocol::{KeyLookup, OutgoingMessage, PresenceEntry, WireMessage};
use sentinel_core::types::{PeerId, RoomKey};

/// Header carrying the shared API secret
pub const API_SECRET_HEADER: &str = "X-API-SECRET";

// ----------------------------------------------------------------------------
// Collaborator Traits
// ----------------------------------------------------------------------------

/// Message store and presence registry
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn fetch_messages(
        &self,
        room: &RoomKey,
        limit: u32,
        include_hidden: bool,
    ) -> Result<Vec<WireMessage>, FetchError>;

    async fn fetch_presence(&self, room: &RoomKey) -> Result<Vec<PresenceEntry>, FetchError>;

    /// Room messages and direct messages share one body shape
    async fn send_message(&self, message: &OutgoingMessage) -> Result<(), FetchError>;

    /// Presence heartbeat used while the live connection is down
    async fn heartbeat(&self, user: &PeerId, room: &RoomKey) -> Result<(), FetchError>;

    /// Short-lived token for the live connection handshake
    async fn issue_token(&self, user: &PeerId) -> Result<String, FetchError>;
}

/// Remote registry of published public keys
#[async_trait]
pub trait KeyRegistry: Send + Sync {
    async fn register_public_key(
        &self,
        user: &PeerId,
        public_key: &PublicKey,
    ) -> Result<(), FetchError>;

    async fn get_public_key(&self, peer: &PeerId) -> Result<KeyLookup, FetchError>;
}

// ----------------------------------------------------------------------------
// Response Bodies
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    messages: Vec<WireMessage>,
}

#[derive(Debug, Deserialize)]
struct PresenceResponse {
    #[serde(default, alias = "presence")]
    users: Vec<PresenceEntry>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

#[derive(Debug, Serialize)]
struct HeartbeatRequest<'a> {
    user_handle: &'a str,
    room_id: &'a str,
    status: &'a str,
}

#[derive(Debug, Serialize)]
struct TokenRequest<'a> {
    user_handle: &'a str,
}

#[derive(Debug, Serialize)]
struct RegisterKeyRequest<'a> {
    user_handle: &'a str,
    public_key: String,
}

/// Unwrap the `{success, error?, ...}` envelope
fn parse_api_response<T: DeserializeOwned>(body: &str) -> Result<T, FetchError> {
    let value: Value =
        serde_json::from_str(body).map_err(|e| FetchError::decode(format!("invalid json: {}", e)))?;

    let success = value.get("success").and_then(Value::as_bool).unwrap_or(false);
    if !success {
        let message = value
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("Unknown error")
            .to_string();
        return Err(FetchError::Api { message });
    }

    serde_json::from_value(value).map_err(|e| FetchError::decode(e.to_string()))
}

// ----------------------------------------------------------------------------
// HTTP Implementation
// ----------------------------------------------------------------------------

/// `ChatApi` and `KeyRegistry` over reqwest
#[derive(Debug, Clone)]
pub struct HttpChatApi {
    client: Client,
    base_url: String,
    api_secret: String,
}

impl HttpChatApi {
    pub fn new(config: &ApiConfig) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| FetchError::http(format!("Failed to build client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            api_secret: config.api_secret.clone(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn execute<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, FetchError> {
        let response = request
            .header(API_SECRET_HEADER, &self.api_secret)
            .send()
            .await
            .map_err(|e| FetchError::http(format!("Request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| FetchError::http(format!("Failed to read body: {}", e)))?;

        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                body,
            });
        }

        parse_api_response(&body)
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, FetchError> {
        let url = self.endpoint(path);
        debug!("GET {}", url);
        self.execute(self.client.get(&url).query(query)).await
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, FetchError> {
        let url = self.endpoint(path);
        debug!("POST {}", url);
        self.execute(self.client.post(&url).json(body)).await
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn fetch_messages(
        &self,
        room: &RoomKey,
        limit: u32,
        include_hidden: bool,
    ) -> Result<Vec<WireMessage>, FetchError> {
        let query = [
            ("room_id", room.as_str().to_string()),
            ("limit", limit.to_string()),
            ("include_hidden", u8::from(include_hidden).to_string()),
        ];
        let response: MessagesResponse = self.get("messages.php", &query).await?;
        Ok(response.messages)
    }

    async fn fetch_presence(&self, room: &RoomKey) -> Result<Vec<PresenceEntry>, FetchError> {
        let query = [("room_id", room.as_str().to_string())];
        let response: PresenceResponse = self.get("presence.php", &query).await?;
        Ok(response.users)
    }

    async fn send_message(&self, message: &OutgoingMessage) -> Result<(), FetchError> {
        let path = if message.is_direct() {
            "im.php"
        } else {
            "messages.php"
        };
        let _: Value = self.post(path, message).await?;
        Ok(())
    }

    async fn heartbeat(&self, user: &PeerId, room: &RoomKey) -> Result<(), FetchError> {
        let body = HeartbeatRequest {
            user_handle: user.as_str(),
            room_id: room.as_str(),
            status: sentinel_core::protocol::STATUS_ONLINE,
        };
        let _: Value = self.post("presence.php", &body).await?;
        Ok(())
    }

    async fn issue_token(&self, user: &PeerId) -> Result<String, FetchError> {
        let body = TokenRequest {
            user_handle: user.as_str(),
        };
        let response: TokenResponse = self.post("websocket-token.php", &body).await?;
        Ok(response.token)
    }
}

#[async_trait]
impl KeyRegistry for HttpChatApi {
    async fn register_public_key(
        &self,
        user: &PeerId,
        public_key: &PublicKey,
    ) -> Result<(), FetchError> {
        let body = RegisterKeyRequest {
            user_handle: user.as_str(),
            public_key: public_key.to_base64(),
        };
        let _: Value = self.post("keys.php", &body).await?;
        Ok(())
    }

    async fn get_public_key(&self, peer: &PeerId) -> Result<KeyLookup, FetchError> {
        let query = [("user_handle", peer.as_str().to_string())];
        self.get("keys.php", &query).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_success_envelope() {
        let body = r#"{"success":true,"messages":[{"id":1,"room_id":"lobby","sender_handle":"a","cipher_blob":"aGk=","created_at":"12"}]}"#;
        let response: MessagesResponse = parse_api_response(body).unwrap();
        assert_eq!(response.messages.len(), 1);
        assert_eq!(response.messages[0].sent_at, 12);
    }

    #[test]
    fn test_parse_failure_envelope() {
        let result: Result<Value, _> =
            parse_api_response(r#"{"success":false,"error":"bad secret"}"#);
        assert_eq!(
            result.unwrap_err(),
            FetchError::Api {
                message: "bad secret".to_string()
            }
        );

        let result: Result<Value, _> = parse_api_response(r#"{"error":"missing flag"}"#);
        assert!(matches!(result, Err(FetchError::Api { .. })));

        let result: Result<Value, _> = parse_api_response("<html>");
        assert!(matches!(result, Err(FetchError::Decode { .. })));
    }

    #[test]
    fn test_key_lookup_shape() {
        let lookup: KeyLookup =
            parse_api_response(r#"{"success":true,"has_key":false}"#).unwrap();
        assert!(!lookup.has_key);
        assert!(lookup.public_key.is_none());
    }

    #[test]
    fn test_endpoint_joins_base_url() {
        let api = HttpChatApi::new(&ApiConfig {
            api_base_url: "http://localhost/iChat/api/".to_string(),
            ..ApiConfig::default()
        })
        .unwrap();
        assert_eq!(
            api.endpoint("messages.php"),
            "http://localhost/iChat/api/messages.php"
        );
    }
}

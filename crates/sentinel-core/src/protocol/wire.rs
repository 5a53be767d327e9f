//! JSON wire format
//!
//! Live frames are JSON objects tagged by `type`. Message payloads delivered
//! over the live connection and over HTTP share the same shape and convert
//! into [`MessageEnvelope`]s through a single path.

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::{decode_bytes, decode_plain_blob, EncryptionKind, MessageEnvelope};
use crate::errors::ProtocolError;
use crate::types::{MessageId, PeerId, RoomKey, Timestamp};

/// `filter_version` stamped on every outgoing message
pub const FILTER_VERSION: u8 = 1;

/// Presence status announced right after a live connection opens
pub const STATUS_ONLINE: &str = "online";

// ----------------------------------------------------------------------------
// Flexible Field Decoding
// ----------------------------------------------------------------------------

/// Accepts `"42"` or `42`
fn id_from_string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(de::Error::custom(format!(
            "expected string or number id, got {}",
            other
        ))),
    }
}

/// Accepts millisecond numbers, numeric strings, or null/absent (0)
fn millis_from_value<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(0),
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().map(|f| f.max(0.0) as u64))
            .ok_or_else(|| de::Error::custom("invalid timestamp")),
        Value::String(s) => s
            .trim()
            .parse::<u64>()
            .map_err(|_| de::Error::custom(format!("invalid timestamp: {}", s))),
        other => Err(de::Error::custom(format!("invalid timestamp: {}", other))),
    }
}

// ----------------------------------------------------------------------------
// Message Payloads
// ----------------------------------------------------------------------------

/// A room message as delivered by `new_message` or the fetch-messages endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(deserialize_with = "id_from_string_or_number")]
    pub id: String,
    pub room_id: String,
    pub sender_handle: String,
    pub cipher_blob: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_kind: Option<String>,
    #[serde(default, alias = "created_at", deserialize_with = "millis_from_value")]
    pub sent_at: u64,
}

impl WireMessage {
    pub fn into_envelope(self) -> Result<MessageEnvelope, ProtocolError> {
        build_envelope(
            self.id,
            RoomKey::new(self.room_id),
            PeerId::new(self.sender_handle),
            &self.cipher_blob,
            self.nonce.as_deref(),
            self.encryption_kind.as_deref(),
            self.sent_at,
        )
    }
}

/// A direct message as delivered by `new_im`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireDirectMessage {
    #[serde(deserialize_with = "id_from_string_or_number")]
    pub id: String,
    pub from_user: String,
    pub to_user: String,
    pub cipher_blob: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_kind: Option<String>,
    #[serde(default, alias = "created_at", deserialize_with = "millis_from_value")]
    pub sent_at: u64,
}

impl WireDirectMessage {
    pub fn into_envelope(self) -> Result<MessageEnvelope, ProtocolError> {
        let from = PeerId::new(self.from_user);
        let to = PeerId::new(self.to_user);
        build_envelope(
            self.id,
            RoomKey::direct(&from, &to),
            from,
            &self.cipher_blob,
            self.nonce.as_deref(),
            self.encryption_kind.as_deref(),
            self.sent_at,
        )
    }
}

fn build_envelope(
    id: String,
    room: RoomKey,
    sender: PeerId,
    cipher_blob: &str,
    nonce: Option<&str>,
    encryption_kind: Option<&str>,
    sent_at: u64,
) -> Result<MessageEnvelope, ProtocolError> {
    let kind = EncryptionKind::parse(encryption_kind.unwrap_or("none"))?;
    let sent_at = Timestamp::new(sent_at);

    match kind {
        EncryptionKind::None => {
            let payload = decode_plain_blob(&id, cipher_blob)?;
            Ok(MessageEnvelope::plain(
                MessageId::new(id),
                room,
                sender,
                payload,
                sent_at,
            ))
        }
        EncryptionKind::Asymmetric => {
            let nonce = nonce.ok_or_else(|| {
                ProtocolError::malformed_payload(&id, "asymmetric message without nonce")
            })?;
            let nonce = decode_bytes(&id, "nonce", nonce)?;
            let cipher_payload = decode_bytes(&id, "cipher_blob", cipher_blob)?;
            Ok(MessageEnvelope::asymmetric(
                MessageId::new(id),
                room,
                sender,
                cipher_payload,
                nonce,
                sent_at,
            ))
        }
    }
}

// ----------------------------------------------------------------------------
// Inbound Frames
// ----------------------------------------------------------------------------

/// Frames the server pushes over the live connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_handle: Option<String>,
    },
    RoomJoined {
        room_id: String,
    },
    NewMessage {
        message: WireMessage,
    },
    PresenceUpdate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
    },
    NewIm {
        im: WireDirectMessage,
    },
    ImDelivered {
        #[serde(deserialize_with = "id_from_string_or_number")]
        im_id: String,
        to_user: String,
    },
    Pong,
    Error {
        #[serde(default)]
        message: String,
    },
}

impl ServerMessage {
    /// Every `type` value this client understands
    pub const KNOWN_KINDS: &'static [&'static str] = &[
        "connected",
        "room_joined",
        "new_message",
        "presence_update",
        "new_im",
        "im_delivered",
        "pong",
        "error",
    ];
}

/// A decoded inbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Known(ServerMessage),
    /// A well-formed frame whose `type` is not recognized
    Unknown { kind: String },
}

/// Decode one text or binary frame
pub fn decode_frame(bytes: &[u8]) -> Result<InboundFrame, ProtocolError> {
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|e| ProtocolError::malformed_frame(format!("invalid json: {}", e)))?;

    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| ProtocolError::malformed_frame("missing type field"))?
        .to_string();

    if !ServerMessage::KNOWN_KINDS.contains(&kind.as_str()) {
        return Ok(InboundFrame::Unknown { kind });
    }

    serde_json::from_value(value)
        .map(InboundFrame::Known)
        .map_err(|e| ProtocolError::malformed_frame(format!("{} frame: {}", kind, e)))
}

// ----------------------------------------------------------------------------
// Outbound Frames
// ----------------------------------------------------------------------------

/// Control frames the client sends over the live connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    PresenceUpdate { status: String },
    JoinRoom { room_id: String },
    LeaveRoom {},
    Ping,
}

impl ClientMessage {
    pub fn online() -> Self {
        ClientMessage::PresenceUpdate {
            status: STATUS_ONLINE.to_string(),
        }
    }

    pub fn join_room(room: &RoomKey) -> Self {
        ClientMessage::JoinRoom {
            room_id: room.as_str().to_string(),
        }
    }

    /// Serialize to the JSON text sent on the socket
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::PresenceUpdate { .. } => "presence_update",
            ClientMessage::JoinRoom { .. } => "join_room",
            ClientMessage::LeaveRoom {} => "leave_room",
            ClientMessage::Ping => "ping",
        }
    }
}

// ----------------------------------------------------------------------------
// HTTP Payloads
// ----------------------------------------------------------------------------

/// Body of the send-message request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_user: Option<String>,
    pub sender_handle: String,
    pub cipher_blob: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    pub encryption_kind: EncryptionKind,
    pub filter_version: u8,
}

impl OutgoingMessage {
    pub fn is_direct(&self) -> bool {
        self.to_user.is_some()
    }
}

/// One entry of the fetch-presence response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub user_handle: String,
    #[serde(default)]
    pub status: String,
    #[serde(default, deserialize_with = "millis_from_value")]
    pub last_seen: u64,
}

/// Response of the get-public-key endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyLookup {
    pub has_key: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

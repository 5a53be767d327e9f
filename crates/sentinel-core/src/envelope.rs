//! Message envelopes
//!
//! An envelope is the transport-level unit delivered by either the live
//! connection or the fallback poller. Both paths produce the same shape so
//! de-duplication in the router is uniform.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};

use crate::errors::ProtocolError;
use crate::types::{MessageId, PeerId, RoomKey, Timestamp};

// ----------------------------------------------------------------------------
// Encryption Kind
// ----------------------------------------------------------------------------

/// How an envelope's payload is encoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionKind {
    /// Explicitly unencrypted transport encoding. Never box-decrypted.
    None,
    /// Authenticated box encryption between sender and recipient
    Asymmetric,
}

impl EncryptionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EncryptionKind::None => "none",
            EncryptionKind::Asymmetric => "asymmetric",
        }
    }

    pub fn parse(kind: &str) -> Result<Self, ProtocolError> {
        match kind {
            "none" | "" => Ok(EncryptionKind::None),
            "asymmetric" => Ok(EncryptionKind::Asymmetric),
            other => Err(ProtocolError::UnknownEncryptionKind {
                kind: other.to_string(),
            }),
        }
    }
}

// ----------------------------------------------------------------------------
// Envelope
// ----------------------------------------------------------------------------

/// One received message, immutable once constructed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEnvelope {
    id: MessageId,
    room: RoomKey,
    sender: PeerId,
    cipher_payload: Vec<u8>,
    nonce: Option<Vec<u8>>,
    encryption_kind: EncryptionKind,
    sent_at: Timestamp,
}

impl MessageEnvelope {
    /// Build an unencrypted envelope. `payload` holds the decoded transport
    /// bytes (see [`decode_plain_payload`]).
    pub fn plain(
        id: MessageId,
        room: RoomKey,
        sender: PeerId,
        payload: Vec<u8>,
        sent_at: Timestamp,
    ) -> Self {
        Self {
            id,
            room,
            sender,
            cipher_payload: payload,
            nonce: None,
            encryption_kind: EncryptionKind::None,
            sent_at,
        }
    }

    /// Build a box-encrypted envelope
    pub fn asymmetric(
        id: MessageId,
        room: RoomKey,
        sender: PeerId,
        cipher_payload: Vec<u8>,
        nonce: Vec<u8>,
        sent_at: Timestamp,
    ) -> Self {
        Self {
            id,
            room,
            sender,
            cipher_payload,
            nonce: Some(nonce),
            encryption_kind: EncryptionKind::Asymmetric,
            sent_at,
        }
    }

    pub fn id(&self) -> &MessageId {
        &self.id
    }

    pub fn room(&self) -> &RoomKey {
        &self.room
    }

    pub fn sender(&self) -> &PeerId {
        &self.sender
    }

    pub fn cipher_payload(&self) -> &[u8] {
        &self.cipher_payload
    }

    pub fn nonce(&self) -> Option<&[u8]> {
        self.nonce.as_deref()
    }

    pub fn encryption_kind(&self) -> EncryptionKind {
        self.encryption_kind
    }

    pub fn sent_at(&self) -> Timestamp {
        self.sent_at
    }
}

// ----------------------------------------------------------------------------
// Unencrypted Transport Encoding
// ----------------------------------------------------------------------------

/// Encode text for a None-kind `cipher_blob`: `base64(rawurlencode(text))`
pub fn encode_plain_blob(text: &str) -> String {
    BASE64.encode(urlencoding::encode(text).as_bytes())
}

/// Strip the base64 layer of a None-kind `cipher_blob`
pub fn decode_plain_blob(message_id: &str, blob: &str) -> Result<Vec<u8>, ProtocolError> {
    BASE64
        .decode(blob.trim())
        .map_err(|e| ProtocolError::malformed_payload(message_id, format!("invalid base64: {}", e)))
}

/// Recover the text from the bytes produced by [`decode_plain_blob`]
pub fn decode_plain_payload(message_id: &str, payload: &[u8]) -> Result<String, ProtocolError> {
    let encoded = std::str::from_utf8(payload)
        .map_err(|_| ProtocolError::malformed_payload(message_id, "payload is not utf-8"))?;
    urlencoding::decode(encoded)
        .map(|text| text.into_owned())
        .map_err(|_| ProtocolError::malformed_payload(message_id, "invalid percent-encoding"))
}

/// Base64 encoding used for ciphertext and nonces on the wire
pub fn encode_bytes(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

pub fn decode_bytes(
    message_id: &str,
    field: &str,
    encoded: &str,
) -> Result<Vec<u8>, ProtocolError> {
    BASE64.decode(encoded.trim()).map_err(|e| {
        ProtocolError::malformed_payload(message_id, format!("invalid base64 in {}: {}", field, e))
    })
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_blob_matches_deployment_encoding() {
        // base64("hello%20world%21")
        assert_eq!(encode_plain_blob("hello world!"), "aGVsbG8lMjB3b3JsZCUyMQ==");

        let payload = decode_plain_blob("m1", "aGVsbG8lMjB3b3JsZCUyMQ==").unwrap();
        assert_eq!(decode_plain_payload("m1", &payload).unwrap(), "hello world!");
    }

    #[test]
    fn test_plain_blob_handles_unicode() {
        let blob = encode_plain_blob("héllo ✓");
        let payload = decode_plain_blob("m2", &blob).unwrap();
        assert_eq!(decode_plain_payload("m2", &payload).unwrap(), "héllo ✓");
    }

    #[test]
    fn test_bad_blob_is_protocol_error() {
        assert!(matches!(
            decode_plain_blob("m3", "!!!"),
            Err(ProtocolError::MalformedPayload { .. })
        ));
        assert!(decode_plain_payload("m3", &[0xff, 0xfe]).is_err());
    }

    #[test]
    fn test_encryption_kind_parse() {
        assert_eq!(EncryptionKind::parse("none").unwrap(), EncryptionKind::None);
        assert_eq!(EncryptionKind::parse("").unwrap(), EncryptionKind::None);
        assert_eq!(
            EncryptionKind::parse("asymmetric").unwrap(),
            EncryptionKind::Asymmetric
        );
        assert!(EncryptionKind::parse("rot13").is_err());
    }

    #[test]
    fn test_envelope_constructors_tag_kind() {
        let plain = MessageEnvelope::plain(
            MessageId::new("1"),
            RoomKey::new("lobby"),
            PeerId::new("alice"),
            b"hi".to_vec(),
            Timestamp::new(10),
        );
        assert_eq!(plain.encryption_kind(), EncryptionKind::None);
        assert!(plain.nonce().is_none());

        let sealed = MessageEnvelope::asymmetric(
            MessageId::new("2"),
            RoomKey::new("im:alice:bob"),
            PeerId::new("alice"),
            vec![1, 2, 3],
            vec![0; 24],
            Timestamp::new(11),
        );
        assert_eq!(sealed.encryption_kind(), EncryptionKind::Asymmetric);
        assert_eq!(sealed.nonce().map(|n| n.len()), Some(24));
    }
}

//! Error types for the Sentinel transport core
//!
//! This module contains the error taxonomy used throughout the client core:
//! transport errors recovered by reconnect/backoff, cryptographic errors that
//! degrade to "unreadable"/"unencrypted" states, transient fetch errors from the
//! polling path, protocol errors for malformed frames, and the `SentinelError`
//! type that unifies them all.

use crate::protocol::StateTransitionError;

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Live connection failures. Recovered locally via reconnect with backoff.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Connection to {endpoint} failed: {reason}")]
    ConnectFailed { endpoint: String, reason: String },
    #[error("Connect attempt timed out after {duration_ms}ms")]
    ConnectTimeout { duration_ms: u64 },
    #[error("Connection closed abnormally (code {code}): {reason}")]
    AbnormalClose { code: u16, reason: String },
    #[error("No heartbeat reply within {duration_ms}ms")]
    HeartbeatTimeout { duration_ms: u64 },
    #[error("Send failed: {reason}")]
    Send { reason: String },
    #[error("Transport shutdown: {reason}")]
    Shutdown { reason: String },
}

/// Cryptographic failures. Never fatal to message ingestion.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptographicError {
    #[error("Decryption failed")]
    DecryptionFailed,
    #[error("Encryption failed")]
    EncryptionFailed,
    #[error("No public key available for peer {peer_id}")]
    KeyUnavailable { peer_id: String },
    #[error("Invalid key format: {reason}")]
    InvalidKeyFormat { reason: String },
    #[error("Key store error: {reason}")]
    KeyStore { reason: String },
}

/// Request/response failures on the HTTP collaborators. Retried, never escalated.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("HTTP request failed: {reason}")]
    Http { reason: String },
    #[error("Unexpected HTTP status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("API returned an error: {message}")]
    Api { message: String },
    #[error("Could not decode response: {reason}")]
    Decode { reason: String },
}

/// Malformed frames or payloads received from the server.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Malformed frame: {reason}")]
    MalformedFrame { reason: String },
    #[error("Malformed payload in message {message_id}: {reason}")]
    MalformedPayload { message_id: String, reason: String },
    #[error("Unknown encryption kind: {kind}")]
    UnknownEncryptionKind { kind: String },
}

// ----------------------------------------------------------------------------
// Unified Error
// ----------------------------------------------------------------------------

/// Core error type for the Sentinel client
#[derive(Debug, thiserror::Error)]
pub enum SentinelError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Cryptographic error: {0}")]
    Crypto(#[from] CryptographicError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("State transition error: {0}")]
    StateTransition(#[from] StateTransitionError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    /// Channel communication error between tasks
    #[error("Channel error: {message}")]
    Channel { message: String },
}

// ----------------------------------------------------------------------------
// Convenience Error Constructors
// ----------------------------------------------------------------------------

impl TransportError {
    /// Create a connect failure for an endpoint
    pub fn connect_failed<E: Into<String>, R: Into<String>>(endpoint: E, reason: R) -> Self {
        TransportError::ConnectFailed {
            endpoint: endpoint.into(),
            reason: reason.into(),
        }
    }

    /// Create a send failure
    pub fn send_failed<R: Into<String>>(reason: R) -> Self {
        TransportError::Send {
            reason: reason.into(),
        }
    }
}

impl CryptographicError {
    /// Create a key-unavailable error for a peer
    pub fn key_unavailable<P: Into<String>>(peer_id: P) -> Self {
        CryptographicError::KeyUnavailable {
            peer_id: peer_id.into(),
        }
    }

    /// Create an invalid key format error
    pub fn invalid_key<R: Into<String>>(reason: R) -> Self {
        CryptographicError::InvalidKeyFormat {
            reason: reason.into(),
        }
    }

    /// Create a key store error
    pub fn key_store<R: Into<String>>(reason: R) -> Self {
        CryptographicError::KeyStore {
            reason: reason.into(),
        }
    }
}

impl FetchError {
    /// Create an HTTP transport failure
    pub fn http<R: Into<String>>(reason: R) -> Self {
        FetchError::Http {
            reason: reason.into(),
        }
    }

    /// Create a decode failure
    pub fn decode<R: Into<String>>(reason: R) -> Self {
        FetchError::Decode {
            reason: reason.into(),
        }
    }
}

impl ProtocolError {
    /// Create a malformed frame error
    pub fn malformed_frame<R: Into<String>>(reason: R) -> Self {
        ProtocolError::MalformedFrame {
            reason: reason.into(),
        }
    }

    /// Create a malformed payload error
    pub fn malformed_payload<M: Into<String>, R: Into<String>>(message_id: M, reason: R) -> Self {
        ProtocolError::MalformedPayload {
            message_id: message_id.into(),
            reason: reason.into(),
        }
    }
}

impl SentinelError {
    /// Create a configuration error with a reason
    pub fn config_error<T: Into<String>>(reason: T) -> Self {
        SentinelError::Configuration {
            reason: reason.into(),
        }
    }

    /// Create a channel error with a message
    pub fn channel_error<T: Into<String>>(message: T) -> Self {
        SentinelError::Channel {
            message: message.into(),
        }
    }

    /// Whether this error is recovered locally without user involvement
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, SentinelError::Configuration { .. })
    }
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type Result<T> = core::result::Result<T, SentinelError>;
pub type SentinelResult<T> = Result<T>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TransportError::AbnormalClose {
            code: 1006,
            reason: "reset".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Connection closed abnormally (code 1006): reset"
        );

        let err: SentinelError = CryptographicError::key_unavailable("bob").into();
        assert_eq!(
            err.to_string(),
            "Cryptographic error: No public key available for peer bob"
        );
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(SentinelError::from(FetchError::http("offline")).is_recoverable());
        assert!(SentinelError::from(CryptographicError::DecryptionFailed).is_recoverable());
        assert!(!SentinelError::config_error("bad").is_recoverable());
    }
}

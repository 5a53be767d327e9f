//! X25519 key pairs
//!
//! The local key pair is generated once per device and persisted through a
//! [`crate::keystore::KeyStore`]. Only the public half ever leaves the device.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use core::fmt;
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::StaticSecret;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::errors::CryptographicError;

/// Length in bytes of an X25519 public or private key
pub const PUBLIC_KEY_LEN: usize = 32;

// ----------------------------------------------------------------------------
// Public Key
// ----------------------------------------------------------------------------

/// A peer's (or our own) X25519 public key
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; PUBLIC_KEY_LEN]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse from a byte slice of exactly 32 bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptographicError> {
        let array: [u8; PUBLIC_KEY_LEN] = bytes.try_into().map_err(|_| {
            CryptographicError::invalid_key(format!(
                "public key must be {} bytes, got {}",
                PUBLIC_KEY_LEN,
                bytes.len()
            ))
        })?;
        Ok(Self(array))
    }

    /// Parse the base64 form published in the key registry
    pub fn from_base64(encoded: &str) -> Result<Self, CryptographicError> {
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|e| CryptographicError::invalid_key(format!("invalid base64: {}", e)))?;
        Self::from_slice(&bytes)
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.0
    }

    /// Short hex fingerprint for logs
    pub fn fingerprint(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.fingerprint())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

// ----------------------------------------------------------------------------
// Key Pair
// ----------------------------------------------------------------------------

/// Local asymmetric key pair. The private half is wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyPair {
    #[zeroize(skip)]
    public_key: PublicKey,
    private_key: [u8; PUBLIC_KEY_LEN],
}

impl KeyPair {
    /// Generate a fresh key pair from OS entropy
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        Self::from_secret(secret)
    }

    /// Rebuild a key pair from persisted private key bytes
    pub fn from_private_bytes(private_key: [u8; PUBLIC_KEY_LEN]) -> Self {
        Self::from_secret(StaticSecret::from(private_key))
    }

    fn from_secret(secret: StaticSecret) -> Self {
        let public = x25519_dalek::PublicKey::from(&secret);
        Self {
            public_key: PublicKey(public.to_bytes()),
            private_key: secret.to_bytes(),
        }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub(crate) fn secret(&self) -> StaticSecret {
        StaticSecret::from(self.private_key)
    }

    /// Encode for persistence. Only key stores should call this.
    pub fn to_stored(&self) -> StoredKeyPair {
        StoredKeyPair {
            public_key: self.public_key.to_base64(),
            private_key: BASE64.encode(self.private_key),
        }
    }

    /// Decode a persisted key pair, checking that the halves match
    pub fn from_stored(stored: &StoredKeyPair) -> Result<Self, CryptographicError> {
        let mut private = BASE64
            .decode(stored.private_key.trim())
            .map_err(|e| CryptographicError::invalid_key(format!("invalid base64: {}", e)))?;
        let bytes: [u8; PUBLIC_KEY_LEN] = private.as_slice().try_into().map_err(|_| {
            CryptographicError::invalid_key("private key must be 32 bytes")
        })?;
        private.zeroize();

        let pair = Self::from_private_bytes(bytes);
        let expected = PublicKey::from_base64(&stored.public_key)?;
        if pair.public_key != expected {
            return Err(CryptographicError::invalid_key(
                "stored public key does not match private key",
            ));
        }
        Ok(pair)
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// Serialized form of a key pair as written by key stores
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct StoredKeyPair {
    pub public_key: String,
    pub private_key: String,
}

impl fmt::Debug for StoredKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredKeyPair")
            .field("public_key", &self.public_key)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_pairs_differ() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        assert_ne!(a.public_key(), b.public_key());
    }

    #[test]
    fn test_stored_roundtrip_preserves_public_key() {
        let pair = KeyPair::generate();
        let restored = KeyPair::from_stored(&pair.to_stored()).unwrap();
        assert_eq!(restored.public_key(), pair.public_key());
    }

    #[test]
    fn test_mismatched_stored_halves_rejected() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        let mut stored = a.to_stored();
        stored.public_key = b.public_key().to_base64();

        assert!(matches!(
            KeyPair::from_stored(&stored),
            Err(CryptographicError::InvalidKeyFormat { .. })
        ));
    }

    #[test]
    fn test_public_key_length_checked() {
        assert!(PublicKey::from_slice(&[0u8; 31]).is_err());
        assert!(PublicKey::from_base64("not base64!").is_err());
    }

    #[test]
    fn test_debug_redacts_private_key() {
        let pair = KeyPair::generate();
        let rendered = format!("{:?}", pair);
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains(&BASE64.encode(pair.private_key)));
    }
}

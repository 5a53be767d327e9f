//! Authenticated public-key box encryption
//!
//! X25519 Diffie-Hellman between the local private key and the peer's public
//! key, expanded with HKDF-SHA256 into a symmetric key for XChaCha20-Poly1305.
//! The HKDF info binds both public keys in sorted order so sender and
//! recipient derive the same key.
//!
//! Nonces are 192-bit and drawn from OS entropy inside [`seal`]. Callers can
//! never supply one for encryption.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use rand_core::{OsRng, RngCore};
use sha2::Sha256;
use x25519_dalek::PublicKey as DalekPublicKey;
use zeroize::Zeroizing;

use super::keys::{KeyPair, PublicKey};
use crate::errors::CryptographicError;

/// Length in bytes of an XChaCha20-Poly1305 nonce
pub const NONCE_LEN: usize = 24;

const BOX_KEY_INFO: &[u8] = b"sentinel-box-v1";

// ----------------------------------------------------------------------------
// Nonce
// ----------------------------------------------------------------------------

/// 192-bit nonce attached to every asymmetric envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoxNonce([u8; NONCE_LEN]);

impl BoxNonce {
    fn generate() -> Self {
        let mut bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Parse a received nonce. Wrong lengths are reported as a decryption
    /// failure since the envelope can't be opened either way.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptographicError> {
        let array: [u8; NONCE_LEN] = bytes
            .try_into()
            .map_err(|_| CryptographicError::DecryptionFailed)?;
        Ok(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; NONCE_LEN] {
        &self.0
    }
}

/// Output of [`seal`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedPayload {
    /// Ciphertext with the 16-byte Poly1305 tag appended
    pub cipher_payload: Vec<u8>,
    pub nonce: BoxNonce,
}

// ----------------------------------------------------------------------------
// Seal / Open
// ----------------------------------------------------------------------------

/// Encrypt `plaintext` for `peer` under a freshly generated nonce
pub fn seal(
    local: &KeyPair,
    peer: &PublicKey,
    plaintext: &[u8],
) -> Result<SealedPayload, CryptographicError> {
    let key = derive_box_key(local, peer).ok_or(CryptographicError::EncryptionFailed)?;
    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key[..]));
    let nonce = BoxNonce::generate();

    let cipher_payload = cipher
        .encrypt(XNonce::from_slice(nonce.as_bytes()), plaintext)
        .map_err(|_| CryptographicError::EncryptionFailed)?;

    Ok(SealedPayload {
        cipher_payload,
        nonce,
    })
}

/// Decrypt a payload sealed by `peer` for the local key pair.
///
/// Any failure (wrong key, tampered ciphertext, bad nonce) yields
/// [`CryptographicError::DecryptionFailed`].
pub fn open(
    local: &KeyPair,
    peer: &PublicKey,
    cipher_payload: &[u8],
    nonce: &[u8],
) -> Result<Vec<u8>, CryptographicError> {
    let nonce = BoxNonce::from_slice(nonce)?;
    let key = derive_box_key(local, peer).ok_or(CryptographicError::DecryptionFailed)?;
    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key[..]));

    cipher
        .decrypt(XNonce::from_slice(nonce.as_bytes()), cipher_payload)
        .map_err(|_| CryptographicError::DecryptionFailed)
}

/// Returns `None` for non-contributory (low-order) peer keys
fn derive_box_key(local: &KeyPair, peer: &PublicKey) -> Option<Zeroizing<[u8; 32]>> {
    let shared = local
        .secret()
        .diffie_hellman(&DalekPublicKey::from(*peer.as_bytes()));
    if !shared.was_contributory() {
        return None;
    }

    let ours = local.public_key().as_bytes();
    let theirs = peer.as_bytes();
    let (first, second) = if ours <= theirs {
        (ours, theirs)
    } else {
        (theirs, ours)
    };

    let mut info = Vec::with_capacity(BOX_KEY_INFO.len() + 64);
    info.extend_from_slice(BOX_KEY_INFO);
    info.extend_from_slice(first);
    info.extend_from_slice(second);

    let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
    let mut okm = Zeroizing::new([0u8; 32]);
    hk.expand(&info, &mut okm[..]).ok()?;
    Some(okm)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

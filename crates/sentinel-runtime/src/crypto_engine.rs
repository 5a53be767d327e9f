//! Crypto Engine
//!
//! Holds the local key pair, publishes its public half, resolves peer keys
//! through a cache backed by the key registry, and turns plaintext into wire
//! payloads and back. It keeps no connection state, so encryption and
//! decryption can run alongside transport I/O.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use sentinel_core::config::CryptoConfig;
use sentinel_core::crypto::{self, KeyPair, PublicKey, SealedPayload};
use sentinel_core::envelope::{
    decode_plain_payload, encode_bytes, encode_plain_blob, EncryptionKind, MessageEnvelope,
};
use sentinel_core::errors::{CryptographicError, FetchError};
use sentinel_core::keystore::KeyStore;
use sentinel_core::peer_cache::{PeerKeyCache, PeerKeyCacheStats};
use sentinel_core::types::{PeerId, SystemTimeSource, TimeSource};

use crate::api::KeyRegistry;

/// Encoded payload ready for the send-message body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingPayload {
    pub cipher_blob: String,
    pub nonce: Option<String>,
    pub encryption_kind: EncryptionKind,
}

impl OutgoingPayload {
    /// Explicitly unencrypted transport encoding
    pub fn plain(text: &str) -> Self {
        Self {
            cipher_blob: encode_plain_blob(text),
            nonce: None,
            encryption_kind: EncryptionKind::None,
        }
    }

    fn sealed(sealed: &SealedPayload) -> Self {
        Self {
            cipher_blob: encode_bytes(&sealed.cipher_payload),
            nonce: Some(encode_bytes(sealed.nonce.as_bytes())),
            encryption_kind: EncryptionKind::Asymmetric,
        }
    }
}

// ----------------------------------------------------------------------------
// Crypto Engine
// ----------------------------------------------------------------------------

pub struct CryptoEngine {
    local_user: PeerId,
    config: CryptoConfig,
    key_store: Arc<dyn KeyStore>,
    registry: Arc<dyn KeyRegistry>,
    key_pair: Mutex<Option<Arc<KeyPair>>>,
    registered: AtomicBool,
    peer_cache: Mutex<PeerKeyCache>,
    time_source: Arc<dyn TimeSource>,
}

impl CryptoEngine {
    pub fn new(
        local_user: PeerId,
        config: CryptoConfig,
        key_store: Arc<dyn KeyStore>,
        registry: Arc<dyn KeyRegistry>,
    ) -> Self {
        let peer_cache = PeerKeyCache::new(config.peer_key_max_age_ms);
        Self {
            local_user,
            config,
            key_store,
            registry,
            key_pair: Mutex::new(None),
            registered: AtomicBool::new(false),
            peer_cache: Mutex::new(peer_cache),
            time_source: Arc::new(SystemTimeSource),
        }
    }

    /// Replace the clock used for peer key expiry
    pub fn with_time_source(mut self, time_source: Arc<dyn TimeSource>) -> Self {
        self.time_source = time_source;
        self
    }

    pub fn local_user(&self) -> &PeerId {
        &self.local_user
    }

    /// Load the persisted key pair, generating and saving one if none exists.
    /// Repeated calls return the same pair.
    pub fn ensure_key_pair(&self) -> Result<Arc<KeyPair>, CryptographicError> {
        let mut slot = self
            .key_pair
            .lock()
            .map_err(|_| CryptographicError::key_store("key pair lock poisoned"))?;
        if let Some(pair) = slot.as_ref() {
            return Ok(Arc::clone(pair));
        }

        let pair = match self.key_store.load()? {
            Some(pair) => {
                debug!("Loaded key pair {:?}", pair.public_key());
                pair
            }
            None => {
                let pair = KeyPair::generate();
                self.key_store.save(&pair)?;
                info!(
                    key_id = %self.config.key_store_id,
                    "Generated new key pair {}",
                    pair.public_key().fingerprint()
                );
                pair
            }
        };

        let pair = Arc::new(pair);
        *slot = Some(Arc::clone(&pair));
        Ok(pair)
    }

    pub fn public_key(&self) -> Result<PublicKey, CryptographicError> {
        Ok(*self.ensure_key_pair()?.public_key())
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    /// Publish the local public key. Failure leaves the key unregistered so
    /// the next send retries.
    pub async fn register_public_key(&self) -> Result<(), FetchError> {
        let public_key = self
            .public_key()
            .map_err(|e| FetchError::http(format!("no local key pair: {}", e)))?;

        match self
            .registry
            .register_public_key(&self.local_user, &public_key)
            .await
        {
            Ok(()) => {
                self.registered.store(true, Ordering::SeqCst);
                info!("Registered public key {}", public_key.fingerprint());
                Ok(())
            }
            Err(e) => {
                warn!("Public key registration failed: {}", e);
                Err(e)
            }
        }
    }

    /// Retry registration if an earlier attempt failed
    pub async fn ensure_registered(&self) {
        if !self.is_registered() {
            let _ = self.register_public_key().await;
        }
    }

    /// Cached key if fresh, otherwise ask the registry. `None` means the
    /// peer has no usable published key or the registry is unreachable.
    pub async fn resolve_peer_key(&self, peer: &PeerId) -> Option<PublicKey> {
        let now = self.time_source.now();
        if let Some(key) = self.with_cache(|cache| cache.get(peer, now)).flatten() {
            return Some(key);
        }

        let lookup = match self.registry.get_public_key(peer).await {
            Ok(lookup) => lookup,
            Err(e) => {
                warn!("Key lookup for {} failed: {}", peer, e);
                return None;
            }
        };

        let encoded = match (lookup.has_key, lookup.public_key) {
            (true, Some(encoded)) => encoded,
            _ => {
                debug!("{} has no published key", peer);
                return None;
            }
        };

        match PublicKey::from_base64(&encoded) {
            Ok(key) => {
                self.with_cache(|cache| cache.insert(peer.clone(), key, self.time_source.now()));
                Some(key)
            }
            Err(e) => {
                warn!("Registry returned an invalid key for {}: {}", peer, e);
                None
            }
        }
    }

    /// Seal `plaintext` for `peer_key` under a fresh internal nonce
    pub fn encrypt(
        &self,
        plaintext: &[u8],
        peer_key: &PublicKey,
    ) -> Result<SealedPayload, CryptographicError> {
        let pair = self.ensure_key_pair()?;
        crypto::seal(&pair, peer_key, plaintext)
    }

    pub fn decrypt(
        &self,
        cipher_payload: &[u8],
        nonce: &[u8],
        peer_key: &PublicKey,
    ) -> Result<Vec<u8>, CryptographicError> {
        let pair = self.ensure_key_pair()?;
        crypto::open(&pair, peer_key, cipher_payload, nonce)
    }

    /// Encode a direct message for `peer`, degrading to the unencrypted
    /// encoding when the peer has no key and the policy allows it
    pub async fn seal_for_peer(
        &self,
        peer: &PeerId,
        text: &str,
    ) -> Result<OutgoingPayload, CryptographicError> {
        self.ensure_key_pair()?;
        self.ensure_registered().await;

        match self.resolve_peer_key(peer).await {
            Some(peer_key) => {
                let sealed = self.encrypt(text.as_bytes(), &peer_key)?;
                Ok(OutgoingPayload::sealed(&sealed))
            }
            None if self.config.allow_unencrypted_fallback => {
                warn!("No public key for {}; sending unencrypted", peer);
                Ok(OutgoingPayload::plain(text))
            }
            None => Err(CryptographicError::key_unavailable(peer.as_str())),
        }
    }

    /// Recover the text of a received envelope.
    ///
    /// Asymmetric envelopes are opened with the sender's key, or with the
    /// other participant's key for our own direct messages echoed back.
    pub async fn open_envelope(
        &self,
        envelope: &MessageEnvelope,
    ) -> Result<String, CryptographicError> {
        if envelope.encryption_kind() == EncryptionKind::None {
            return decode_plain_payload(envelope.id().as_str(), envelope.cipher_payload())
                .map_err(|_| CryptographicError::DecryptionFailed);
        }

        let peer = if envelope.sender() == &self.local_user {
            envelope
                .room()
                .counterpart(&self.local_user)
                .ok_or(CryptographicError::DecryptionFailed)?
        } else {
            envelope.sender().clone()
        };

        let peer_key = self
            .resolve_peer_key(&peer)
            .await
            .ok_or_else(|| CryptographicError::key_unavailable(peer.as_str()))?;
        let nonce = envelope.nonce().ok_or(CryptographicError::DecryptionFailed)?;

        let plaintext = match self.decrypt(envelope.cipher_payload(), nonce, &peer_key) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                // The peer may have rotated keys; refetch next time
                self.with_cache(|cache| cache.invalidate(&peer));
                return Err(e);
            }
        };

        String::from_utf8(plaintext).map_err(|_| CryptographicError::DecryptionFailed)
    }

    pub fn peer_cache_stats(&self) -> PeerKeyCacheStats {
        self.with_cache(|cache| cache.stats()).unwrap_or_default()
    }

    fn with_cache<R>(&self, f: impl FnOnce(&mut PeerKeyCache) -> R) -> Option<R> {
        match self.peer_cache.lock() {
            Ok(mut cache) => Some(f(&mut cache)),
            Err(_) => {
                warn!("Peer key cache lock poisoned");
                None
            }
        }
    }
}

impl std::fmt::Debug for CryptoEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoEngine")
            .field("local_user", &self.local_user)
            .field("registered", &self.is_registered())
            .finish()
    }
}

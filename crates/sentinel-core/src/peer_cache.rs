//! Cache of peer public keys fetched from the key registry

use std::collections::HashMap;

use crate::crypto::PublicKey;
use crate::types::{PeerId, Timestamp};

/// Default lifetime of a cached key: one hour
pub const DEFAULT_PEER_KEY_MAX_AGE_MS: u64 = 60 * 60 * 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedPeerKey {
    pub peer_id: PeerId,
    pub public_key: PublicKey,
    pub fetched_at: Timestamp,
}

/// Peer keys keyed by handle, with lazy expiry
#[derive(Debug, Clone)]
pub struct PeerKeyCache {
    entries: HashMap<PeerId, CachedPeerKey>,
    max_age_ms: u64,
    stats: PeerKeyCacheStats,
}

impl PeerKeyCache {
    pub fn new(max_age_ms: u64) -> Self {
        Self {
            entries: HashMap::new(),
            max_age_ms,
            stats: PeerKeyCacheStats::default(),
        }
    }

    /// Look up a fresh key. Expired entries are dropped and count as a miss.
    pub fn get(&mut self, peer_id: &PeerId, now: Timestamp) -> Option<PublicKey> {
        let fresh = match self.entries.get(peer_id) {
            Some(entry) => {
                now.as_millis().saturating_sub(entry.fetched_at.as_millis()) <= self.max_age_ms
            }
            None => {
                self.stats.misses += 1;
                return None;
            }
        };

        if fresh {
            self.stats.hits += 1;
            self.entries.get(peer_id).map(|entry| entry.public_key)
        } else {
            self.entries.remove(peer_id);
            self.stats.evictions += 1;
            self.stats.misses += 1;
            None
        }
    }

    pub fn insert(&mut self, peer_id: PeerId, public_key: PublicKey, now: Timestamp) {
        self.entries.insert(
            peer_id.clone(),
            CachedPeerKey {
                peer_id,
                public_key,
                fetched_at: now,
            },
        );
    }

    /// Forget a peer's key, e.g. after a decryption failure suggests rotation
    pub fn invalidate(&mut self, peer_id: &PeerId) -> bool {
        self.entries.remove(peer_id).is_some()
    }

    /// Drop every expired entry
    pub fn cleanup(&mut self, now: Timestamp) -> usize {
        let cutoff = now.as_millis().saturating_sub(self.max_age_ms);
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| entry.fetched_at.as_millis() >= cutoff);
        let removed = before - self.entries.len();
        self.stats.evictions += removed as u64;
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> PeerKeyCacheStats {
        self.stats
    }
}

impl Default for PeerKeyCache {
    fn default() -> Self {
        Self::new(DEFAULT_PEER_KEY_MAX_AGE_MS)
    }
}

// ----------------------------------------------------------------------------
// Statistics
// ----------------------------------------------------------------------------

/// Statistics about the peer key cache
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerKeyCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

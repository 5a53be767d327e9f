//! Core types for the Sentinel client
//!
//! Newtypes for identifiers that flow through the transport and router, plus
//! the millisecond timestamp and time-source abstraction used by the state
//! machine and caches.

use core::fmt;
use core::ops::{Add, Sub};
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Message Identifier
// ----------------------------------------------------------------------------

/// Server-assigned identity of an envelope. Used for de-duplication.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }

    /// Generate a random identifier for locally created envelopes
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

// ----------------------------------------------------------------------------
// Peer Identifier
// ----------------------------------------------------------------------------

/// A user's public handle. Peers are addressed and looked up in the key
/// registry by handle.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new<S: Into<String>>(handle: S) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

// ----------------------------------------------------------------------------
// Room / Conversation Key
// ----------------------------------------------------------------------------

/// Prefix marking a two-party direct conversation key
pub const DIRECT_CONVERSATION_PREFIX: &str = "im:";

/// Key of a room or of a direct conversation between two peers
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomKey(String);

impl RoomKey {
    pub fn new<S: Into<String>>(key: S) -> Self {
        Self(key.into())
    }

    /// Conversation key shared by both parties of a direct conversation.
    ///
    /// Handles are sorted so `direct(a, b) == direct(b, a)`.
    pub fn direct(a: &PeerId, b: &PeerId) -> Self {
        let (first, second) = if a <= b { (a, b) } else { (b, a) };
        Self(format!("{}{}:{}", DIRECT_CONVERSATION_PREFIX, first, second))
    }

    pub fn is_direct(&self) -> bool {
        self.0.starts_with(DIRECT_CONVERSATION_PREFIX)
    }

    /// The other participant of a direct conversation that includes `local`
    pub fn counterpart(&self, local: &PeerId) -> Option<PeerId> {
        let (first, second) = self
            .0
            .strip_prefix(DIRECT_CONVERSATION_PREFIX)?
            .split_once(':')?;
        if first == local.as_str() {
            Some(PeerId::new(second))
        } else if second == local.as_str() {
            Some(PeerId::new(first))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

// ----------------------------------------------------------------------------
// Timestamp
// ----------------------------------------------------------------------------

/// Millisecond timestamp since Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Add<u64> for Timestamp {
    type Output = Timestamp;

    fn add(self, other: u64) -> Timestamp {
        Timestamp(self.0.saturating_add(other))
    }
}

impl Sub for Timestamp {
    type Output = u64;

    fn sub(self, other: Timestamp) -> u64 {
        self.0.saturating_sub(other.0)
    }
}

impl Timestamp {
    /// Create a new timestamp
    pub fn new(millis: u64) -> Self {
        Self(millis)
    }

    /// Get current wall-clock timestamp
    pub fn now() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_millis() as u64)
    }

    /// Get the raw milliseconds
    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Get duration since another timestamp
    pub fn duration_since(&self, other: Self) -> core::time::Duration {
        core::time::Duration::from_millis(self.0.saturating_sub(other.0))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

// ----------------------------------------------------------------------------
// Time Source Trait
// ----------------------------------------------------------------------------

/// Source of timestamps, injected so caches and the state machine can be
/// driven by a mock clock in tests.
pub trait TimeSource: Send + Sync {
    /// Get the current timestamp
    fn now(&self) -> Timestamp;
}

/// Wall-clock implementation of TimeSource
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl SystemTimeSource {
    pub fn new() -> Self {
        Self
    }
}

impl TimeSource for SystemTimeSource {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_key_is_symmetric() {
        let alice = PeerId::new("alice");
        let bob = PeerId::new("bob");

        let key = RoomKey::direct(&alice, &bob);
        assert_eq!(key, RoomKey::direct(&bob, &alice));
        assert_eq!(key.as_str(), "im:alice:bob");
        assert!(key.is_direct());
        assert!(!RoomKey::new("lobby").is_direct());

        assert_eq!(key.counterpart(&alice), Some(bob.clone()));
        assert_eq!(key.counterpart(&bob), Some(alice));
        assert_eq!(key.counterpart(&PeerId::new("carol")), None);
        assert_eq!(RoomKey::new("lobby").counterpart(&bob), None);
    }

    #[test]
    fn test_timestamp_arithmetic() {
        let t = Timestamp::new(1_000);
        assert_eq!((t + 500).as_millis(), 1_500);
        assert_eq!(Timestamp::new(1_500) - t, 500);
        assert_eq!(t - Timestamp::new(1_500), 0);
        assert_eq!(Timestamp::new(3_000).duration_since(t).as_millis(), 2_000);
    }

    #[test]
    fn test_identifier_serialization_is_transparent() {
        let id = MessageId::new("m1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"m1\"");
        let peer: PeerId = serde_json::from_str("\"carol\"").unwrap();
        assert_eq!(peer.as_str(), "carol");
    }

    #[test]
    fn test_generated_ids_are_unique() {
        assert_ne!(MessageId::generate(), MessageId::generate());
    }
}

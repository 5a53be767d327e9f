//! Message Router
//!
//! Single ingestion point for envelopes from the live connection and the
//! fallback poller. Ingestion is serialized behind one lock. An id is marked
//! seen in the same step that publishes its event, so an envelope delivered
//! by both paths reaches consumers exactly once. Asymmetric envelopes that
//! cannot be opened become visible `Unreadable` events rather than
//! disappearing.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

use sentinel_core::dedup::SeenMessageSet;
use sentinel_core::envelope::{EncryptionKind, MessageEnvelope};
use sentinel_core::protocol::PresenceEntry;
use sentinel_core::types::{MessageId, PeerId, RoomKey, Timestamp};

use crate::crypto_engine::CryptoEngine;

/// Buffered routed events per subscriber
pub const ROUTED_EVENT_CAPACITY: usize = 256;

// ----------------------------------------------------------------------------
// Routed Events
// ----------------------------------------------------------------------------

/// A readable message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedMessage {
    pub id: MessageId,
    pub room: RoomKey,
    pub sender: PeerId,
    pub text: String,
    /// `None` marks a message that travelled unencrypted
    pub encryption: EncryptionKind,
    pub sent_at: Timestamp,
}

/// Events delivered to consumers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutedEvent {
    Message(RoutedMessage),
    /// Placeholder for a message that could not be decrypted or decoded
    Unreadable {
        id: MessageId,
        room: RoomKey,
        sender: PeerId,
        sent_at: Timestamp,
        reason: String,
    },
    /// The server confirmed delivery of one of our direct messages
    DirectDelivered { im_id: String, to_user: PeerId },
    Presence {
        room: RoomKey,
        users: Vec<PresenceEntry>,
    },
}

/// What happened to one ingested envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Delivered,
    Duplicate,
    Unreadable,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub ingested: u64,
    pub duplicates: u64,
    pub unreadable: u64,
    pub unencrypted: u64,
    /// Envelopes older than the newest already routed in their room
    pub out_of_order: u64,
}

// ----------------------------------------------------------------------------
// Router
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct RouterState {
    seen: SeenMessageSet,
    newest_per_room: HashMap<RoomKey, Timestamp>,
    stats: RouterStats,
}

#[derive(Debug)]
pub struct MessageRouter {
    crypto: Arc<CryptoEngine>,
    state: Mutex<RouterState>,
    events: broadcast::Sender<RoutedEvent>,
}

impl MessageRouter {
    pub fn new(crypto: Arc<CryptoEngine>, seen_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(ROUTED_EVENT_CAPACITY);
        Self {
            crypto,
            state: Mutex::new(RouterState {
                seen: SeenMessageSet::new(seen_capacity),
                newest_per_room: HashMap::new(),
                stats: RouterStats::default(),
            }),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoutedEvent> {
        self.events.subscribe()
    }

    /// Route one envelope from an ordered source
    pub async fn ingest(&self, envelope: MessageEnvelope) -> IngestOutcome {
        let mut state = self.state.lock().await;
        self.ingest_locked(&mut state, envelope).await
    }

    /// Route a polled batch in `sent_at` order. The whole batch is ingested
    /// without interleaving live deliveries.
    pub async fn ingest_batch(&self, mut envelopes: Vec<MessageEnvelope>) -> Vec<IngestOutcome> {
        envelopes.sort_by_key(|envelope| envelope.sent_at());

        let mut state = self.state.lock().await;
        let mut outcomes = Vec::with_capacity(envelopes.len());
        for envelope in envelopes {
            outcomes.push(self.ingest_locked(&mut state, envelope).await);
        }
        outcomes
    }

    async fn ingest_locked(
        &self,
        state: &mut RouterState,
        envelope: MessageEnvelope,
    ) -> IngestOutcome {
        if state.seen.contains(envelope.id()) {
            state.stats.duplicates += 1;
            debug!("Dropping duplicate message {}", envelope.id());
            return IngestOutcome::Duplicate;
        }

        // Opening may wait on the key registry. Nothing is recorded until it
        // returns, so a cancelled ingest leaves the id unseen.
        let opened = self.crypto.open_envelope(&envelope).await;

        let sent_at = envelope.sent_at();
        let (event, outcome) = match opened {
            Ok(text) => {
                if envelope.encryption_kind() == EncryptionKind::None {
                    state.stats.unencrypted += 1;
                }
                let message = RoutedMessage {
                    id: envelope.id().clone(),
                    room: envelope.room().clone(),
                    sender: envelope.sender().clone(),
                    text,
                    encryption: envelope.encryption_kind(),
                    sent_at,
                };
                (RoutedEvent::Message(message), IngestOutcome::Delivered)
            }
            Err(e) => {
                state.stats.unreadable += 1;
                warn!(
                    "Message {} from {} is unreadable: {}",
                    envelope.id(),
                    envelope.sender(),
                    e
                );
                let event = RoutedEvent::Unreadable {
                    id: envelope.id().clone(),
                    room: envelope.room().clone(),
                    sender: envelope.sender().clone(),
                    sent_at,
                    reason: e.to_string(),
                };
                (event, IngestOutcome::Unreadable)
            }
        };

        state.seen.insert(envelope.id().clone());
        state.stats.ingested += 1;
        match state.newest_per_room.get_mut(envelope.room()) {
            Some(newest) if sent_at < *newest => state.stats.out_of_order += 1,
            Some(newest) => *newest = sent_at,
            None => {
                state
                    .newest_per_room
                    .insert(envelope.room().clone(), sent_at);
            }
        }

        self.publish(event);
        outcome
    }

    pub fn publish_delivered(&self, im_id: String, to_user: PeerId) {
        self.publish(RoutedEvent::DirectDelivered { im_id, to_user });
    }

    pub fn publish_presence(&self, room: RoomKey, users: Vec<PresenceEntry>) {
        self.publish(RoutedEvent::Presence { room, users });
    }

    pub async fn stats(&self) -> RouterStats {
        self.state.lock().await.stats
    }

    fn publish(&self, event: RoutedEvent) {
        if self.events.send(event).is_err() {
            debug!("No routed event subscribers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use sentinel_core::config::CryptoConfig;
    use sentinel_core::crypto::{self, KeyPair, PublicKey};
    use sentinel_core::errors::FetchError;
    use sentinel_core::keystore::MemoryKeyStore;
    use sentinel_core::protocol::KeyLookup;

    use crate::api::KeyRegistry;

    /// Registry holding one key and answering after `delay`
    struct SlowRegistry {
        peer: PeerId,
        key: PublicKey,
        delay: Duration,
    }

    #[async_trait]
    impl KeyRegistry for SlowRegistry {
        async fn register_public_key(
            &self,
            _user: &PeerId,
            _public_key: &PublicKey,
        ) -> Result<(), FetchError> {
            Ok(())
        }

        async fn get_public_key(&self, peer: &PeerId) -> Result<KeyLookup, FetchError> {
            tokio::time::sleep(self.delay).await;
            let found = *peer == self.peer;
            Ok(KeyLookup {
                has_key: found,
                public_key: found.then(|| self.key.to_base64()),
            })
        }
    }

    fn router_for(local: &KeyPair, peer: &KeyPair, delay: Duration) -> MessageRouter {
        let registry = Arc::new(SlowRegistry {
            peer: PeerId::new("bob"),
            key: *peer.public_key(),
            delay,
        });
        let crypto = CryptoEngine::new(
            PeerId::new("alice"),
            CryptoConfig::default(),
            Arc::new(MemoryKeyStore::with_key_pair(local)),
            registry,
        );
        MessageRouter::new(Arc::new(crypto), 50)
    }

    fn plain(id: &str, text: &str, sent_at: u64) -> MessageEnvelope {
        MessageEnvelope::plain(
            MessageId::new(id),
            RoomKey::new("lobby"),
            PeerId::new("bob"),
            text.as_bytes().to_vec(),
            Timestamp::new(sent_at),
        )
    }

    #[tokio::test]
    async fn test_batch_is_routed_in_sent_order() {
        let router = router_for(&KeyPair::generate(), &KeyPair::generate(), Duration::ZERO);
        let mut events = router.subscribe();

        let outcomes = router
            .ingest_batch(vec![
                plain("p3", "third", 3_000),
                plain("p1", "first", 1_000),
                plain("p2", "second", 2_000),
            ])
            .await;
        assert_eq!(outcomes, vec![IngestOutcome::Delivered; 3]);

        let mut routed = Vec::new();
        while let Ok(RoutedEvent::Message(message)) = events.try_recv() {
            routed.push((message.id.as_str().to_string(), message.text));
        }
        assert_eq!(
            routed,
            vec![
                ("p1".to_string(), "first".to_string()),
                ("p2".to_string(), "second".to_string()),
                ("p3".to_string(), "third".to_string()),
            ]
        );

        let stats = router.stats().await;
        assert_eq!(stats.ingested, 3);
        assert_eq!(stats.unencrypted, 3);
        assert_eq!(stats.out_of_order, 0);
    }

    #[tokio::test]
    async fn test_duplicate_within_batch_is_routed_once() {
        let router = router_for(&KeyPair::generate(), &KeyPair::generate(), Duration::ZERO);
        let mut events = router.subscribe();

        let outcomes = router
            .ingest_batch(vec![plain("m1", "hi", 1_000), plain("m1", "hi", 1_000)])
            .await;
        assert_eq!(
            outcomes,
            vec![IngestOutcome::Delivered, IngestOutcome::Duplicate]
        );
        assert!(matches!(events.try_recv(), Ok(RoutedEvent::Message(_))));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_ingest_leaves_message_unseen() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let router = Arc::new(router_for(&alice, &bob, Duration::from_secs(3)));
        let mut events = router.subscribe();

        let sealed = crypto::seal(&bob, alice.public_key(), b"still here").unwrap();
        let envelope = MessageEnvelope::asymmetric(
            MessageId::new("m1"),
            RoomKey::direct(&PeerId::new("alice"), &PeerId::new("bob")),
            PeerId::new("bob"),
            sealed.cipher_payload.clone(),
            sealed.nonce.as_bytes().to_vec(),
            Timestamp::new(1_000),
        );

        // Cancelled while the sender's key is still being looked up
        let pending = tokio::spawn({
            let router = Arc::clone(&router);
            let envelope = envelope.clone();
            async move { router.ingest(envelope).await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        pending.abort();
        assert!(pending.await.is_err());
        assert_eq!(router.stats().await.ingested, 0);
        assert!(events.try_recv().is_err());

        // The next delivery of the same id is routed
        assert_eq!(
            router.ingest(envelope.clone()).await,
            IngestOutcome::Delivered
        );
        match events.try_recv() {
            Ok(RoutedEvent::Message(message)) => {
                assert_eq!(message.id.as_str(), "m1");
                assert_eq!(message.text, "still here");
                assert_eq!(message.encryption, EncryptionKind::Asymmetric);
            }
            other => panic!("expected routed message, got {:?}", other),
        }
        assert_eq!(router.ingest(envelope).await, IngestOutcome::Duplicate);

        let stats = router.stats().await;
        assert_eq!(stats.ingested, 1);
        assert_eq!(stats.duplicates, 1);
    }
}

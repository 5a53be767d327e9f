//! Fallback Poller
//!
//! Approximates live delivery with periodic fetches while the live connection
//! is unavailable. The connection manager is the only caller of
//! [`FallbackPoller::activate`] and [`FallbackPoller::deactivate`]; the poller
//! never toggles itself. A failed fetch is logged and the timer keeps running.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use sentinel_core::config::PollerConfig;
use sentinel_core::envelope::MessageEnvelope;
use sentinel_core::types::{PeerId, RoomKey};

use crate::api::ChatApi;
use crate::router::MessageRouter;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollerStats {
    pub activations: u64,
    pub ticks: u64,
    /// Individual fetch or heartbeat calls that failed
    pub failures: u64,
    pub envelopes_forwarded: u64,
}

struct PollerInner {
    api: Arc<dyn ChatApi>,
    router: Arc<MessageRouter>,
    user: PeerId,
    room: watch::Receiver<RoomKey>,
    config: PollerConfig,
    stats: Mutex<PollerStats>,
}

impl PollerInner {
    fn record(&self, f: impl FnOnce(&mut PollerStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            f(&mut stats);
        }
    }

    async fn tick(&self) {
        let room = self.room.borrow().clone();
        debug!("Poll tick for {}", room);

        match self
            .api
            .fetch_messages(&room, self.config.fetch_limit, self.config.include_hidden)
            .await
        {
            Ok(messages) => {
                let envelopes: Vec<MessageEnvelope> = messages
                    .into_iter()
                    .filter_map(|message| match message.into_envelope() {
                        Ok(envelope) => Some(envelope),
                        Err(e) => {
                            warn!("Skipping polled message: {}", e);
                            None
                        }
                    })
                    .collect();
                let forwarded = envelopes.len() as u64;
                self.router.ingest_batch(envelopes).await;
                self.record(|stats| stats.envelopes_forwarded += forwarded);
            }
            Err(e) => {
                warn!("Polling messages for {} failed: {}", room, e);
                self.record(|stats| stats.failures += 1);
            }
        }

        match self.api.fetch_presence(&room).await {
            Ok(users) => self.router.publish_presence(room.clone(), users),
            Err(e) => {
                warn!("Polling presence for {} failed: {}", room, e);
                self.record(|stats| stats.failures += 1);
            }
        }

        if let Err(e) = self.api.heartbeat(&self.user, &room).await {
            warn!("Presence heartbeat failed: {}", e);
            self.record(|stats| stats.failures += 1);
        }

        self.record(|stats| stats.ticks += 1);
    }
}

// ----------------------------------------------------------------------------
// Poller
// ----------------------------------------------------------------------------

pub struct FallbackPoller {
    inner: Arc<PollerInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl FallbackPoller {
    /// `room` follows the room the session is joined to
    pub fn new(
        api: Arc<dyn ChatApi>,
        router: Arc<MessageRouter>,
        user: PeerId,
        room: watch::Receiver<RoomKey>,
        config: PollerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(PollerInner {
                api,
                router,
                user,
                room,
                config,
                stats: Mutex::new(PollerStats::default()),
            }),
            task: Mutex::new(None),
        }
    }

    pub fn default_interval(&self) -> Duration {
        self.inner.config.interval()
    }

    /// Start polling every `interval`, beginning immediately. Returns `false`
    /// if already active.
    pub fn activate(&self, interval: Duration) -> bool {
        let Ok(mut task) = self.task.lock() else {
            return false;
        };
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return false;
        }

        let inner = Arc::clone(&self.inner);
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                inner.tick().await;
            }
        }));

        self.inner.record(|stats| stats.activations += 1);
        info!("Fallback polling active every {}ms", interval.as_millis());
        true
    }

    /// Stop polling. Returns `false` if already inactive.
    pub fn deactivate(&self) -> bool {
        let handle = match self.task.lock() {
            Ok(mut task) => task.take(),
            Err(_) => None,
        };
        match handle {
            Some(handle) => {
                handle.abort();
                info!("Fallback polling stopped");
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.task
            .lock()
            .map(|task| task.as_ref().is_some_and(|handle| !handle.is_finished()))
            .unwrap_or(false)
    }

    /// Run one fetch cycle immediately
    pub async fn tick(&self) {
        self.inner.tick().await;
    }

    pub fn stats(&self) -> PollerStats {
        self.inner
            .stats
            .lock()
            .map(|stats| *stats)
            .unwrap_or_default()
    }
}

impl Drop for FallbackPoller {
    fn drop(&mut self) {
        self.deactivate();
    }
}

impl std::fmt::Debug for FallbackPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackPoller")
            .field("active", &self.is_active())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use sentinel_core::config::CryptoConfig;
    use sentinel_core::crypto::PublicKey;
    use sentinel_core::envelope::encode_plain_blob;
    use sentinel_core::errors::FetchError;
    use sentinel_core::keystore::MemoryKeyStore;
    use sentinel_core::protocol::{KeyLookup, OutgoingMessage, PresenceEntry, WireMessage};

    use crate::api::KeyRegistry;
    use crate::crypto_engine::CryptoEngine;
    use crate::router::RoutedEvent;

    /// Message fetches fail until `failures_left` runs out; presence always fails
    #[derive(Default)]
    struct FlakyApi {
        failures_left: AtomicUsize,
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl ChatApi for FlakyApi {
        async fn fetch_messages(
            &self,
            room: &RoomKey,
            _limit: u32,
            _include_hidden: bool,
        ) -> Result<Vec<WireMessage>, FetchError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let failing = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(FetchError::http("connection reset"));
            }
            Ok(vec![WireMessage {
                id: "m1".to_string(),
                room_id: room.as_str().to_string(),
                sender_handle: "bob".to_string(),
                cipher_blob: encode_plain_blob("back online"),
                nonce: None,
                encryption_kind: None,
                sent_at: 1_000,
            }])
        }

        async fn fetch_presence(&self, _room: &RoomKey) -> Result<Vec<PresenceEntry>, FetchError> {
            Err(FetchError::http("presence unavailable"))
        }

        async fn send_message(&self, _message: &OutgoingMessage) -> Result<(), FetchError> {
            Ok(())
        }

        async fn heartbeat(&self, _user: &PeerId, _room: &RoomKey) -> Result<(), FetchError> {
            Ok(())
        }

        async fn issue_token(&self, _user: &PeerId) -> Result<String, FetchError> {
            Ok(String::new())
        }
    }

    #[async_trait]
    impl KeyRegistry for FlakyApi {
        async fn register_public_key(
            &self,
            _user: &PeerId,
            _public_key: &PublicKey,
        ) -> Result<(), FetchError> {
            Ok(())
        }

        async fn get_public_key(&self, _peer: &PeerId) -> Result<KeyLookup, FetchError> {
            Ok(KeyLookup {
                has_key: false,
                public_key: None,
            })
        }
    }

    fn poller_with(api: Arc<FlakyApi>) -> (FallbackPoller, Arc<MessageRouter>) {
        let crypto = CryptoEngine::new(
            PeerId::new("alice"),
            CryptoConfig::default(),
            Arc::new(MemoryKeyStore::new()),
            api.clone(),
        );
        let router = Arc::new(MessageRouter::new(Arc::new(crypto), 50));
        let (_room_tx, room_rx) = watch::channel(RoomKey::new("lobby"));
        let config = PollerConfig {
            interval_ms: 100,
            ..PollerConfig::default()
        };
        let poller = FallbackPoller::new(
            api,
            Arc::clone(&router),
            PeerId::new("alice"),
            room_rx,
            config,
        );
        (poller, router)
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_fetches_do_not_stop_the_timer() {
        let api = Arc::new(FlakyApi::default());
        api.failures_left.store(3, Ordering::SeqCst);
        let (poller, router) = poller_with(Arc::clone(&api));
        let mut events = router.subscribe();

        assert!(poller.activate(poller.default_interval()));
        assert!(!poller.activate(poller.default_interval()));

        tokio::time::sleep(Duration::from_millis(450)).await;
        assert!(poller.is_active());
        assert!(api.fetches.load(Ordering::SeqCst) >= 5);

        let stats = poller.stats();
        assert!(stats.ticks >= 5);
        // Three failed message fetches plus one failed presence fetch per tick
        assert_eq!(stats.failures, 3 + stats.ticks);
        assert_eq!(stats.activations, 1);

        // The first successful fetch is routed; later ones are duplicates
        let mut routed = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let RoutedEvent::Message(message) = event {
                routed.push(message.text);
            }
        }
        assert_eq!(routed, vec!["back online".to_string()]);

        assert!(poller.deactivate());
        assert!(!poller.deactivate());
        let fetches = api.fetches.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(api.fetches.load(Ordering::SeqCst), fetches);
        assert!(!poller.is_active());
    }
}

//! Session Builder API
//!
//! Wires the crypto engine, router, poller and connection manager into one
//! [`ChatSession`]. Consumers (the CLI, tests) pick collaborators through
//! [`SessionBuilder`]; anything left unset gets the production default.

use std::sync::Arc;

use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use sentinel_core::config::SentinelConfig;
use sentinel_core::envelope::EncryptionKind;
use sentinel_core::errors::{SentinelError, SentinelResult};
use sentinel_core::keystore::{KeyStore, MemoryKeyStore};
use sentinel_core::peer_cache::PeerKeyCacheStats;
use sentinel_core::protocol::{ConnectionState, ConnectionStats, OutgoingMessage, FILTER_VERSION};
use sentinel_core::types::{PeerId, RoomKey, TimeSource};

use crate::api::{ChatApi, HttpChatApi, KeyRegistry};
use crate::connection::{ConnectionHandle, ConnectionManager, SessionEvent};
use crate::crypto_engine::{CryptoEngine, OutgoingPayload};
use crate::poller::{FallbackPoller, PollerStats};
use crate::router::{MessageRouter, RoutedEvent, RouterStats};
use crate::socket::{SocketConnector, WsConnector};

/// Room joined when none is given
pub const DEFAULT_ROOM: &str = "lobby";

// ----------------------------------------------------------------------------
// Session Builder
// ----------------------------------------------------------------------------

pub struct SessionBuilder {
    user: PeerId,
    config: SentinelConfig,
    connector: Option<Arc<dyn SocketConnector>>,
    api: Option<Arc<dyn ChatApi>>,
    registry: Option<Arc<dyn KeyRegistry>>,
    key_store: Option<Arc<dyn KeyStore>>,
    time_source: Option<Arc<dyn TimeSource>>,
}

impl SessionBuilder {
    pub fn new(user: PeerId) -> Self {
        Self {
            user,
            config: SentinelConfig::default(),
            connector: None,
            api: None,
            registry: None,
            key_store: None,
            time_source: None,
        }
    }

    pub fn with_config(mut self, config: SentinelConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the websocket connector
    pub fn with_connector(mut self, connector: Arc<dyn SocketConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Replace the HTTP chat API
    pub fn with_api(mut self, api: Arc<dyn ChatApi>) -> Self {
        self.api = Some(api);
        self
    }

    /// Replace the public key registry
    pub fn with_registry(mut self, registry: Arc<dyn KeyRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Where the local key pair persists. Defaults to memory only.
    pub fn with_key_store(mut self, key_store: Arc<dyn KeyStore>) -> Self {
        self.key_store = Some(key_store);
        self
    }

    /// Clock for peer key expiry
    pub fn with_time_source(mut self, time_source: Arc<dyn TimeSource>) -> Self {
        self.time_source = Some(time_source);
        self
    }

    /// Validate the configuration and start the connection manager.
    ///
    /// Must be called from within a Tokio runtime. The session starts
    /// Disconnected; nothing touches the network until [`ChatSession::start`]
    /// or [`ChatSession::connect`].
    pub fn build(self) -> SentinelResult<ChatSession> {
        self.config.validate()?;

        let (api, registry) = match (self.api, self.registry) {
            (Some(api), Some(registry)) => (api, registry),
            (api, registry) => {
                let http = Arc::new(HttpChatApi::new(&self.config.api)?);
                (
                    api.unwrap_or_else(|| http.clone() as Arc<dyn ChatApi>),
                    registry.unwrap_or_else(|| http as Arc<dyn KeyRegistry>),
                )
            }
        };
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(WsConnector::new()) as Arc<dyn SocketConnector>);
        let key_store = self
            .key_store
            .unwrap_or_else(|| Arc::new(MemoryKeyStore::new()) as Arc<dyn KeyStore>);

        let mut crypto = CryptoEngine::new(
            self.user.clone(),
            self.config.crypto.clone(),
            key_store,
            registry,
        );
        if let Some(time_source) = self.time_source {
            crypto = crypto.with_time_source(time_source);
        }
        let crypto = Arc::new(crypto);

        let router = Arc::new(MessageRouter::new(
            Arc::clone(&crypto),
            self.config.router.seen_capacity,
        ));

        let (room_tx, room_rx) = watch::channel(RoomKey::new(DEFAULT_ROOM));
        let poller = Arc::new(FallbackPoller::new(
            Arc::clone(&api),
            Arc::clone(&router),
            self.user.clone(),
            room_rx,
            self.config.poller.clone(),
        ));

        let manager = ConnectionManager {
            user: self.user.clone(),
            config: self.config.connection.clone(),
            connector,
            api: Arc::clone(&api),
            router: Arc::clone(&router),
            poller: Arc::clone(&poller),
            room_tx,
        };
        let (connection, task) = manager.spawn();

        info!("Session ready for {}", self.user);

        Ok(ChatSession {
            user: self.user,
            api,
            crypto,
            router,
            poller,
            connection,
            task: Mutex::new(Some(task)),
        })
    }
}

// ----------------------------------------------------------------------------
// Chat Session
// ----------------------------------------------------------------------------

/// A running client session
pub struct ChatSession {
    user: PeerId,
    api: Arc<dyn ChatApi>,
    crypto: Arc<CryptoEngine>,
    router: Arc<MessageRouter>,
    poller: Arc<FallbackPoller>,
    connection: ConnectionHandle,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ChatSession {
    pub fn builder(user: PeerId) -> SessionBuilder {
        SessionBuilder::new(user)
    }

    pub fn user(&self) -> &PeerId {
        &self.user
    }

    /// Prepare the local identity and connect to `room`. A failed key
    /// registration is retried on the next direct message.
    pub async fn start(&self, room: RoomKey) -> SentinelResult<()> {
        self.crypto.ensure_key_pair()?;
        if let Err(e) = self.crypto.register_public_key().await {
            warn!("Continuing without a registered key: {}", e);
        }
        self.connect(room)
    }

    pub fn connect(&self, room: RoomKey) -> SentinelResult<()> {
        self.connection.connect(room)
    }

    pub fn disconnect(&self) -> SentinelResult<()> {
        self.connection.disconnect()
    }

    pub fn switch_room(&self, room: RoomKey) -> SentinelResult<()> {
        self.connection.switch_room(room)
    }

    pub fn set_visibility(&self, visible: bool) -> SentinelResult<()> {
        self.connection.set_visibility(visible)
    }

    /// Send a room message. Room messages have no single recipient key and
    /// always travel unencrypted.
    pub async fn send_room_message(&self, room: &RoomKey, text: &str) -> SentinelResult<()> {
        let payload = OutgoingPayload::plain(text);
        let message = OutgoingMessage {
            room_id: Some(room.as_str().to_string()),
            to_user: None,
            sender_handle: self.user.as_str().to_string(),
            cipher_blob: payload.cipher_blob,
            nonce: payload.nonce,
            encryption_kind: payload.encryption_kind,
            filter_version: FILTER_VERSION,
        };
        self.api.send_message(&message).await?;
        Ok(())
    }

    /// Send a direct message, sealed for `peer` when it has a published key.
    /// Returns the encryption actually applied.
    pub async fn send_direct_message(
        &self,
        peer: &PeerId,
        text: &str,
    ) -> SentinelResult<EncryptionKind> {
        let payload = self.crypto.seal_for_peer(peer, text).await?;
        let kind = payload.encryption_kind;
        let message = OutgoingMessage {
            room_id: None,
            to_user: Some(peer.as_str().to_string()),
            sender_handle: self.user.as_str().to_string(),
            cipher_blob: payload.cipher_blob,
            nonce: payload.nonce,
            encryption_kind: kind,
            filter_version: FILTER_VERSION,
        };
        self.api.send_message(&message).await?;
        Ok(kind)
    }

    pub fn subscribe_routed(&self) -> broadcast::Receiver<RoutedEvent> {
        self.router.subscribe()
    }

    pub fn subscribe_session(&self) -> broadcast::Receiver<SessionEvent> {
        self.connection.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.watch_state()
    }

    pub fn poller_active(&self) -> bool {
        self.poller.is_active()
    }

    pub fn crypto(&self) -> &Arc<CryptoEngine> {
        &self.crypto
    }

    pub fn connection_stats(&self) -> ConnectionStats {
        self.connection.statistics()
    }

    pub fn poller_stats(&self) -> PollerStats {
        self.poller.stats()
    }

    pub async fn router_stats(&self) -> RouterStats {
        self.router.stats().await
    }

    pub fn peer_key_stats(&self) -> PeerKeyCacheStats {
        self.crypto.peer_cache_stats()
    }

    /// Disconnect and wait for the connection manager to stop
    pub async fn shutdown(&self) -> SentinelResult<()> {
        let Some(task) = self.task.lock().await.take() else {
            return Ok(());
        };
        self.connection.shutdown()?;
        task.await
            .map_err(|e| SentinelError::channel_error(format!("connection manager task: {}", e)))?;
        info!("Session for {} shut down", self.user);
        Ok(())
    }
}

impl std::fmt::Debug for ChatSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatSession")
            .field("user", &self.user)
            .field("state", &self.state())
            .field("poller_active", &self.poller_active())
            .finish()
    }
}

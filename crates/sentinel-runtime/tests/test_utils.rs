//! Shared mocks for runtime integration tests
//!
//! `MockConnector` stands in for the websocket and lets a test close the
//! current connection or push server frames into it. `MockApi` implements
//! both HTTP collaborator traits against in-memory state.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;

use sentinel_core::crypto::PublicKey;
use sentinel_core::errors::{FetchError, TransportError};
use sentinel_core::protocol::{
    ClientMessage, ConnectionState, KeyLookup, OutgoingMessage, PresenceEntry, WireMessage,
};
use sentinel_core::types::{PeerId, RoomKey};
use sentinel_core::SentinelConfig;
use sentinel_runtime::{
    ChatApi, ChatSession, HandshakeRequest, KeyRegistry, RoutedEvent, RoutedMessage,
    SocketCommand, SocketConnector, SocketEvent, SocketHandle,
};

// ----------------------------------------------------------------------------
// Mock Connector
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Accept,
    Refuse,
    /// Stall for a minute before accepting
    Hang,
}

#[derive(Default)]
struct ConnectorState {
    outcomes: VecDeque<ConnectOutcome>,
    attempts: Vec<(Instant, HandshakeRequest)>,
    links: Vec<mpsc::UnboundedSender<SocketEvent>>,
}

/// Socket connector that accepts unless told otherwise
pub struct MockConnector {
    state: Mutex<ConnectorState>,
    frames: Arc<Mutex<Vec<String>>>,
    auto_pong: Arc<AtomicBool>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ConnectorState::default()),
            frames: Arc::new(Mutex::new(Vec::new())),
            auto_pong: Arc::new(AtomicBool::new(true)),
        })
    }

    /// Outcomes for the next attempts, in order; later attempts are accepted
    pub fn with_outcomes(outcomes: &[ConnectOutcome]) -> Arc<Self> {
        let connector = Self::new();
        connector
            .state
            .lock()
            .unwrap()
            .outcomes
            .extend(outcomes.iter().copied());
        connector
    }

    pub fn set_auto_pong(&self, enabled: bool) {
        self.auto_pong.store(enabled, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.state.lock().unwrap().attempts.len()
    }

    /// Connections that were accepted, including abandoned ones
    pub fn link_count(&self) -> usize {
        self.state.lock().unwrap().links.len()
    }

    pub fn connect_times(&self) -> Vec<Instant> {
        self.state
            .lock()
            .unwrap()
            .attempts
            .iter()
            .map(|(at, _)| *at)
            .collect()
    }

    pub fn last_request(&self) -> Option<HandshakeRequest> {
        self.state
            .lock()
            .unwrap()
            .attempts
            .last()
            .map(|(_, request)| request.clone())
    }

    /// Every frame the client wrote, across all connections
    pub fn sent_frames(&self) -> Vec<ClientMessage> {
        self.frames
            .lock()
            .unwrap()
            .iter()
            .filter_map(|text| serde_json::from_str(text).ok())
            .collect()
    }

    /// Close the most recent connection from the server side
    pub fn close_current(&self, code: u16, reason: &str) {
        let state = self.state.lock().unwrap();
        let link = state.links.last().expect("no connection to close");
        let _ = link.send(SocketEvent::Closed {
            code,
            reason: reason.to_string(),
        });
    }

    /// Deliver a server frame on the most recent connection
    pub fn push_frame(&self, frame: Value) {
        let state = self.state.lock().unwrap();
        let link = state.links.last().expect("no connection to push to");
        let _ = link.send(SocketEvent::Message(frame.to_string().into_bytes()));
    }
}

#[async_trait]
impl SocketConnector for MockConnector {
    async fn connect(
        &self,
        request: &HandshakeRequest,
        events: mpsc::UnboundedSender<SocketEvent>,
    ) -> Result<SocketHandle, TransportError> {
        let outcome = {
            let mut state = self.state.lock().unwrap();
            state.attempts.push((Instant::now(), request.clone()));
            state.outcomes.pop_front().unwrap_or(ConnectOutcome::Accept)
        };

        match outcome {
            ConnectOutcome::Refuse => {
                return Err(TransportError::connect_failed(
                    &request.ws_url,
                    "connection refused",
                ));
            }
            ConnectOutcome::Hang => tokio::time::sleep(Duration::from_secs(60)).await,
            ConnectOutcome::Accept => {}
        }

        let (handle, mut commands) = SocketHandle::channel();
        self.state.lock().unwrap().links.push(events.clone());

        let frames = Arc::clone(&self.frames);
        let auto_pong = Arc::clone(&self.auto_pong);
        tokio::spawn(async move {
            while let Some(command) = commands.recv().await {
                match command {
                    SocketCommand::Send(text) => {
                        let is_ping = matches!(
                            serde_json::from_str::<ClientMessage>(&text),
                            Ok(ClientMessage::Ping)
                        );
                        frames.lock().unwrap().push(text);
                        if is_ping && auto_pong.load(Ordering::SeqCst) {
                            let _ = events.send(SocketEvent::Message(
                                br#"{"type":"pong"}"#.to_vec(),
                            ));
                        }
                    }
                    SocketCommand::Close { code } => {
                        let _ = events.send(SocketEvent::Closed {
                            code,
                            reason: String::new(),
                        });
                        break;
                    }
                }
            }
        });

        Ok(handle)
    }
}

// ----------------------------------------------------------------------------
// Mock API
// ----------------------------------------------------------------------------

/// In-memory message store, presence registry and key registry
#[derive(Default)]
pub struct MockApi {
    messages: Mutex<Vec<WireMessage>>,
    keys: Mutex<HashMap<String, String>>,
    sent: Mutex<Vec<OutgoingMessage>>,
    fetches: AtomicUsize,
    heartbeats: AtomicUsize,
    fail_registration: AtomicBool,
    fail_fetches: AtomicBool,
}

impl MockApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Messages returned by every fetch
    pub fn set_messages(&self, messages: Vec<WireMessage>) {
        *self.messages.lock().unwrap() = messages;
    }

    pub fn publish_key(&self, user: &str, key: &PublicKey) {
        self.keys
            .lock()
            .unwrap()
            .insert(user.to_string(), key.to_base64());
    }

    pub fn registered_key(&self, user: &str) -> Option<String> {
        self.keys.lock().unwrap().get(user).cloned()
    }

    pub fn set_fail_registration(&self, fail: bool) {
        self.fail_registration.store(fail, Ordering::SeqCst);
    }

    /// Make fetches and heartbeats fail as if the store were down
    pub fn set_fail_fetches(&self, fail: bool) {
        self.fail_fetches.store(fail, Ordering::SeqCst);
    }

    fn store_down(&self) -> Result<(), FetchError> {
        if self.fail_fetches.load(Ordering::SeqCst) {
            return Err(FetchError::http("store unreachable"));
        }
        Ok(())
    }

    pub fn sent(&self) -> Vec<OutgoingMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn heartbeat_count(&self) -> usize {
        self.heartbeats.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatApi for MockApi {
    async fn fetch_messages(
        &self,
        room: &RoomKey,
        limit: u32,
        _include_hidden: bool,
    ) -> Result<Vec<WireMessage>, FetchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.store_down()?;
        Ok(self
            .messages
            .lock()
            .unwrap()
            .iter()
            .filter(|message| message.room_id == room.as_str())
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn fetch_presence(&self, _room: &RoomKey) -> Result<Vec<PresenceEntry>, FetchError> {
        self.store_down()?;
        Ok(Vec::new())
    }

    async fn send_message(&self, message: &OutgoingMessage) -> Result<(), FetchError> {
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }

    async fn heartbeat(&self, _user: &PeerId, _room: &RoomKey) -> Result<(), FetchError> {
        self.store_down()?;
        self.heartbeats.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn issue_token(&self, user: &PeerId) -> Result<String, FetchError> {
        Ok(format!("token-{}", user))
    }
}

#[async_trait]
impl KeyRegistry for MockApi {
    async fn register_public_key(
        &self,
        user: &PeerId,
        public_key: &PublicKey,
    ) -> Result<(), FetchError> {
        if self.fail_registration.load(Ordering::SeqCst) {
            return Err(FetchError::http("registry unreachable"));
        }
        self.publish_key(user.as_str(), public_key);
        Ok(())
    }

    async fn get_public_key(&self, peer: &PeerId) -> Result<KeyLookup, FetchError> {
        let key = self.keys.lock().unwrap().get(peer.as_str()).cloned();
        Ok(KeyLookup {
            has_key: key.is_some(),
            public_key: key,
        })
    }
}

// ----------------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------------

/// Session wired to the given mocks with short test timers
pub fn build_session(
    user: &str,
    config: SentinelConfig,
    connector: &Arc<MockConnector>,
    api: &Arc<MockApi>,
) -> ChatSession {
    ChatSession::builder(PeerId::new(user))
        .with_config(config)
        .with_connector(connector.clone())
        .with_api(api.clone())
        .with_registry(api.clone())
        .build()
        .expect("session builds")
}

/// Wait until the session state satisfies `predicate`
pub async fn wait_for_state<F>(
    state: &mut watch::Receiver<ConnectionState>,
    max: Duration,
    predicate: F,
) -> ConnectionState
where
    F: Fn(&ConnectionState) -> bool,
{
    let result = tokio::time::timeout(max, async {
        loop {
            {
                let current = state.borrow_and_update();
                if predicate(&*current) {
                    return current.clone();
                }
            }
            if state.changed().await.is_err() {
                panic!("connection manager stopped");
            }
        }
    })
    .await;

    match result {
        Ok(state) => state,
        Err(_) => panic!(
            "state not reached within {:?}; now {}",
            max,
            state.borrow().state_name()
        ),
    }
}

pub async fn wait_until_open(session: &ChatSession) {
    let mut state = session.watch_state();
    wait_for_state(&mut state, Duration::from_secs(5), ConnectionState::is_open).await;
}

/// Next routed message, skipping presence and delivery events
pub async fn next_message(
    events: &mut broadcast::Receiver<RoutedEvent>,
    max: Duration,
) -> Option<RoutedEvent> {
    tokio::time::timeout(max, async {
        loop {
            match events.recv().await {
                Ok(event @ RoutedEvent::Message(_))
                | Ok(event @ RoutedEvent::Unreadable { .. }) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}

pub fn expect_message(event: Option<RoutedEvent>) -> RoutedMessage {
    match event {
        Some(RoutedEvent::Message(message)) => message,
        other => panic!("expected a routed message, got {:?}", other),
    }
}

/// A room message as the server stores it
pub fn wire_message(id: &str, room: &str, sender: &str, text: &str, sent_at: u64) -> WireMessage {
    WireMessage {
        id: id.to_string(),
        room_id: room.to_string(),
        sender_handle: sender.to_string(),
        cipher_blob: sentinel_core::envelope::encode_plain_blob(text),
        nonce: None,
        encryption_kind: Some("none".to_string()),
        sent_at,
    }
}

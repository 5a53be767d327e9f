//! Connection Manager
//!
//! Drives the [`ConnectionMachine`] from a single actor task. Commands from
//! the public handle, socket events, connect results, and timer firings all
//! arrive on one channel and are applied in order, and the effects of each
//! transition are executed before the next input is read.
//!
//! Every socket attempt gets a fresh epoch. Socket events, connect results,
//! and heartbeat firings carry the epoch they were spawned under and are
//! discarded if it is stale, so nothing from a torn-down connection can
//! change state. Reconnect timers carry their own generation for the same
//! reason, and all timer tasks are aborted when their state is left.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use sentinel_core::config::ConnectionConfig;
use sentinel_core::envelope::MessageEnvelope;
use sentinel_core::errors::{SentinelError, TransportError};
use sentinel_core::protocol::{
    decode_frame, ClientMessage, ConnectionEvent, ConnectionMachine, ConnectionState,
    ConnectionStats, DisconnectReason, Effect, InboundFrame, ReconnectPolicy, ServerMessage,
};
use sentinel_core::types::{PeerId, RoomKey, SystemTimeSource};

use crate::api::ChatApi;
use crate::poller::FallbackPoller;
use crate::router::MessageRouter;
use crate::socket::{HandshakeRequest, SocketConnector, SocketEvent, SocketHandle};

/// Buffered session events per subscriber
pub const SESSION_EVENT_CAPACITY: usize = 64;

// ----------------------------------------------------------------------------
// Session Events
// ----------------------------------------------------------------------------

/// Connection-level notifications for consumers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged(ConnectionState),
    /// The live connection opened and joined `room`
    Joined { room: RoomKey },
    /// The server reported an error frame
    ServerError { message: String },
    /// Presence changed in a room; fetch presence to see who
    PresenceChanged { room_id: Option<String> },
}

// ----------------------------------------------------------------------------
// Actor Inputs
// ----------------------------------------------------------------------------

#[derive(Debug)]
enum Input {
    Connect { room: RoomKey },
    Disconnect,
    SwitchRoom { room: RoomKey },
    SetVisibility { visible: bool },
    Shutdown,
    ConnectResult {
        epoch: u64,
        result: Result<SocketHandle, TransportError>,
    },
    Socket { epoch: u64, event: SocketEvent },
    ReconnectDue { generation: u64 },
    HeartbeatTick { epoch: u64 },
    HeartbeatMissed { epoch: u64 },
}

// ----------------------------------------------------------------------------
// Public Handle
// ----------------------------------------------------------------------------

/// Cloneable handle to a running connection manager
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    inputs: mpsc::UnboundedSender<Input>,
    state: watch::Receiver<ConnectionState>,
    stats: watch::Receiver<ConnectionStats>,
    events: broadcast::Sender<SessionEvent>,
}

impl ConnectionHandle {
    fn send(&self, input: Input) -> Result<(), SentinelError> {
        self.inputs
            .send(input)
            .map_err(|_| SentinelError::channel_error("connection manager has stopped"))
    }

    /// Connect to `room`. Accepted from Disconnected or FailedPermanently;
    /// resets the reconnect attempt counter.
    pub fn connect(&self, room: RoomKey) -> Result<(), SentinelError> {
        self.send(Input::Connect { room })
    }

    /// Close the live connection, cancel pending reconnects, stop polling
    pub fn disconnect(&self) -> Result<(), SentinelError> {
        self.send(Input::Disconnect)
    }

    /// Join another room now if open, otherwise once open
    pub fn switch_room(&self, room: RoomKey) -> Result<(), SentinelError> {
        self.send(Input::SwitchRoom { room })
    }

    pub fn set_visibility(&self, visible: bool) -> Result<(), SentinelError> {
        self.send(Input::SetVisibility { visible })
    }

    /// Disconnect and stop the manager task
    pub fn shutdown(&self) -> Result<(), SentinelError> {
        self.send(Input::Shutdown)
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// State machine counters as of the last processed input
    pub fn statistics(&self) -> ConnectionStats {
        self.stats.borrow().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }
}

// ----------------------------------------------------------------------------
// Manager
// ----------------------------------------------------------------------------

/// Collaborators and settings for a connection manager
pub struct ConnectionManager {
    pub user: PeerId,
    pub config: ConnectionConfig,
    pub connector: Arc<dyn SocketConnector>,
    pub api: Arc<dyn ChatApi>,
    pub router: Arc<MessageRouter>,
    pub poller: Arc<FallbackPoller>,
    /// Room the fallback poller follows
    pub room_tx: watch::Sender<RoomKey>,
}

impl ConnectionManager {
    /// Spawn the actor and the inbound ingestion task
    pub fn spawn(self) -> (ConnectionHandle, JoinHandle<()>) {
        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::new_disconnected());
        let (stats_tx, stats_rx) = watch::channel(ConnectionStats::default());
        let (events_tx, _) = broadcast::channel(SESSION_EVENT_CAPACITY);

        // Live envelopes are ingested sequentially, in arrival order
        let (ingest_tx, mut ingest_rx) = mpsc::unbounded_channel::<MessageEnvelope>();
        let router = Arc::clone(&self.router);
        let ingest_task = tokio::spawn(async move {
            while let Some(envelope) = ingest_rx.recv().await {
                router.ingest(envelope).await;
            }
        });

        let policy = ReconnectPolicy::from_config(&self.config.reconnect);
        let actor = ConnectionActor {
            machine: ConnectionMachine::new(policy, SystemTimeSource),
            manager: self,
            inputs_tx: inputs_tx.clone(),
            state_tx,
            stats_tx,
            events_tx: events_tx.clone(),
            ingest_tx,
            ingest_task: Some(ingest_task),
            socket: None,
            epoch: 0,
            reconnect_generation: 0,
            connect_task: None,
            forward_task: None,
            reconnect_task: None,
            heartbeat_task: None,
            heartbeat_deadline: None,
        };
        let task = tokio::spawn(actor.run(inputs_rx));

        let handle = ConnectionHandle {
            inputs: inputs_tx,
            state: state_rx,
            stats: stats_rx,
            events: events_tx,
        };
        (handle, task)
    }
}

struct ConnectionActor {
    machine: ConnectionMachine<SystemTimeSource>,
    manager: ConnectionManager,
    inputs_tx: mpsc::UnboundedSender<Input>,
    state_tx: watch::Sender<ConnectionState>,
    stats_tx: watch::Sender<ConnectionStats>,
    events_tx: broadcast::Sender<SessionEvent>,
    ingest_tx: mpsc::UnboundedSender<MessageEnvelope>,
    ingest_task: Option<JoinHandle<()>>,
    socket: Option<SocketHandle>,
    epoch: u64,
    reconnect_generation: u64,
    connect_task: Option<JoinHandle<()>>,
    forward_task: Option<JoinHandle<()>>,
    reconnect_task: Option<JoinHandle<()>>,
    heartbeat_task: Option<JoinHandle<()>>,
    heartbeat_deadline: Option<JoinHandle<()>>,
}

impl ConnectionActor {
    async fn run(mut self, mut inputs: mpsc::UnboundedReceiver<Input>) {
        info!("Connection manager started for {}", self.manager.user);

        while let Some(input) = inputs.recv().await {
            match input {
                Input::Connect { room } => self.apply(ConnectionEvent::Connect { room }),
                Input::Disconnect => self.apply(ConnectionEvent::Disconnect),
                Input::SwitchRoom { room } => self.apply(ConnectionEvent::SwitchRoom { room }),
                Input::SetVisibility { visible } => self.on_visibility(visible),
                Input::Shutdown => {
                    if !matches!(self.machine.state(), ConnectionState::Disconnected(_)) {
                        self.apply(ConnectionEvent::Disconnect);
                    }
                    break;
                }
                Input::ConnectResult { epoch, result } => self.on_connect_result(epoch, result),
                Input::Socket { epoch, event } => {
                    if epoch == self.epoch {
                        self.on_socket_event(event);
                    } else {
                        debug!("Ignoring event from stale connection {}", epoch);
                    }
                }
                Input::ReconnectDue { generation } => {
                    if generation == self.reconnect_generation {
                        self.reconnect_task = None;
                        self.apply(ConnectionEvent::ReconnectDue);
                    }
                }
                Input::HeartbeatTick { epoch } => {
                    if epoch == self.epoch {
                        self.send_ping();
                    }
                }
                Input::HeartbeatMissed { epoch } => {
                    if epoch == self.epoch {
                        warn!(
                            "No pong within {}ms",
                            self.manager.config.heartbeat_timeout_ms
                        );
                        self.heartbeat_deadline = None;
                        self.apply(ConnectionEvent::HeartbeatTimedOut);
                    }
                }
            }
        }

        self.teardown();
        info!("Connection manager stopped");
    }

    /// Feed one event to the state machine and execute its effects
    fn apply(&mut self, event: ConnectionEvent) {
        let result = self.machine.handle(event);
        self.stats_tx.send_replace(self.machine.statistics().clone());
        let transition = match result {
            Ok(transition) => transition,
            Err(e) => {
                debug!("{}", e);
                return;
            }
        };

        let from = &transition.audit_entry.from_state;
        let to = &transition.audit_entry.to_state;
        if from != to {
            info!("Connection state: {} -> {}", from, to);
        }

        for effect in transition.effects {
            self.execute(effect);
        }

        let room = self
            .machine
            .pending_room()
            .or(self.machine.room())
            .cloned();
        if let Some(room) = room {
            self.manager.room_tx.send_if_modified(|current| {
                if *current == room {
                    false
                } else {
                    *current = room;
                    true
                }
            });
        }

        self.state_tx.send_replace(transition.new_state.clone());
        self.emit(SessionEvent::StateChanged(transition.new_state));
    }

    fn execute(&mut self, effect: Effect) {
        match effect {
            Effect::OpenSocket { room, attempt } => self.open_socket(room, attempt),
            Effect::CloseSocket { code } => {
                if let Some(task) = self.connect_task.take() {
                    task.abort();
                }
                if let Some(socket) = self.socket.take() {
                    socket.close(code);
                }
                self.retire_socket();
            }
            Effect::DropSocket => {
                self.socket = None;
                self.retire_socket();
            }
            Effect::ScheduleReconnect { delay_ms, attempt } => {
                info!(
                    "Reconnecting in {}ms (attempt {}/{})",
                    delay_ms,
                    attempt,
                    self.machine.policy().max_attempts()
                );
                self.cancel_reconnect();
                let generation = self.reconnect_generation;
                let inputs = self.inputs_tx.clone();
                self.reconnect_task = Some(tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    let _ = inputs.send(Input::ReconnectDue { generation });
                }));
            }
            Effect::CancelReconnect => self.cancel_reconnect(),
            Effect::StartHeartbeat => self.start_heartbeat(),
            Effect::StopHeartbeat => self.stop_heartbeat(),
            Effect::ActivatePoller => {
                let interval = self.manager.poller.default_interval();
                if self.manager.poller.activate(interval) {
                    info!("Live path unavailable; using fallback polling");
                }
            }
            Effect::DeactivatePoller => {
                self.manager.poller.deactivate();
            }
            Effect::Send(frame) => self.send_frame(&frame),
            Effect::EmitJoined { room } => {
                info!("Joined {}", room);
                self.emit(SessionEvent::Joined { room });
            }
        }
    }

    fn open_socket(&mut self, room: RoomKey, attempt: u32) {
        self.retire_socket();
        if let Some(task) = self.connect_task.take() {
            task.abort();
        }

        let epoch = self.epoch;
        debug!("Opening live connection to {} (attempt {})", room, attempt);

        // Forward this connection's socket events tagged with its epoch
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let inputs = self.inputs_tx.clone();
        self.forward_task = Some(tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                if inputs.send(Input::Socket { epoch, event }).is_err() {
                    break;
                }
            }
        }));

        let config = &self.manager.config;
        let timeout = config.connect_timeout();
        let timeout_ms = config.connect_timeout_ms;
        let ws_url = config.ws_url.clone();
        let user = self.manager.user.clone();
        let api = Arc::clone(&self.manager.api);
        let connector = Arc::clone(&self.manager.connector);
        let inputs = self.inputs_tx.clone();

        self.connect_task = Some(tokio::spawn(async move {
            let attempt = open_connection(api, connector, ws_url, user, room, events_tx);
            let result = match tokio::time::timeout(timeout, attempt).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::ConnectTimeout {
                    duration_ms: timeout_ms,
                }),
            };
            let _ = inputs.send(Input::ConnectResult { epoch, result });
        }));
    }

    /// Invalidate everything tied to the current socket
    fn retire_socket(&mut self) {
        self.epoch += 1;
        if let Some(task) = self.forward_task.take() {
            task.abort();
        }
    }

    fn on_connect_result(&mut self, epoch: u64, result: Result<SocketHandle, TransportError>) {
        if epoch != self.epoch {
            debug!("Discarding result of abandoned connect attempt {}", epoch);
            return;
        }
        self.connect_task = None;

        match result {
            Ok(handle) => {
                self.socket = Some(handle);
                self.apply(ConnectionEvent::Opened);
            }
            Err(e) => {
                warn!("Connect attempt failed: {}", e);
                self.retire_socket();
                self.apply(ConnectionEvent::ConnectFailed {
                    reason: e.to_string(),
                });
            }
        }
    }

    fn on_socket_event(&mut self, event: SocketEvent) {
        match event {
            SocketEvent::Closed { code, reason } => {
                info!("Connection closed with code {}: {}", code, reason);
                self.apply(ConnectionEvent::Closed { code, reason });
            }
            SocketEvent::Error(message) => warn!("Socket error: {}", message),
            SocketEvent::Message(bytes) => self.on_frame(&bytes),
        }
    }

    fn on_frame(&mut self, bytes: &[u8]) {
        let frame = match decode_frame(bytes) {
            Ok(InboundFrame::Known(frame)) => frame,
            Ok(InboundFrame::Unknown { kind }) => {
                warn!("Ignoring unknown frame type '{}'", kind);
                return;
            }
            Err(e) => {
                warn!("Ignoring malformed frame: {}", e);
                return;
            }
        };

        match frame {
            ServerMessage::Connected { user_handle } => {
                debug!("Server acknowledged connection for {:?}", user_handle);
            }
            ServerMessage::RoomJoined { room_id } => debug!("Server joined us to {}", room_id),
            ServerMessage::NewMessage { message } => match message.into_envelope() {
                Ok(envelope) => self.forward(envelope),
                Err(e) => warn!("Dropping undecodable message: {}", e),
            },
            ServerMessage::NewIm { im } => match im.into_envelope() {
                Ok(envelope) => self.forward(envelope),
                Err(e) => warn!("Dropping undecodable direct message: {}", e),
            },
            ServerMessage::ImDelivered { im_id, to_user } => {
                self.manager
                    .router
                    .publish_delivered(im_id, PeerId::new(to_user));
            }
            ServerMessage::PresenceUpdate { room_id } => {
                self.emit(SessionEvent::PresenceChanged { room_id });
            }
            ServerMessage::Pong => {
                if let Some(deadline) = self.heartbeat_deadline.take() {
                    deadline.abort();
                }
            }
            ServerMessage::Error { message } => {
                warn!("Server error: {}", message);
                self.emit(SessionEvent::ServerError { message });
            }
        }
    }

    fn forward(&self, envelope: MessageEnvelope) {
        if self.ingest_tx.send(envelope).is_err() {
            error!("Ingestion task has stopped; dropping live message");
        }
    }

    fn on_visibility(&mut self, visible: bool) {
        self.apply(ConnectionEvent::VisibilityChanged { visible });
        if !visible {
            return;
        }

        let resumable = match self.machine.state() {
            ConnectionState::Disconnected(state) => matches!(
                state.reason,
                DisconnectReason::NormalClose | DisconnectReason::Hidden
            ),
            ConnectionState::FailedPermanently(_) => true,
            _ => false,
        };
        let room = self
            .machine
            .pending_room()
            .or(self.machine.room())
            .cloned();
        if let (true, Some(room)) = (resumable, room) {
            info!("Visible again; reconnecting to {}", room);
            self.apply(ConnectionEvent::Connect { room });
        }
    }

    // ------------------------------------------------------------------------
    // Heartbeat
    // ------------------------------------------------------------------------

    fn start_heartbeat(&mut self) {
        self.stop_heartbeat();
        let epoch = self.epoch;
        let interval = self.manager.config.heartbeat_interval();
        let inputs = self.inputs_tx.clone();
        self.heartbeat_task = Some(tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if inputs.send(Input::HeartbeatTick { epoch }).is_err() {
                    break;
                }
            }
        }));
    }

    fn stop_heartbeat(&mut self) {
        if let Some(task) = self.heartbeat_task.take() {
            task.abort();
        }
        if let Some(task) = self.heartbeat_deadline.take() {
            task.abort();
        }
    }

    fn send_ping(&mut self) {
        if !self.machine.state().is_open() {
            return;
        }
        self.send_frame(&ClientMessage::Ping);

        if self.heartbeat_deadline.is_none() {
            let epoch = self.epoch;
            let timeout = self.manager.config.heartbeat_timeout();
            let inputs = self.inputs_tx.clone();
            self.heartbeat_deadline = Some(tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let _ = inputs.send(Input::HeartbeatMissed { epoch });
            }));
        }
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn send_frame(&self, frame: &ClientMessage) {
        let Some(socket) = self.socket.as_ref() else {
            debug!("No open socket for {} frame", frame.kind());
            return;
        };
        let text = match frame.encode() {
            Ok(text) => text,
            Err(e) => {
                error!("Failed to encode {} frame: {}", frame.kind(), e);
                return;
            }
        };
        if let Err(e) = socket.send_text(text) {
            warn!("Failed to send {} frame: {}", frame.kind(), e);
        }
    }

    fn cancel_reconnect(&mut self) {
        self.reconnect_generation += 1;
        if let Some(task) = self.reconnect_task.take() {
            task.abort();
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events_tx.send(event);
    }

    fn teardown(&mut self) {
        self.cancel_reconnect();
        self.stop_heartbeat();
        if let Some(task) = self.connect_task.take() {
            task.abort();
        }
        self.socket = None;
        self.retire_socket();
        self.manager.poller.deactivate();
        if let Some(task) = self.ingest_task.take() {
            task.abort();
        }
    }
}

/// Fetch a handshake token and open the socket
async fn open_connection(
    api: Arc<dyn ChatApi>,
    connector: Arc<dyn SocketConnector>,
    ws_url: String,
    user: PeerId,
    room: RoomKey,
    events: mpsc::UnboundedSender<SocketEvent>,
) -> Result<SocketHandle, TransportError> {
    let token = api.issue_token(&user).await.map_err(|e| {
        TransportError::connect_failed(&ws_url, format!("token request failed: {}", e))
    })?;
    let request = HandshakeRequest {
        ws_url,
        user_handle: user.as_str().to_string(),
        token,
        room_id: room.as_str().to_string(),
    };
    connector.connect(&request, events).await
}

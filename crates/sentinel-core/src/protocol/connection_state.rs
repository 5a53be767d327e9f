//! Live Connection State Machine
//!
//! Pure state transitions for the single live connection of a client session.
//! The machine never performs I/O: every transition returns the effects the
//! driver must execute (open/drop the socket, arm or cancel timers, toggle the
//! fallback poller, send control frames). This keeps reconnect and fallback
//! behaviour unit-testable without a real socket.

use core::fmt;
use serde::{Deserialize, Serialize};

use super::reconnect::ReconnectPolicy;
use super::wire::ClientMessage;
use crate::types::{RoomKey, TimeSource, Timestamp};

/// Close code of a normal, explicit close
pub const NORMAL_CLOSE: u16 = 1000;

/// Close code reported when the connection dropped without a close frame
pub const ABNORMAL_CLOSE: u16 = 1006;

/// Number of audit entries retained by the machine
pub const MAX_AUDIT_ENTRIES: usize = 1000;

// ----------------------------------------------------------------------------
// Connection State Types
// ----------------------------------------------------------------------------

/// Lifecycle state of the live connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No live connection and no reconnect pending
    Disconnected(DisconnectedState),
    /// Handshake in flight
    Connecting(ConnectingState),
    /// Live connection established
    Open(OpenState),
    /// Waiting for the backoff delay before the next connect
    Reconnecting(ReconnectingState),
    /// Reconnect attempts exhausted; polling until an explicit connect
    FailedPermanently(FailedState),
}

/// Why the session is disconnected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectReason {
    /// Never connected
    Initial,
    /// `disconnect()` was called
    Explicit,
    /// The server closed the connection normally
    NormalClose,
    /// The connection dropped while the client was not visible
    Hidden,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectedState {
    pub reason: DisconnectReason,
    pub since: Option<Timestamp>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectingState {
    /// 0 for a fresh connect, otherwise the reconnect number
    pub attempt: u32,
    pub started_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenState {
    pub connected_since: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectingState {
    pub attempt: u32,
    pub delay_ms: u64,
    pub scheduled_at: Timestamp,
    pub last_error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedState {
    pub failed_at: Timestamp,
    pub attempts: u32,
    pub last_error: String,
}

impl ConnectionState {
    /// Initial state of a new session
    pub fn new_disconnected() -> Self {
        ConnectionState::Disconnected(DisconnectedState {
            reason: DisconnectReason::Initial,
            since: None,
        })
    }

    /// Get current state name for logging/audit
    pub fn state_name(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected(_) => "Disconnected",
            ConnectionState::Connecting(_) => "Connecting",
            ConnectionState::Open(_) => "Open",
            ConnectionState::Reconnecting(_) => "Reconnecting",
            ConnectionState::FailedPermanently(_) => "FailedPermanently",
        }
    }

    /// Check if state allows frames to be sent
    pub fn can_send_messages(&self) -> bool {
        matches!(self, ConnectionState::Open(_))
    }

    pub fn is_open(&self) -> bool {
        self.can_send_messages()
    }

    /// Whether the live path owns delivery (connected, connecting, or about
    /// to retry)
    pub fn is_live_path_active(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting(_)
                | ConnectionState::Open(_)
                | ConnectionState::Reconnecting(_)
        )
    }

    /// Whether an explicit `connect()` is accepted
    pub fn accepts_connect(&self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected(_) | ConnectionState::FailedPermanently(_)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.state_name())
    }
}

// ----------------------------------------------------------------------------
// State Transition Events
// ----------------------------------------------------------------------------

/// Inputs to the state machine, from the API surface, the socket, or timers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Explicit connect to a room
    Connect { room: RoomKey },
    /// Socket handshake completed
    Opened,
    /// Socket closed by either side
    Closed { code: u16, reason: String },
    /// Connect attempt failed or exceeded the connect timeout
    ConnectFailed { reason: String },
    /// No pong within the heartbeat bound
    HeartbeatTimedOut,
    /// Backoff delay elapsed
    ReconnectDue,
    /// Explicit shutdown of the live path
    Disconnect,
    /// Switch the joined room or conversation
    SwitchRoom { room: RoomKey },
    /// Hosting environment became visible or hidden
    VisibilityChanged { visible: bool },
}

// ----------------------------------------------------------------------------
// Effects
// ----------------------------------------------------------------------------

/// Side effects the driver executes after a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Start a connect attempt bounded by the connect timeout
    OpenSocket { room: RoomKey, attempt: u32 },
    /// Cancel any in-flight connect and close the socket with `code`
    CloseSocket { code: u16 },
    /// Forget the current socket without a close handshake
    DropSocket,
    ScheduleReconnect { delay_ms: u64, attempt: u32 },
    CancelReconnect,
    StartHeartbeat,
    StopHeartbeat,
    ActivatePoller,
    DeactivatePoller,
    /// Send a control frame on the open socket
    Send(ClientMessage),
    /// Tell consumers the session joined `room`
    EmitJoined { room: RoomKey },
}

// ----------------------------------------------------------------------------
// State Transition Results
// ----------------------------------------------------------------------------

/// Result of a state transition
#[derive(Debug, Clone)]
pub struct StateTransition {
    /// New connection state
    pub new_state: ConnectionState,
    /// Effects to execute as result of transition
    pub effects: Vec<Effect>,
    /// Audit trail entry
    pub audit_entry: AuditEntry,
}

/// Audit trail entry for state transitions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: Timestamp,
    pub from_state: String,
    pub to_state: String,
    pub event: String,
    pub effects_count: usize,
}

/// Counters kept by the state machine
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub state_transitions: u64,
    pub opens: u64,
    pub reconnects_scheduled: u64,
    pub heartbeat_timeouts: u64,
    pub permanent_failures: u64,
    pub rejected_events: u64,
}

// ----------------------------------------------------------------------------
// State Machine Implementation
// ----------------------------------------------------------------------------

/// Owns the connection state, the reconnect policy, and the room bookkeeping
/// for one client session.
#[derive(Debug)]
pub struct ConnectionMachine<T: TimeSource> {
    state: ConnectionState,
    policy: ReconnectPolicy,
    room: Option<RoomKey>,
    pending_room: Option<RoomKey>,
    visible: bool,
    audit_trail: Vec<AuditEntry>,
    stats: ConnectionStats,
    time_source: T,
}

impl<T: TimeSource> ConnectionMachine<T> {
    pub fn new(policy: ReconnectPolicy, time_source: T) -> Self {
        Self {
            state: ConnectionState::new_disconnected(),
            policy,
            room: None,
            pending_room: None,
            visible: true,
            audit_trail: Vec::new(),
            stats: ConnectionStats::default(),
            time_source,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Room the live connection is (or will be) joined to
    pub fn room(&self) -> Option<&RoomKey> {
        self.room.as_ref()
    }

    /// Room switch recorded while not open, replayed on the next open
    pub fn pending_room(&self) -> Option<&RoomKey> {
        self.pending_room.as_ref()
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn statistics(&self) -> &ConnectionStats {
        &self.stats
    }

    /// Get recent audit entries
    pub fn recent_audit_entries(&self, limit: usize) -> &[AuditEntry] {
        let start = self.audit_trail.len().saturating_sub(limit);
        &self.audit_trail[start..]
    }

    /// Process an event and transition to the new state
    pub fn handle(
        &mut self,
        event: ConnectionEvent,
    ) -> Result<StateTransition, StateTransitionError> {
        let now = self.time_source.now();
        let from_state = self.state.state_name().to_string();
        let event_name = format!("{:?}", event);

        let (new_state, effects) = match (self.state.clone(), event) {
            // Explicit connect
            (state, ConnectionEvent::Connect { room }) if state.accepts_connect() => {
                self.policy.reset();
                self.room = Some(room.clone());
                let new_state = ConnectionState::Connecting(ConnectingState {
                    attempt: 0,
                    started_at: now,
                });
                (new_state, vec![Effect::OpenSocket { room, attempt: 0 }])
            }

            // From Connecting
            (ConnectionState::Connecting(_), ConnectionEvent::Opened) => self.on_opened(now),

            (ConnectionState::Connecting(_), ConnectionEvent::ConnectFailed { reason }) => {
                self.retry_or_fail(reason, now)
            }

            (
                ConnectionState::Connecting(_) | ConnectionState::Open(_),
                ConnectionEvent::Closed { code, reason },
            ) => self.on_closed(code, reason, now),

            // From Open
            (ConnectionState::Open(_), ConnectionEvent::HeartbeatTimedOut) => {
                self.stats.heartbeat_timeouts += 1;
                self.on_closed(ABNORMAL_CLOSE, "heartbeat timeout".to_string(), now)
            }

            (ConnectionState::Open(s), ConnectionEvent::SwitchRoom { room }) => {
                let state = ConnectionState::Open(s);
                self.pending_room = None;
                if self.room.as_ref() == Some(&room) {
                    (state, Vec::new())
                } else {
                    let frame = ClientMessage::join_room(&room);
                    self.room = Some(room);
                    (state, vec![Effect::Send(frame)])
                }
            }

            // From Reconnecting
            (ConnectionState::Reconnecting(s), ConnectionEvent::ReconnectDue) => {
                let attempt = s.attempt;
                match self.room.clone() {
                    Some(room) => {
                        let new_state = ConnectionState::Connecting(ConnectingState {
                            attempt,
                            started_at: now,
                        });
                        (new_state, vec![Effect::OpenSocket { room, attempt }])
                    }
                    None => {
                        return Err(self.reject(
                            from_state,
                            event_name,
                            "no room to reconnect to".to_string(),
                        ))
                    }
                }
            }

            // Room switches while not open are kept for replay
            (state, ConnectionEvent::SwitchRoom { room }) => {
                self.pending_room = Some(room);
                (state, Vec::new())
            }

            (state, ConnectionEvent::VisibilityChanged { visible }) => {
                self.visible = visible;
                (state, Vec::new())
            }

            // Universal transitions
            (_, ConnectionEvent::Disconnect) => {
                let new_state = ConnectionState::Disconnected(DisconnectedState {
                    reason: DisconnectReason::Explicit,
                    since: Some(now),
                });
                let effects = vec![
                    Effect::CancelReconnect,
                    Effect::StopHeartbeat,
                    Effect::CloseSocket { code: NORMAL_CLOSE },
                    Effect::DeactivatePoller,
                ];
                (new_state, effects)
            }

            // Invalid transitions
            (state, event) => {
                let reason = format!("Event {:?} not valid for state {}", event, state);
                return Err(self.reject(from_state, event_name, reason));
            }
        };

        self.state = new_state;
        self.stats.state_transitions += 1;

        let audit_entry = AuditEntry {
            timestamp: now,
            from_state,
            to_state: self.state.state_name().to_string(),
            event: event_name,
            effects_count: effects.len(),
        };
        self.audit_trail.push(audit_entry.clone());
        if self.audit_trail.len() > MAX_AUDIT_ENTRIES {
            self.audit_trail.remove(0);
        }

        Ok(StateTransition {
            new_state: self.state.clone(),
            effects,
            audit_entry,
        })
    }

    fn on_opened(&mut self, now: Timestamp) -> (ConnectionState, Vec<Effect>) {
        self.policy.reset();
        self.stats.opens += 1;

        let mut effects = vec![
            Effect::DeactivatePoller,
            Effect::StartHeartbeat,
            Effect::Send(ClientMessage::online()),
        ];
        if let Some(pending) = self.pending_room.take() {
            if self.room.as_ref() != Some(&pending) {
                effects.push(Effect::Send(ClientMessage::join_room(&pending)));
                self.room = Some(pending);
            }
        }
        if let Some(room) = self.room.clone() {
            effects.push(Effect::EmitJoined { room });
        }

        let new_state = ConnectionState::Open(OpenState {
            connected_since: now,
        });
        (new_state, effects)
    }

    fn on_closed(
        &mut self,
        code: u16,
        reason: String,
        now: Timestamp,
    ) -> (ConnectionState, Vec<Effect>) {
        if code == NORMAL_CLOSE || !self.visible {
            let reason = if code == NORMAL_CLOSE {
                DisconnectReason::NormalClose
            } else {
                DisconnectReason::Hidden
            };
            let new_state = ConnectionState::Disconnected(DisconnectedState {
                reason,
                since: Some(now),
            });
            let effects = vec![
                Effect::DropSocket,
                Effect::StopHeartbeat,
                Effect::ActivatePoller,
            ];
            return (new_state, effects);
        }

        let (new_state, mut effects) =
            self.retry_or_fail(format!("closed with code {}: {}", code, reason), now);
        effects.insert(0, Effect::DropSocket);
        (new_state, effects)
    }

    fn retry_or_fail(&mut self, reason: String, now: Timestamp) -> (ConnectionState, Vec<Effect>) {
        match self.policy.record_attempt() {
            Some(delay_ms) => {
                self.stats.reconnects_scheduled += 1;
                let attempt = self.policy.attempt();
                let new_state = ConnectionState::Reconnecting(ReconnectingState {
                    attempt,
                    delay_ms,
                    scheduled_at: now,
                    last_error: reason,
                });
                // No polling while a reconnect is pending
                let effects = vec![
                    Effect::StopHeartbeat,
                    Effect::DeactivatePoller,
                    Effect::ScheduleReconnect { delay_ms, attempt },
                ];
                (new_state, effects)
            }
            None => {
                self.stats.permanent_failures += 1;
                let new_state = ConnectionState::FailedPermanently(FailedState {
                    failed_at: now,
                    attempts: self.policy.attempt(),
                    last_error: reason,
                });
                (new_state, vec![Effect::StopHeartbeat, Effect::ActivatePoller])
            }
        }
    }

    fn reject(
        &mut self,
        from_state: String,
        event: String,
        reason: String,
    ) -> StateTransitionError {
        self.stats.rejected_events += 1;
        StateTransitionError::InvalidTransition {
            from_state,
            event,
            reason,
        }
    }
}

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// Errors that can occur during state transitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateTransitionError {
    /// Invalid state transition attempted
    InvalidTransition {
        from_state: String,
        event: String,
        reason: String,
    },
}

impl fmt::Display for StateTransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateTransitionError::InvalidTransition {
                from_state,
                event,
                reason,
            } => {
                write!(
                    f,
                    "Invalid transition from {} on event {}: {}",
                    from_state, event, reason
                )
            }
        }
    }
}

impl std::error::Error for StateTransitionError {}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

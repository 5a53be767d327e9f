//! Live connection protocol
//!
//! Wire frames, the reconnect backoff policy, and the pure connection state
//! machine driven by the runtime.

pub mod connection_state;
pub mod reconnect;
pub mod wire;

pub use connection_state::{
    AuditEntry, ConnectingState, ConnectionEvent, ConnectionMachine, ConnectionState,
    ConnectionStats, DisconnectReason, DisconnectedState, Effect, FailedState, OpenState,
    ReconnectingState, StateTransition, StateTransitionError, ABNORMAL_CLOSE, NORMAL_CLOSE,
};
pub use reconnect::ReconnectPolicy;
pub use wire::{
    decode_frame, ClientMessage, InboundFrame, KeyLookup, OutgoingMessage, PresenceEntry,
    ServerMessage, WireDirectMessage, WireMessage, FILTER_VERSION, STATUS_ONLINE,
};

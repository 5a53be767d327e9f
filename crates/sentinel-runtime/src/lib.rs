//! Sentinel Runtime Engine
//!
//! This crate drives the pure logic of `sentinel-core` with Tokio:
//! - `ConnectionManager`: actor owning the live connection state machine
//! - `FallbackPoller`: HTTP polling while the live path is down
//! - `MessageRouter`: de-duplicating ingestion point for both delivery paths
//! - `CryptoEngine`: local key pair, peer key resolution and box encryption
//! - `ChatSession`: the wired-up client, built with `SessionBuilder`
//!
//! Network collaborators sit behind the `SocketConnector`, `ChatApi` and
//! `KeyRegistry` traits so tests can substitute them.

pub mod api;
pub mod connection;
pub mod crypto_engine;
pub mod poller;
pub mod router;
pub mod session;
pub mod socket;

pub use api::{ChatApi, HttpChatApi, KeyRegistry, API_SECRET_HEADER};
pub use connection::{ConnectionHandle, ConnectionManager, SessionEvent};
pub use crypto_engine::{CryptoEngine, OutgoingPayload};
pub use poller::{FallbackPoller, PollerStats};
pub use router::{IngestOutcome, MessageRouter, RoutedEvent, RoutedMessage, RouterStats};
pub use session::{ChatSession, SessionBuilder, DEFAULT_ROOM};
pub use socket::{
    HandshakeRequest, SocketCommand, SocketConnector, SocketEvent, SocketHandle, WsConnector,
};

// Re-export core types for convenience
pub use sentinel_core::{
    ConnectionState, EncryptionKind, PeerId, RoomKey, SentinelConfig, SentinelError,
    SentinelResult,
};

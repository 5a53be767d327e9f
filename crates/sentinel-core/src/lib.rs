//! Sentinel Core
//!
//! Runtime-free building blocks of the Sentinel chat client: the live
//! connection state machine and its backoff policy, the JSON wire protocol,
//! message envelopes, authenticated box encryption with key persistence and
//! peer key caching, and the bounded de-duplication window shared by the live
//! and polled delivery paths.
//!
//! Nothing in this crate performs network I/O or spawns tasks; the
//! `sentinel-runtime` crate drives these types.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod config;
pub mod crypto;
pub mod dedup;
pub mod envelope;
pub mod errors;
pub mod keystore;
pub mod peer_cache;
pub mod protocol;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use config::{
    ApiConfig, ConnectionConfig, CryptoConfig, PollerConfig, ReconnectConfig, RouterConfig,
    SentinelConfig,
};
pub use crypto::{KeyPair, PublicKey, SealedPayload};
pub use dedup::SeenMessageSet;
pub use envelope::{EncryptionKind, MessageEnvelope};
pub use errors::{
    CryptographicError, FetchError, ProtocolError, Result, SentinelError, SentinelResult,
    TransportError,
};
pub use keystore::{create_default_key_store, FileKeyStore, KeyStore, MemoryKeyStore};
pub use peer_cache::{PeerKeyCache, PeerKeyCacheStats};
pub use protocol::{
    ConnectionEvent, ConnectionMachine, ConnectionState, Effect, ReconnectPolicy,
    StateTransitionError,
};
pub use types::{MessageId, PeerId, RoomKey, SystemTimeSource, TimeSource, Timestamp};

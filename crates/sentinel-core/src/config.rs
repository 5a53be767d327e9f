//! Centralized Configuration Management
//!
//! All tunables of the transport and encryption layers, grouped by component.
//! Every section has a `Default` matching the deployed server's expectations
//! and can be layered from files and environment by the front-end.

use core::time::Duration;
use serde::{Deserialize, Serialize};

use crate::dedup::DEFAULT_SEEN_CAPACITY;
use crate::errors::{Result, SentinelError};
use crate::keystore::DEFAULT_KEY_STORE_ID;
use crate::peer_cache::DEFAULT_PEER_KEY_MAX_AGE_MS;

// ----------------------------------------------------------------------------
// Connection Configuration
// ----------------------------------------------------------------------------

/// Backoff bounds for reconnecting after abnormal closes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Scheduled reconnects before giving up on the live path
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

/// Live connection settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Base websocket URL; handshake parameters are appended as a query
    pub ws_url: String,
    /// Bound on token issuance plus socket handshake
    pub connect_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// How long a ping may go unanswered
    pub heartbeat_timeout_ms: u64,
    pub reconnect: ReconnectConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            ws_url: "ws://localhost:8420".to_string(),
            connect_timeout_ms: 5_000,
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: 10_000,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }
}

// ----------------------------------------------------------------------------
// Poller Configuration
// ----------------------------------------------------------------------------

/// Fallback polling settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    pub interval_ms: u64,
    /// Messages requested per fetch
    pub fetch_limit: u32,
    pub include_hidden: bool,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            fetch_limit: 50,
            include_hidden: false,
        }
    }
}

impl PollerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

// ----------------------------------------------------------------------------
// Crypto Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// Send direct messages unencrypted when the peer has no published key
    pub allow_unencrypted_fallback: bool,
    pub peer_key_max_age_ms: u64,
    /// Fixed identifier the local key pair is stored under
    pub key_store_id: String,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            allow_unencrypted_fallback: true,
            peer_key_max_age_ms: DEFAULT_PEER_KEY_MAX_AGE_MS,
            key_store_id: DEFAULT_KEY_STORE_ID.to_string(),
        }
    }
}

// ----------------------------------------------------------------------------
// Router Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Number of message ids remembered for de-duplication
    pub seen_capacity: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            seen_capacity: DEFAULT_SEEN_CAPACITY,
        }
    }
}

// ----------------------------------------------------------------------------
// API Configuration
// ----------------------------------------------------------------------------

/// HTTP collaborator settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub api_base_url: String,
    /// Sent as `X-API-SECRET` on every request
    pub api_secret: String,
    pub request_timeout_ms: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost/iChat/api".to_string(),
            api_secret: String::new(),
            request_timeout_ms: 10_000,
        }
    }
}

impl ApiConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

// ----------------------------------------------------------------------------
// Aggregate Configuration
// ----------------------------------------------------------------------------

/// Complete client configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SentinelConfig {
    pub connection: ConnectionConfig,
    pub poller: PollerConfig,
    pub crypto: CryptoConfig,
    pub router: RouterConfig,
    pub api: ApiConfig,
}

impl SentinelConfig {
    /// Settings for a server running on the local machine
    pub fn local_development() -> Self {
        Self {
            connection: ConnectionConfig {
                ws_url: "ws://127.0.0.1:8420".to_string(),
                ..ConnectionConfig::default()
            },
            api: ApiConfig {
                api_base_url: "http://127.0.0.1/iChat/api".to_string(),
                api_secret: "change-me-now".to_string(),
                ..ApiConfig::default()
            },
            ..Self::default()
        }
    }

    /// Short timers for tests
    pub fn testing() -> Self {
        Self {
            connection: ConnectionConfig {
                ws_url: "ws://test.invalid".to_string(),
                connect_timeout_ms: 500,
                heartbeat_interval_ms: 1_000,
                heartbeat_timeout_ms: 500,
                reconnect: ReconnectConfig::default(),
            },
            poller: PollerConfig {
                interval_ms: 100,
                ..PollerConfig::default()
            },
            router: RouterConfig { seen_capacity: 50 },
            api: ApiConfig {
                api_base_url: "http://test.invalid/api".to_string(),
                api_secret: "test-secret".to_string(),
                request_timeout_ms: 1_000,
            },
            ..Self::default()
        }
    }

    /// Validate the configuration for consistency and correctness
    pub fn validate(&self) -> Result<()> {
        let connection = &self.connection;
        if connection.ws_url.trim().is_empty() {
            return Err(SentinelError::config_error("ws_url must not be empty"));
        }
        if connection.connect_timeout_ms == 0 {
            return Err(SentinelError::config_error(
                "connect timeout must be greater than 0",
            ));
        }
        if connection.heartbeat_interval_ms == 0 || connection.heartbeat_timeout_ms == 0 {
            return Err(SentinelError::config_error(
                "heartbeat interval and timeout must be greater than 0",
            ));
        }

        let reconnect = &connection.reconnect;
        if reconnect.base_delay_ms == 0 {
            return Err(SentinelError::config_error(
                "reconnect base delay must be greater than 0",
            ));
        }
        if reconnect.base_delay_ms > reconnect.max_delay_ms {
            return Err(SentinelError::config_error(format!(
                "reconnect base delay ({}ms) exceeds max delay ({}ms)",
                reconnect.base_delay_ms, reconnect.max_delay_ms
            )));
        }

        if self.poller.interval_ms == 0 {
            return Err(SentinelError::config_error(
                "poll interval must be greater than 0",
            ));
        }
        if self.poller.fetch_limit == 0 {
            return Err(SentinelError::config_error(
                "fetch limit must be greater than 0",
            ));
        }
        if self.router.seen_capacity == 0 {
            return Err(SentinelError::config_error(
                "seen capacity must be greater than 0",
            ));
        }
        if self.crypto.key_store_id.trim().is_empty() {
            return Err(SentinelError::config_error("key store id must not be empty"));
        }
        if self.api.api_base_url.trim().is_empty() {
            return Err(SentinelError::config_error("api base url must not be empty"));
        }
        if self.api.request_timeout_ms == 0 {
            return Err(SentinelError::config_error(
                "request timeout must be greater than 0",
            ));
        }

        Ok(())
    }
}

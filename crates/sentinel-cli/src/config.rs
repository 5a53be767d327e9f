//! Sentinel CLI Configuration Management
//!
//! Configuration is layered with figment, lowest priority first:
//! - built-in defaults
//! - `sentinel.toml` in the working directory
//! - `~/.sentinel/config.toml`
//! - an explicit `--config` file
//! - `SENTINEL_*` environment variables, nested with `__`
//!   (e.g. `SENTINEL_CORE__API__API_SECRET`)
//! - the deployment's plain variables (`WS_HOST`, `WS_PORT`, `API_BASE_URL`,
//!   `API_SECRET`, `DEFAULT_ROOM`, `BOT_HANDLE`)
//! - command line flags

use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use sentinel_core::SentinelConfig;

use crate::cli::Cli;

/// Port of the live connection server when only `WS_HOST` is given
pub const DEFAULT_WS_PORT: u16 = 8420;

// ----------------------------------------------------------------------------
// CLI Application Configuration
// ----------------------------------------------------------------------------

/// Complete configuration for the Sentinel CLI
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliAppConfig {
    /// Client transport, crypto and API settings
    pub core: SentinelConfig,

    pub identity: IdentityConfig,

    pub session: SessionConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Handle this client speaks as
    pub handle: String,

    /// Key pair file; defaults to ~/.sentinel/keypair.json
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Room joined by `run` when none is given
    pub default_room: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            handle: "ChatBot".to_string(),
            key_file: None,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_room: sentinel_runtime::DEFAULT_ROOM.to_string(),
        }
    }
}

// ----------------------------------------------------------------------------
// Configuration Loading Logic
// ----------------------------------------------------------------------------

impl CliAppConfig {
    /// Load with every layer, including command line overrides
    pub fn load(cli: &Cli) -> Result<Self, ConfigError> {
        let mut figment = Self::base_figment();
        if let Some(path) = &cli.config {
            if !path.exists() {
                return Err(ConfigError::Loading(format!(
                    "configuration file {} does not exist",
                    path.display()
                )));
            }
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed("SENTINEL_").split("__"));
        figment = apply_legacy_env(figment, |name| std::env::var(name).ok());

        if let Some(handle) = &cli.handle {
            figment = figment.merge(("identity.handle", handle));
        }
        if let Some(ws_url) = &cli.ws_url {
            figment = figment.merge(("core.connection.ws_url", ws_url));
        }
        if let Some(api_url) = &cli.api_url {
            figment = figment.merge(("core.api.api_base_url", api_url));
        }
        if let Some(key_file) = &cli.key_file {
            figment = figment.merge(("identity.key_file", key_file));
        }

        Self::extract(figment)
    }

    /// Defaults plus the two well-known files
    fn base_figment() -> Figment {
        let mut figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file("sentinel.toml"));
        if let Some(path) = Self::default_config_path() {
            figment = figment.merge(Toml::file(path));
        }
        figment
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        let config: CliAppConfig = figment
            .extract()
            .map_err(|e| ConfigError::Loading(format!("Failed to load configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a single file over the defaults
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()));
        Self::extract(figment)
    }

    /// `~/.sentinel`
    pub fn data_dir() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".sentinel"))
    }

    pub fn default_config_path() -> Option<PathBuf> {
        Self::data_dir().map(|dir| dir.join("config.toml"))
    }

    /// Key pair file in effect
    pub fn key_file(&self) -> Option<PathBuf> {
        self.identity
            .key_file
            .clone()
            .or_else(|| Self::data_dir().map(|dir| dir.join("keypair.json")))
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self)
            .map_err(|e| ConfigError::Serialization(format!("Failed to serialize config: {}", e)))
    }

    /// Save to the default config file
    pub fn save(&self) -> Result<PathBuf, ConfigError> {
        let path = Self::default_config_path()
            .ok_or_else(|| ConfigError::Environment("no home directory".to_string()))?;
        self.save_to_file(&path)?;
        Ok(path)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ConfigError::FileSystem(format!("Failed to create config directory: {}", e))
            })?;
        }
        std::fs::write(path.as_ref(), self.to_toml()?)
            .map_err(|e| ConfigError::FileSystem(format!("Failed to write config file: {}", e)))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.identity.handle.trim().is_empty() {
            return Err(ConfigError::Validation(
                "identity handle must not be empty".to_string(),
            ));
        }
        if self.session.default_room.trim().is_empty() {
            return Err(ConfigError::Validation(
                "default room must not be empty".to_string(),
            ));
        }
        self.core
            .validate()
            .map_err(|e| ConfigError::Validation(e.to_string()))
    }
}

/// Merge the deployment's plain environment variables, read through `lookup`
pub fn apply_legacy_env<F>(mut figment: Figment, lookup: F) -> Figment
where
    F: Fn(&str) -> Option<String>,
{
    let non_empty = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

    if let Some(host) = non_empty("WS_HOST") {
        let port = non_empty("WS_PORT")
            .and_then(|port| port.trim().parse::<u16>().ok())
            .unwrap_or(DEFAULT_WS_PORT);
        figment = figment.merge(("core.connection.ws_url", format!("ws://{}:{}", host, port)));
    }
    if let Some(url) = non_empty("API_BASE_URL") {
        figment = figment.merge(("core.api.api_base_url", url));
    }
    if let Some(secret) = non_empty("API_SECRET") {
        figment = figment.merge(("core.api.api_secret", secret));
    }
    if let Some(room) = non_empty("DEFAULT_ROOM") {
        figment = figment.merge(("session.default_room", room));
    }
    if let Some(handle) = non_empty("BOT_HANDLE") {
        figment = figment.merge(("identity.handle", handle));
    }
    figment
}

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// Configuration-related errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration loading error: {0}")]
    Loading(String),

    #[error("Configuration validation error: {0}")]
    Validation(String),

    #[error("Environment error: {0}")]
    Environment(String),

    #[error("File system error: {0}")]
    FileSystem(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn defaults() -> Figment {
        Figment::new().merge(Serialized::defaults(CliAppConfig::default()))
    }

    fn with_env(vars: &[(&str, &str)]) -> CliAppConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let figment = apply_legacy_env(defaults(), |name| vars.get(name).cloned());
        CliAppConfig::extract(figment).unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = CliAppConfig::default();
        assert_eq!(config.identity.handle, "ChatBot");
        assert_eq!(config.session.default_room, "lobby");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_legacy_host_and_port() {
        let config = with_env(&[("WS_HOST", "chat.example.com"), ("WS_PORT", "9000")]);
        assert_eq!(config.core.connection.ws_url, "ws://chat.example.com:9000");

        let config = with_env(&[("WS_HOST", "chat.example.com")]);
        assert_eq!(config.core.connection.ws_url, "ws://chat.example.com:8420");
    }

    #[test]
    fn test_legacy_api_room_and_handle() {
        let config = with_env(&[
            ("API_BASE_URL", "https://example.com/iChat/api"),
            ("API_SECRET", "s3cret"),
            ("DEFAULT_ROOM", "general"),
            ("BOT_HANDLE", "Sentinel"),
        ]);
        assert_eq!(config.core.api.api_base_url, "https://example.com/iChat/api");
        assert_eq!(config.core.api.api_secret, "s3cret");
        assert_eq!(config.session.default_room, "general");
        assert_eq!(config.identity.handle, "Sentinel");
    }

    #[test]
    fn test_empty_legacy_values_are_ignored() {
        let config = with_env(&[("WS_HOST", ""), ("BOT_HANDLE", "  ")]);
        assert_eq!(config, CliAppConfig::default());
    }

    #[test]
    fn test_file_layer_and_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[identity]\nhandle = \"alice\"\n\n[core.poller]\ninterval_ms = 2500\n",
        )
        .unwrap();

        let config = CliAppConfig::load_from_file(&path).unwrap();
        assert_eq!(config.identity.handle, "alice");
        assert_eq!(config.core.poller.interval_ms, 2500);
        assert_eq!(config.core.poller.fetch_limit, 50);

        let saved = dir.path().join("nested").join("saved.toml");
        config.save_to_file(&saved).unwrap();
        assert_eq!(CliAppConfig::load_from_file(&saved).unwrap(), config);
    }

    #[test]
    fn test_invalid_file_values_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[core.poller]\ninterval_ms = 0\n").unwrap();
        assert!(matches!(
            CliAppConfig::load_from_file(&path),
            Err(ConfigError::Validation(_))
        ));
    }
}

//! Error handling for the Sentinel CLI

use thiserror::Error;

use crate::config::ConfigError;

/// CLI-specific error types
#[derive(Error, Debug)]
pub enum CliError {
    #[error("Sentinel error: {0}")]
    Sentinel(#[from] sentinel_core::SentinelError),

    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("Send failed: {0}")]
    Send(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;

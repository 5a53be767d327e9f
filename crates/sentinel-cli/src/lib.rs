//! Sentinel CLI Library
//!
//! Command-line client for the Sentinel chat transport: layered
//! configuration, argument parsing and the command handlers.

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;

pub use cli::{Cli, Commands};
pub use commands::CommandDispatcher;
pub use config::{CliAppConfig, ConfigError};
pub use error::{CliError, Result};

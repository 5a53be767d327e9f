//! Command-line interface definitions and parsing

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Additional configuration file, applied over the default locations
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Your user handle
    #[arg(long, global = true)]
    pub handle: Option<String>,

    /// Live connection endpoint, e.g. ws://chat.example.com:8420
    #[arg(long, global = true)]
    pub ws_url: Option<String>,

    /// Base URL of the HTTP API
    #[arg(long, global = true)]
    pub api_url: Option<String>,

    /// Key pair file (defaults to ~/.sentinel/keypair.json)
    #[arg(long, global = true)]
    pub key_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Connect and print incoming messages until Ctrl+C
    Run {
        /// Room to join (defaults to the configured room)
        room: Option<String>,
    },
    /// Send a single room message and exit
    Send {
        room: String,
        /// Message text
        text: String,
    },
    /// Send a direct message, encrypted when the peer has a published key
    Im {
        /// Recipient handle
        peer: String,
        /// Message text
        text: String,
    },
    /// Show the local public key and publish it
    Keys,
    /// Print the effective configuration as TOML
    Config {
        /// Also write it to ~/.sentinel/config.toml
        #[arg(long)]
        save: bool,
    },
}

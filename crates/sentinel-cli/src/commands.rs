//! Command handlers for the Sentinel CLI

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use sentinel_core::keystore::{FileKeyStore, KeyStore, MemoryKeyStore};
use sentinel_runtime::{ChatSession, EncryptionKind, PeerId, RoomKey, RoutedEvent, SessionEvent};

use crate::cli::{Cli, Commands};
use crate::config::CliAppConfig;
use crate::error::{CliError, Result};

/// Command dispatcher for handling CLI commands
pub struct CommandDispatcher;

impl CommandDispatcher {
    /// Execute a CLI command
    pub async fn execute(cli: Cli, config: CliAppConfig) -> Result<()> {
        match cli.command {
            Commands::Run { room } => {
                let room = room.unwrap_or_else(|| config.session.default_room.clone());
                Self::handle_run_command(&config, RoomKey::new(room)).await
            }
            Commands::Send { room, text } => {
                Self::handle_send_command(&config, RoomKey::new(room), &text).await
            }
            Commands::Im { peer, text } => {
                Self::handle_im_command(&config, PeerId::new(peer), &text).await
            }
            Commands::Keys => Self::handle_keys_command(&config).await,
            Commands::Config { save } => Self::handle_config_command(&config, save),
        }
    }

    /// Connect and print everything that arrives until Ctrl+C
    async fn handle_run_command(config: &CliAppConfig, room: RoomKey) -> Result<()> {
        let session = build_session(config)?;
        let mut routed = session.subscribe_routed();
        let mut events = session.subscribe_session();

        info!("Joining {} as {}", room, session.user());
        session.start(room).await?;

        loop {
            tokio::select! {
                event = routed.recv() => match event {
                    Ok(event) => print_routed(&event),
                    Err(RecvError::Lagged(skipped)) => warn!("Dropped {} routed events", skipped),
                    Err(RecvError::Closed) => break,
                },
                event = events.recv() => match event {
                    Ok(event) => print_session(&event),
                    Err(RecvError::Lagged(skipped)) => warn!("Dropped {} session events", skipped),
                    Err(RecvError::Closed) => break,
                },
                signal = tokio::signal::ctrl_c() => {
                    signal?;
                    info!("Interrupted, disconnecting");
                    break;
                }
            }
        }

        session.disconnect()?;
        let stats = session.router_stats().await;
        info!(
            "Ingested {} messages ({} duplicates, {} unreadable)",
            stats.ingested, stats.duplicates, stats.unreadable
        );
        session.shutdown().await?;
        Ok(())
    }

    async fn handle_send_command(config: &CliAppConfig, room: RoomKey, text: &str) -> Result<()> {
        let session = build_session(config)?;
        let result = session.send_room_message(&room, text).await;
        session.shutdown().await?;

        result.map_err(|e| CliError::Send(e.to_string()))?;
        println!("Sent to {}", room);
        Ok(())
    }

    async fn handle_im_command(config: &CliAppConfig, peer: PeerId, text: &str) -> Result<()> {
        let session = build_session(config)?;
        let result = session.send_direct_message(&peer, text).await;
        session.shutdown().await?;

        let kind = result.map_err(|e| CliError::Send(e.to_string()))?;
        if kind != EncryptionKind::None {
            println!("Sent encrypted message to {}", peer);
        } else {
            println!("Sent to {} without encryption (no published key)", peer);
        }
        Ok(())
    }

    /// Print the local public key and publish it
    async fn handle_keys_command(config: &CliAppConfig) -> Result<()> {
        let session = build_session(config)?;
        let crypto = session.crypto().clone();
        let key_pair = crypto
            .ensure_key_pair()
            .map_err(sentinel_core::SentinelError::from)?;
        let public_key = key_pair.public_key();

        println!("Handle:      {}", session.user());
        println!("Public key:  {}", public_key.to_base64());
        println!("Fingerprint: {}", public_key.fingerprint());
        if let Some(path) = config.key_file() {
            println!("Key file:    {}", path.display());
        }

        let registered = crypto.register_public_key().await;
        session.shutdown().await?;
        match registered {
            Ok(()) => println!("Published to the key registry"),
            Err(e) => println!("Publishing failed: {}", e),
        }
        Ok(())
    }

    fn handle_config_command(config: &CliAppConfig, save: bool) -> Result<()> {
        print!("{}", config.to_toml()?);
        if save {
            let path = config.save()?;
            println!("# saved to {}", path.display());
        }
        Ok(())
    }
}

/// Session for the configured identity, persisting its key pair to disk
pub fn build_session(config: &CliAppConfig) -> Result<ChatSession> {
    let key_store: Arc<dyn KeyStore> = match config.key_file() {
        Some(path) => Arc::new(FileKeyStore::new(path)),
        None => {
            warn!("No home directory, the key pair will not be persisted");
            Arc::new(MemoryKeyStore::new())
        }
    };

    let session = ChatSession::builder(PeerId::new(config.identity.handle.clone()))
        .with_config(config.core.clone())
        .with_key_store(key_store)
        .build()?;
    Ok(session)
}

fn print_routed(event: &RoutedEvent) {
    match event {
        RoutedEvent::Message(message) => {
            let lock = if message.encryption != EncryptionKind::None {
                " [e2e]"
            } else {
                ""
            };
            println!("[{}] <{}>{} {}", message.room, message.sender, lock, message.text);
        }
        RoutedEvent::Unreadable {
            room,
            sender,
            reason,
            ..
        } => {
            println!("[{}] <{}> (unreadable: {})", room, sender, reason);
        }
        RoutedEvent::DirectDelivered { im_id, to_user } => {
            println!("* delivered {} to {}", im_id, to_user);
        }
        RoutedEvent::Presence { room, users } => {
            println!("* {} online in {}", users.len(), room);
        }
    }
}

fn print_session(event: &SessionEvent) {
    match event {
        SessionEvent::StateChanged(state) => info!("Connection: {}", state),
        SessionEvent::Joined { room } => println!("* joined {}", room),
        SessionEvent::ServerError { message } => println!("! server error: {}", message),
        SessionEvent::PresenceChanged { room_id } => {
            info!("Presence changed in {}", room_id.as_deref().unwrap_or("all rooms"));
        }
    }
}

//! Live socket collaborator
//!
//! The connection manager never touches a websocket directly. A
//! [`SocketConnector`] performs the handshake and hands back a
//! [`SocketHandle`] for outbound frames, while inbound traffic arrives as typed
//! [`SocketEvent`]s on a channel owned by the manager.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use sentinel_core::errors::TransportError;
use sentinel_core::protocol::ABNORMAL_CLOSE;

/// Close code reported when the peer sent a close frame without a status
pub const NO_STATUS_CLOSE: u16 = 1005;

// ----------------------------------------------------------------------------
// Events and Commands
// ----------------------------------------------------------------------------

/// Inbound traffic of one live connection. Successful completion of
/// [`SocketConnector::connect`] is the open signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// Connection closed; always the last event of a connection
    Closed { code: u16, reason: String },
    /// Text or binary frame payload
    Message(Vec<u8>),
    /// Transport error; a `Closed` event follows
    Error(String),
}

/// Outbound instruction for the socket writer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketCommand {
    Send(String),
    Close { code: u16 },
}

/// Sending half of an open connection. Dropping it closes the writer.
#[derive(Debug)]
pub struct SocketHandle {
    commands: mpsc::UnboundedSender<SocketCommand>,
}

impl SocketHandle {
    pub fn new(commands: mpsc::UnboundedSender<SocketCommand>) -> Self {
        Self { commands }
    }

    /// Create a handle together with the receiver a writer task drains
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SocketCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn send_text(&self, text: String) -> Result<(), TransportError> {
        self.commands
            .send(SocketCommand::Send(text))
            .map_err(|_| TransportError::send_failed("socket writer has stopped"))
    }

    /// Close with `code`. Consumes the handle.
    pub fn close(self, code: u16) {
        if self.commands.send(SocketCommand::Close { code }).is_err() {
            debug!("Socket writer already stopped before close");
        }
    }
}

// ----------------------------------------------------------------------------
// Handshake
// ----------------------------------------------------------------------------

/// Parameters of the live connection handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub ws_url: String,
    pub user_handle: String,
    /// Short-lived token from the token endpoint
    pub token: String,
    pub room_id: String,
}

impl HandshakeRequest {
    /// `ws_url` with `user_handle`, `token` and `room_id` query parameters
    pub fn to_url(&self) -> Result<String, TransportError> {
        let mut url = url::Url::parse(&self.ws_url).map_err(|e| {
            TransportError::connect_failed(&self.ws_url, format!("invalid url: {}", e))
        })?;
        url.query_pairs_mut()
            .append_pair("user_handle", &self.user_handle)
            .append_pair("token", &self.token)
            .append_pair("room_id", &self.room_id);
        Ok(url.to_string())
    }
}

// ----------------------------------------------------------------------------
// Connector Trait
// ----------------------------------------------------------------------------

/// Opens live connections
#[async_trait]
pub trait SocketConnector: Send + Sync {
    /// Perform the handshake. On success every later inbound event of this
    /// connection is delivered on `events`, ending with exactly one
    /// [`SocketEvent::Closed`].
    async fn connect(
        &self,
        request: &HandshakeRequest,
        events: mpsc::UnboundedSender<SocketEvent>,
    ) -> Result<SocketHandle, TransportError>;
}

// ----------------------------------------------------------------------------
// WebSocket Implementation
// ----------------------------------------------------------------------------

/// `SocketConnector` backed by tokio-tungstenite
#[derive(Debug, Clone, Default)]
pub struct WsConnector;

impl WsConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SocketConnector for WsConnector {
    async fn connect(
        &self,
        request: &HandshakeRequest,
        events: mpsc::UnboundedSender<SocketEvent>,
    ) -> Result<SocketHandle, TransportError> {
        let url = request.to_url()?;
        let (ws_stream, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::connect_failed(&request.ws_url, e.to_string()))?;

        debug!("WebSocket handshake complete for {}", request.user_handle);

        let (mut write, mut read) = ws_stream.split();
        let (handle, mut commands) = SocketHandle::channel();

        // Writer: drains commands until the handle is dropped or closed
        tokio::spawn(async move {
            while let Some(command) = commands.recv().await {
                match command {
                    SocketCommand::Send(text) => {
                        if let Err(e) = write.send(Message::Text(text)).await {
                            warn!("WebSocket send failed: {}", e);
                            break;
                        }
                    }
                    SocketCommand::Close { code } => {
                        let frame = CloseFrame {
                            code: CloseCode::from(code),
                            reason: "".into(),
                        };
                        if let Err(e) = write.send(Message::Close(Some(frame))).await {
                            debug!("WebSocket close frame not sent: {}", e);
                        }
                        break;
                    }
                }
            }
            let _ = write.close().await;
        });

        // Reader: forwards frames, then reports exactly one close
        tokio::spawn(async move {
            let mut closed = None;
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        if events.send(SocketEvent::Message(text.into_bytes())).is_err() {
                            return;
                        }
                    }
                    Ok(Message::Binary(bytes)) => {
                        if events.send(SocketEvent::Message(bytes)).is_err() {
                            return;
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        closed = Some(match frame {
                            Some(frame) => (u16::from(frame.code), frame.reason.into_owned()),
                            None => (NO_STATUS_CLOSE, String::new()),
                        });
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let _ = events.send(SocketEvent::Error(e.to_string()));
                        break;
                    }
                }
            }

            let (code, reason) =
                closed.unwrap_or_else(|| (ABNORMAL_CLOSE, "connection lost".to_string()));
            let _ = events.send(SocketEvent::Closed { code, reason });
        });

        Ok(handle)
    }
}

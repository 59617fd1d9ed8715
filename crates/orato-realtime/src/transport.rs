//! Persistent websocket channel to the realtime endpoint.
//!
//! One tokio task owns the socket; outbound frames arrive over a command
//! channel and inbound frames surface as [`TransportEvent`]s. There is no
//! automatic reconnect: a failed send or an unexpected close is reported to
//! the owning session layer, which alone decides what happens next.

use crate::error::{SessionError, SessionResult};
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// Events surfaced by the transport task.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The socket is open; the session layer may configure it now.
    Open,
    /// One inbound text frame.
    Message(String),
    /// The peer closed the connection (or we did).
    Closed { code: u16, reason: String },
    /// The connection failed; no reconnect is attempted.
    Failure(String),
}

/// Commands accepted by the transport task.
#[derive(Debug)]
pub enum TransportCommand {
    Send(String),
    Close { code: u16, reason: String },
}

/// Cloneable handle for writing to the channel.
#[derive(Clone)]
pub struct TransportHandle {
    open: Arc<AtomicBool>,
    command_tx: mpsc::UnboundedSender<TransportCommand>,
}

impl TransportHandle {
    /// Non-blocking send. Returns `false` when the channel is not open;
    /// callers must treat that as fatal for the operation at hand and surface
    /// a connectivity error rather than continuing silently.
    pub fn send(&self, text: &str) -> bool {
        if !self.open.load(Ordering::Acquire) {
            warn!("cannot send, channel is not open");
            return false;
        }
        self.command_tx
            .send(TransportCommand::Send(text.to_string()))
            .is_ok()
    }

    /// Reason-coded close. The code distinguishes a user-initiated disconnect
    /// from a session restart; diagnostic value only.
    pub fn close(&self, code: u16, reason: &str) {
        self.open.store(false, Ordering::Release);
        let _ = self.command_tx.send(TransportCommand::Close {
            code,
            reason: reason.to_string(),
        });
    }

    /// Whether the socket is currently open.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// A handle wired to nothing but a command receiver. The channel reports
    /// open, so everything "sent" lands in the returned receiver; lets the
    /// barge-in and session paths run without a live endpoint.
    pub fn loopback() -> (Self, mpsc::UnboundedReceiver<TransportCommand>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let handle = Self {
            open: Arc::new(AtomicBool::new(true)),
            command_tx,
        };
        (handle, command_rx)
    }
}

/// Connect to `url` with the given headers. Resolves once the socket is
/// established; the first event on the returned receiver is [`TransportEvent::Open`].
pub async fn connect(
    url: &str,
    headers: &[(String, String)],
) -> SessionResult<(TransportHandle, mpsc::UnboundedReceiver<TransportEvent>)> {
    let mut request = url
        .into_client_request()
        .map_err(|e| SessionError::Config(format!("bad endpoint {}: {}", url, e)))?;
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| SessionError::Config(format!("bad header name {}: {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| SessionError::Config(format!("bad header value: {}", e)))?;
        request.headers_mut().insert(name, value);
    }

    info!("connecting to {}", url);
    let (ws, response) = connect_async(request).await?;
    debug!("websocket established, status {}", response.status());

    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let open = Arc::new(AtomicBool::new(true));

    let _ = event_tx.send(TransportEvent::Open);
    tokio::spawn(run_socket(ws, command_rx, event_tx, Arc::clone(&open)));

    Ok((TransportHandle { open, command_tx }, event_rx))
}

async fn run_socket(
    mut ws: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    mut command_rx: mpsc::UnboundedReceiver<TransportCommand>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
    open: Arc<AtomicBool>,
) {
    loop {
        tokio::select! {
            command = command_rx.recv() => match command {
                Some(TransportCommand::Send(text)) => {
                    if let Err(e) = ws.send(Message::Text(text)).await {
                        error!("websocket send failed: {}", e);
                        open.store(false, Ordering::Release);
                        let _ = event_tx.send(TransportEvent::Failure(e.to_string()));
                        break;
                    }
                }
                Some(TransportCommand::Close { code, reason }) => {
                    debug!("closing websocket: {} {}", code, reason);
                    let frame = CloseFrame {
                        code: code.into(),
                        reason: reason.clone().into(),
                    };
                    let _ = ws.close(Some(frame)).await;
                    open.store(false, Ordering::Release);
                    let _ = event_tx.send(TransportEvent::Closed { code, reason });
                    break;
                }
                None => {
                    // Handle dropped; shut the socket down quietly.
                    let _ = ws.close(None).await;
                    open.store(false, Ordering::Release);
                    break;
                }
            },
            inbound = ws.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    let _ = event_tx.send(TransportEvent::Message(text));
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = match frame {
                        Some(f) => (u16::from(f.code), f.reason.to_string()),
                        None => (1005, String::new()),
                    };
                    info!("websocket closed by peer: {} {}", code, reason);
                    open.store(false, Ordering::Release);
                    let _ = event_tx.send(TransportEvent::Closed { code, reason });
                    break;
                }
                Some(Ok(Message::Binary(bytes))) => {
                    debug!("ignoring binary frame ({} bytes)", bytes.len());
                }
                Some(Ok(_)) => {
                    // Ping/pong handled by the stream itself.
                }
                Some(Err(e)) => {
                    error!("websocket failure: {}", e);
                    open.store(false, Ordering::Release);
                    let _ = event_tx.send(TransportEvent::Failure(e.to_string()));
                    break;
                }
                None => {
                    open.store(false, Ordering::Release);
                    let _ = event_tx.send(TransportEvent::Closed {
                        code: 1006,
                        reason: "stream ended".to_string(),
                    });
                    break;
                }
            },
        }
    }
}

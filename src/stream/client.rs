//! Websocket transport for the realtime endpoint.
//!
//! [`StreamTransport::open`] spawns a background worker that owns the socket.
//! Frames queued on the returned [`TransportSender`] before the socket is
//! open are flushed once it is; every signal coming off the socket (open,
//! text frame, error, close) is delivered in arrival order on one channel.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::debug;

/// Signals produced by the transport worker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    Opened,
    Frame(String),
    Error(String),
    /// Always the last event of a transport.
    Closed { code: Option<u16>, reason: String },
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("timed out opening websocket")]
    Timeout,

    #[error("send queue is closed")]
    SendQueueClosed,
}

#[derive(Debug)]
enum Command {
    Text(String),
    Close,
}

/// Cloneable handle for outbound frames.
#[derive(Clone, Debug)]
pub struct TransportSender {
    tx: mpsc::UnboundedSender<Command>,
}

impl TransportSender {
    pub fn send_text(&self, text: impl Into<String>) -> Result<(), TransportError> {
        self.tx
            .send(Command::Text(text.into()))
            .map_err(|_| TransportError::SendQueueClosed)
    }

    pub fn send_json<T: Serialize>(&self, frame: &T) -> Result<(), TransportError> {
        let text = serde_json::to_string(frame)?;
        self.send_text(text)
    }

    /// Asks the worker to close the socket. Returns immediately.
    pub fn close(&self) {
        let _ = self.tx.send(Command::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Entry point for opening realtime sockets.
#[derive(Clone, Debug)]
pub struct StreamTransport {
    url: String,
    connect_timeout: Duration,
}

impl StreamTransport {
    pub fn new(url: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            connect_timeout,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Spawns the worker and returns its outbound and signal channels.
    ///
    /// Dropping every [`TransportSender`] closes the socket gracefully.
    pub fn open(&self) -> (TransportSender, mpsc::UnboundedReceiver<TransportEvent>) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let url = self.url.clone();
        let connect_timeout = self.connect_timeout;
        tokio::spawn(async move {
            let closed = match run_socket(&url, connect_timeout, outbound_rx, &event_tx).await {
                Ok(closed) => closed,
                Err(err) => {
                    let _ = event_tx.send(TransportEvent::Error(err.to_string()));
                    TransportEvent::Closed {
                        code: None,
                        reason: err.to_string(),
                    }
                }
            };
            debug!(event = "transport_closed", url = %url);
            let _ = event_tx.send(closed);
        });

        (TransportSender { tx: outbound_tx }, event_rx)
    }
}

async fn run_socket(
    url: &str,
    connect_timeout: Duration,
    mut outbound_rx: mpsc::UnboundedReceiver<Command>,
    event_tx: &mpsc::UnboundedSender<TransportEvent>,
) -> Result<TransportEvent, TransportError> {
    let (mut socket, _) = tokio::time::timeout(connect_timeout, connect_async(url))
        .await
        .map_err(|_| TransportError::Timeout)??;
    debug!(event = "transport_opened", url);
    let _ = event_tx.send(TransportEvent::Opened);

    loop {
        tokio::select! {
            maybe_outbound = outbound_rx.recv() => {
                match maybe_outbound {
                    Some(Command::Text(text)) => socket.send(Message::Text(text)).await?,
                    Some(Command::Close) | None => {
                        let _ = socket.close(None).await;
                        return Ok(TransportEvent::Closed {
                            code: None,
                            reason: "closed by client".to_string(),
                        });
                    }
                }
            }
            maybe_inbound = socket.next() => {
                match maybe_inbound {
                    Some(Ok(Message::Text(text))) => {
                        let _ = event_tx.send(TransportEvent::Frame(text));
                    }
                    Some(Ok(Message::Ping(payload))) => socket.send(Message::Pong(payload)).await?,
                    Some(Ok(Message::Close(frame))) => return Ok(closed_by_server(frame)),
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return Err(err.into()),
                    None => {
                        return Ok(TransportEvent::Closed {
                            code: None,
                            reason: "stream ended".to_string(),
                        });
                    }
                }
            }
        }
    }
}

fn closed_by_server(frame: Option<CloseFrame<'static>>) -> TransportEvent {
    match frame {
        Some(frame) => TransportEvent::Closed {
            code: Some(u16::from(frame.code)),
            reason: frame.reason.into_owned(),
        },
        None => TransportEvent::Closed {
            code: None,
            reason: String::new(),
        },
    }
}

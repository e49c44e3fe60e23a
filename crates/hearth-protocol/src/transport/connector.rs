//! Opening a link to the relay server.
//!
//! A [`Link`] is a pair of channels bridged to the socket by two tasks. The
//! transport only ever sees [`WireEvent`]s; framing and JSON live here.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::error::ProtocolError;
use crate::wire::WireEvent;

const LINK_BUFFER: usize = 128;

/// An open connection. Dropping `outgoing` closes the socket; `incoming`
/// yields `None` once the socket is gone.
pub struct Link {
    pub outgoing: mpsc::Sender<WireEvent>,
    pub incoming: mpsc::Receiver<WireEvent>,
}

impl Link {
    /// Two links wired back to back. The first is handed to the transport,
    /// the second plays the server.
    pub fn pair(buffer: usize) -> (Self, Self) {
        let (client_tx, server_rx) = mpsc::channel(buffer);
        let (server_tx, client_rx) = mpsc::channel(buffer);
        (
            Self {
                outgoing: client_tx,
                incoming: client_rx,
            },
            Self {
                outgoing: server_tx,
                incoming: server_rx,
            },
        )
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Link, ProtocolError>;
}

/// Connects with `tokio-tungstenite`; one JSON event per text frame.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<Link, ProtocolError> {
        let (stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| ProtocolError::TransportDropped(format!("connect {url}: {e}")))?;
        tracing::debug!(url, "websocket opened");

        let (mut write, mut read) = stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<WireEvent>(LINK_BUFFER);
        let (in_tx, in_rx) = mpsc::channel::<WireEvent>(LINK_BUFFER);

        tokio::spawn(async move {
            while let Some(event) = out_rx.recv().await {
                let text = match event.encode() {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::error!(event = event.name(), error = %e, "dropping unencodable event");
                        continue;
                    }
                };
                if let Err(e) = write.send(WsMessage::Text(text)).await {
                    tracing::debug!(error = %e, "websocket write failed");
                    break;
                }
            }
            let _ = write.close().await;
        });

        tokio::spawn(async move {
            while let Some(message) = read.next().await {
                match message {
                    Ok(WsMessage::Text(text)) => match WireEvent::decode(&text) {
                        Ok(event) => {
                            if in_tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, "ignoring malformed frame"),
                    },
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!(error = %e, "websocket read failed");
                        break;
                    }
                }
            }
        });

        Ok(Link {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}

/// Channel-backed connector. Each successful connect hands the server end of
/// a fresh [`Link::pair`] to the receiver returned by [`MemoryConnector::new`].
pub struct MemoryConnector {
    online: AtomicBool,
    attempts: AtomicU32,
    servers: mpsc::UnboundedSender<Link>,
}

impl MemoryConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Link>) {
        let (servers, accepted) = mpsc::unbounded_channel();
        (
            Self {
                online: AtomicBool::new(true),
                attempts: AtomicU32::new(0),
                servers,
            },
            accepted,
        )
    }

    /// While offline every connect attempt fails.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Connect attempts so far, successful or not.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, url: &str) -> Result<Link, ProtocolError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if !self.online.load(Ordering::SeqCst) {
            return Err(ProtocolError::TransportDropped(format!("{url} unreachable")));
        }
        let (client, server) = Link::pair(LINK_BUFFER);
        self.servers
            .send(server)
            .map_err(|_| ProtocolError::TransportDropped(format!("{url} not accepting")))?;
        Ok(client)
    }
}

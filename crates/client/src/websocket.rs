//! tokio-tungstenite implementation of the [`Transport`] contract.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::transport::{MessageHandler, Transport};

/// WebSocket transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Connection timeout per relay.
    pub connect_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
        }
    }
}

struct Connection {
    out_tx: mpsc::UnboundedSender<Message>,
    connected: Arc<AtomicBool>,
    handler: Arc<std::sync::RwLock<Option<MessageHandler>>>,
}

/// A WebSocket transport over tokio-tungstenite.
///
/// Each open connection runs a writer task draining an outbound channel and
/// a reader task feeding the attached message handler. A connection that
/// drops spontaneously is observed as disconnected on the next
/// `is_connected` call.
pub struct WebSocketTransport {
    config: TransportConfig,
    connections: RwLock<HashMap<String, Connection>>,
}

impl WebSocketTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            connections: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new(TransportConfig::default())
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn start(&self) {
        debug!("websocket transport started");
    }

    async fn stop(&self) {
        let uris: Vec<String> = self.connections.read().await.keys().cloned().collect();
        for uri in uris {
            self.close(&uri).await;
        }
        debug!("websocket transport stopped");
    }

    async fn open(&self, uri: &str) {
        match Url::parse(uri) {
            Ok(url) if url.scheme() == "ws" || url.scheme() == "wss" => {}
            Ok(url) => {
                error!("refusing to open {uri}: scheme {} is not ws/wss", url.scheme());
                return;
            }
            Err(e) => {
                error!("refusing to open {uri}: {e}");
                return;
            }
        }

        if self.is_connected(uri).await {
            debug!("already connected to {uri}");
            return;
        }

        info!("connecting to relay: {uri}");
        let stream = match timeout(self.config.connect_timeout, connect_async(uri)).await {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(e)) => {
                error!("failed to connect to {uri}: {e}");
                return;
            }
            Err(_) => {
                error!(
                    "connection to {uri} timed out after {:?}",
                    self.config.connect_timeout
                );
                return;
            }
        };

        let (mut sink, mut source) = stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let connected = Arc::new(AtomicBool::new(true));
        let handler: Arc<std::sync::RwLock<Option<MessageHandler>>> =
            Arc::new(std::sync::RwLock::new(None));

        // Writer: drain the outbound channel into the socket.
        let writer_connected = Arc::clone(&connected);
        let writer_uri = uri.to_string();
        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(e) = sink.send(message).await {
                    warn!("send to {writer_uri} failed: {e}");
                    break;
                }
                if closing {
                    break;
                }
            }
            writer_connected.store(false, Ordering::SeqCst);
        });

        // Reader: feed inbound text frames to the attached handler.
        let reader_connected = Arc::clone(&connected);
        let reader_handler = Arc::clone(&handler);
        let reader_out_tx = out_tx.clone();
        let reader_uri = uri.to_string();
        tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                match frame {
                    Ok(Message::Text(payload)) => {
                        let handler = reader_handler
                            .read()
                            .ok()
                            .and_then(|slot| slot.clone());
                        match handler {
                            Some(handler) => handler(payload),
                            None => debug!("dropping frame from {reader_uri}: no handler"),
                        }
                    }
                    Ok(Message::Ping(data)) => {
                        let _ = reader_out_tx.send(Message::Pong(data));
                    }
                    Ok(Message::Close(_)) => {
                        info!("relay closed connection: {reader_uri}");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("receive from {reader_uri} failed: {e}");
                        break;
                    }
                }
            }
            reader_connected.store(false, Ordering::SeqCst);
        });

        let connection = Connection {
            out_tx,
            connected,
            handler,
        };
        self.connections
            .write()
            .await
            .insert(uri.to_string(), connection);
        info!("connected to relay: {uri}");
    }

    async fn close(&self, uri: &str) {
        let connection = self.connections.write().await.remove(uri);
        if let Some(connection) = connection {
            let _ = connection.out_tx.send(Message::Close(Some(CloseFrame {
                code: CloseCode::Away,
                reason: "closing connection".into(),
            })));
            connection.connected.store(false, Ordering::SeqCst);
            info!("disconnected from relay: {uri}");
        }
    }

    async fn is_connected(&self, uri: &str) -> bool {
        self.connections
            .read()
            .await
            .get(uri)
            .map(|c| c.connected.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    async fn send(&self, message: &str, uri: &str) -> (String, bool) {
        let connections = self.connections.read().await;
        let Some(connection) = connections.get(uri) else {
            return (uri.to_string(), false);
        };
        if !connection.connected.load(Ordering::SeqCst) {
            return (uri.to_string(), false);
        }
        debug!("sending to {uri}: {message}");
        let ok = connection
            .out_tx
            .send(Message::Text(message.to_string()))
            .is_ok();
        (uri.to_string(), ok)
    }

    async fn receive(&self, uri: &str, handler: MessageHandler) {
        if let Some(connection) = self.connections.read().await.get(uri) {
            if let Ok(mut slot) = connection.handler.write() {
                *slot = Some(handler);
            }
        } else {
            warn!("cannot attach handler: no connection to {uri}");
        }
    }
}

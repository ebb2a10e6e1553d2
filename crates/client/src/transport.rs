//! The duplex text-channel contract relays are reached through.

use async_trait::async_trait;
use std::sync::Arc;

/// Callback invoked with the raw UTF-8 payload of each inbound text frame.
pub type MessageHandler = Arc<dyn Fn(String) + Send + Sync>;

/// A duplex text channel per URI.
///
/// Implementations own the connection lifecycle; callers observe it through
/// `is_connected`. `send` reports `false` on any immediate dispatch error,
/// including "not connected". At most one message handler is attached per
/// URI; attaching another replaces it.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start the transport. Must be called before any other method.
    async fn start(&self);

    /// Stop the transport, closing any open connections.
    async fn stop(&self);

    /// Open a connection to the given URI. Failure is observed via
    /// `is_connected`.
    async fn open(&self, uri: &str);

    /// Close the connection to the given URI.
    async fn close(&self, uri: &str);

    /// Whether the connection to the given URI is up.
    async fn is_connected(&self, uri: &str) -> bool;

    /// Send a message to the given URI. Returns the URI and whether the
    /// message was dispatched.
    async fn send(&self, message: &str, uri: &str) -> (String, bool);

    /// Attach a message handler for inbound frames from the given URI.
    async fn receive(&self, uri: &str, handler: MessageHandler);

    /// Attach a message handler and send in one call.
    async fn send_with_handler(
        &self,
        message: &str,
        uri: &str,
        handler: MessageHandler,
    ) -> (String, bool) {
        self.receive(uri, handler).await;
        self.send(message, uri).await
    }
}

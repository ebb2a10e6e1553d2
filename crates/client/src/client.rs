//! The top-level client: a service composed with a signer.

use std::sync::Arc;

use weft_core::{Event, Filters};

use crate::error::Result;
use crate::remote_signer::RemoteSigner;
use crate::service::{NostrService, PubSub, ServiceConfig};
use crate::signer::{LocalSigner, Signer};
use crate::subscriptions::SubscriptionHandlers;
use crate::transport::Transport;
use crate::websocket::{TransportConfig, WebSocketTransport};

/// A Nostr client: the relay fabric plus a signer.
///
/// Build one with [`NostrClient::builder`]. The service half can be shared
/// independently (e.g. with a [`RemoteSigner`]) via [`NostrClient::service`].
pub struct NostrClient {
    service: Arc<NostrService>,
    signer: Arc<dyn Signer>,
}

impl NostrClient {
    pub fn builder() -> NostrClientBuilder {
        NostrClientBuilder::default()
    }

    /// Compose a client from an existing service and signer.
    pub fn from_parts(service: Arc<NostrService>, signer: Arc<dyn Signer>) -> Self {
        Self { service, signer }
    }

    /// The underlying relay fabric.
    pub fn service(&self) -> Arc<NostrService> {
        Arc::clone(&self.service)
    }

    /// Start the underlying transport. Call once before anything else.
    pub async fn start(&self) {
        self.service.start().await;
    }

    /// Stop the underlying transport.
    pub async fn shutdown(&self) {
        self.service.shutdown().await;
    }

    /// Connect to the default relays.
    pub async fn connect(&self) -> Result<Vec<String>> {
        self.service.connect().await
    }

    /// Connect to the given relays.
    pub async fn connect_relays(&self, relays: &[String]) -> Result<Vec<String>> {
        self.service.connect_relays(relays).await
    }

    /// Disconnect from every active relay.
    pub async fn disconnect(&self) -> Result<()> {
        self.service.disconnect().await
    }

    /// Disconnect from the given relays.
    pub async fn disconnect_relays(&self, relays: &[String]) -> Result<()> {
        self.service.disconnect_relays(relays).await
    }

    pub fn active_relays(&self) -> Vec<String> {
        self.service.active_relays()
    }

    pub fn default_relays(&self) -> &[String] {
        self.service.default_relays()
    }

    pub fn is_connected(&self, uri: &str) -> bool {
        self.service.is_connected(uri)
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.service.subscriptions()
    }

    /// Sign the event with the configured signer, then publish it to every
    /// active relay. Returns `(accepted, failed)` relay URIs.
    pub async fn publish(&self, event: &mut Event) -> Result<(Vec<String>, Vec<String>)> {
        self.signer.sign(event).await?;
        self.service.publish(event).await
    }

    /// Batch query: aggregate stored events from every active relay,
    /// de-duplicated by event id.
    pub async fn query(&self, filters: Filters) -> Result<Vec<Event>> {
        self.service.query(filters).await
    }

    /// Streaming query: deliver matching events to the handlers as they
    /// arrive. The caller must eventually close the returned subscription.
    pub async fn subscribe(
        &self,
        filters: Filters,
        handlers: SubscriptionHandlers,
    ) -> Result<String> {
        self.service.subscribe(filters, handlers).await
    }

    /// Close a subscription on every relay it is live on.
    pub async fn unsubscribe(&self, sub_id: &str) -> Result<(Vec<String>, Vec<String>)> {
        self.service.unsubscribe(sub_id).await
    }

    /// Close a subscription on a single relay.
    pub async fn unsubscribe_relay(&self, sub_id: &str, uri: &str) -> Result<bool> {
        self.service.unsubscribe_relay(sub_id, uri).await
    }

    /// Close every live subscription; returns the ids that could not be
    /// fully closed.
    pub async fn unsubscribe_all(&self) -> Result<Vec<String>> {
        self.service.unsubscribe_all().await
    }
}

/// Builds a [`NostrClient`] from its parts, defaulting what is not given:
/// a WebSocket transport, and a freshly generated local signer.
#[derive(Default)]
pub struct NostrClientBuilder {
    transport: Option<Arc<dyn Transport>>,
    transport_config: Option<TransportConfig>,
    signer: Option<Arc<dyn Signer>>,
    remote_signer_token: Option<String>,
    default_relays: Vec<String>,
    service_config: Option<ServiceConfig>,
}

impl NostrClientBuilder {
    /// Use a custom transport instead of the WebSocket default.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Configure the default WebSocket transport.
    pub fn transport_config(mut self, config: TransportConfig) -> Self {
        self.transport_config = Some(config);
        self
    }

    /// Sign with the given signer instead of a generated local one.
    pub fn signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Sign through the remote signer described by a `bunker://` token.
    pub fn remote_signer_token(mut self, token: impl Into<String>) -> Self {
        self.remote_signer_token = Some(token.into());
        self
    }

    /// The relays to connect to when no explicit set is given.
    pub fn default_relays<I, S>(mut self, relays: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.default_relays = relays.into_iter().map(Into::into).collect();
        self
    }

    pub fn service_config(mut self, config: ServiceConfig) -> Self {
        self.service_config = Some(config);
        self
    }

    pub fn build(self) -> Result<NostrClient> {
        let transport = self.transport.unwrap_or_else(|| {
            Arc::new(WebSocketTransport::new(
                self.transport_config.unwrap_or_default(),
            ))
        });

        let service = Arc::new(NostrService::with_config(
            transport,
            self.default_relays,
            self.service_config.unwrap_or_default(),
        ));

        let signer: Arc<dyn Signer> = if let Some(token) = self.remote_signer_token {
            let pubsub: Arc<dyn PubSub> = Arc::clone(&service) as Arc<dyn PubSub>;
            Arc::new(RemoteSigner::from_token(pubsub, &token)?)
        } else if let Some(signer) = self.signer {
            signer
        } else {
            Arc::new(LocalSigner::generate()?)
        };

        Ok(NostrClient { service, signer })
    }
}

//! The relay fabric service: publishing, querying, and subscription
//! lifecycle over a pool of relay connections.

use async_trait::async_trait;
use futures::future::join_all;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use weft_core::{ClientMessage, Event, EventError, Filters};

use crate::error::Result;
use crate::pool::RelayPool;
use crate::router::MessageRouter;
use crate::subscriptions::SubscriptionHandlers;
use crate::transport::Transport;

/// Bounds on the stored-event limit for batch queries.
const MIN_BATCH_LIMIT: u32 = 1;
const MAX_BATCH_LIMIT: u32 = 64;
const DEFAULT_BATCH_LIMIT: u32 = 16;

/// Service configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// How long a batch query waits for every relay to drain before treating
    /// the stragglers as closed.
    pub query_timeout: Duration,
    /// How long a publish waits for per-relay acknowledgements before
    /// counting the silent relays as failed.
    pub publish_timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            query_timeout: Duration::from_secs(30),
            publish_timeout: Duration::from_secs(10),
        }
    }
}

/// The narrow publish/subscribe capability the remote-signer broker
/// consumes. Implemented by [`NostrService`].
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Publish a signed event; returns `(accepted, failed)` relay URIs.
    async fn publish(&self, event: &Event) -> Result<(Vec<String>, Vec<String>)>;

    /// Open a streaming subscription; returns its id.
    async fn subscribe(&self, filters: Filters, handlers: SubscriptionHandlers)
        -> Result<String>;

    /// The relays a subscription is live on.
    async fn subscription_relays(&self, sub_id: &str) -> Vec<String>;

    /// Close a subscription on every relay it is live on.
    async fn unsubscribe(&self, sub_id: &str) -> Result<(Vec<String>, Vec<String>)>;
}

/// A concurrent multi-relay Nostr service.
///
/// Owns the transport, the connection pool, and the frame router. Signing is
/// layered on top (see `NostrClient`): events handed to [`publish`] must
/// already carry a signature.
///
/// [`publish`]: NostrService::publish
pub struct NostrService {
    transport: Arc<dyn Transport>,
    pool: RelayPool,
    router: Arc<MessageRouter>,
    config: ServiceConfig,
}

impl NostrService {
    pub fn new(transport: Arc<dyn Transport>, default_relays: Vec<String>) -> Self {
        Self::with_config(transport, default_relays, ServiceConfig::default())
    }

    pub fn with_config(
        transport: Arc<dyn Transport>,
        default_relays: Vec<String>,
        config: ServiceConfig,
    ) -> Self {
        let pool = RelayPool::new(Arc::clone(&transport), default_relays);
        Self {
            transport,
            pool,
            router: Arc::new(MessageRouter::new()),
            config,
        }
    }

    /// Start the underlying transport. Call once before anything else.
    pub async fn start(&self) {
        self.transport.start().await;
    }

    /// Stop the underlying transport, closing every connection.
    pub async fn shutdown(&self) {
        self.transport.stop().await;
    }

    /// The relays used when no explicit set is given.
    pub fn default_relays(&self) -> &[String] {
        self.pool.default_relays()
    }

    /// The relays currently active.
    pub fn active_relays(&self) -> Vec<String> {
        self.pool.active()
    }

    /// Whether the given relay is active.
    pub fn is_connected(&self, uri: &str) -> bool {
        self.pool.is_connected(uri)
    }

    /// The ids of every live subscription.
    pub fn subscriptions(&self) -> Vec<String> {
        self.router.subscriptions.ids()
    }

    /// Connect to the default relays.
    pub async fn connect(&self) -> Result<Vec<String>> {
        let relays = self.pool.default_relays().to_vec();
        self.connect_relays(&relays).await
    }

    /// Connect to the given relays in parallel; already-active relays are
    /// left alone. Returns the active set.
    pub async fn connect_relays(&self, relays: &[String]) -> Result<Vec<String>> {
        info!("attempting to connect to {} relays", relays.len());
        let active = self.pool.open(relays).await;

        // Route every frame each connection produces through the demux.
        for uri in &active {
            self.transport
                .receive(uri, self.router.handler(uri))
                .await;
        }
        Ok(active)
    }

    /// Disconnect from every active relay.
    pub async fn disconnect(&self) -> Result<()> {
        let active = self.pool.active();
        if active.is_empty() {
            info!("no active relay connections to close");
            return Ok(());
        }
        self.disconnect_relays(&active).await
    }

    /// Disconnect from the given relays in parallel, dropping the
    /// subscription bookkeeping tied to them.
    pub async fn disconnect_relays(&self, relays: &[String]) -> Result<()> {
        info!("disconnecting from {} relays", relays.len());
        let closed = self.pool.close(relays).await;
        for uri in &closed {
            self.router.subscriptions.drop_relay(uri);
        }
        Ok(())
    }

    /// Publish a signed event to every active relay.
    ///
    /// Each relay's outcome is its `OK` acknowledgement: acceptance lands the
    /// relay in the first list, rejection or transport failure in the
    /// second. Relays that stay silent past the publish timeout count as
    /// failed.
    pub async fn publish(&self, event: &Event) -> Result<(Vec<String>, Vec<String>)> {
        if event.id.is_empty() {
            return Err(EventError::MissingId.into());
        }
        if event.sig.is_empty() {
            return Err(EventError::MissingSignature.into());
        }

        let frame = ClientMessage::event(event.clone()).to_json()?;
        let targets = self.pool.active();
        info!("publishing event {} to {} relays", event.id, targets.len());

        let mut waiters = Vec::with_capacity(targets.len());
        for uri in &targets {
            let (tx, rx) = oneshot::channel();
            self.router.acks.register(&event.id, uri, tx);
            waiters.push((uri.clone(), rx));
        }

        let sends = targets.iter().map(|uri| {
            let frame = &frame;
            async move { (uri.clone(), self.transport.send(frame, uri).await.1) }
        });
        for (uri, sent) in join_all(sends).await {
            if !sent {
                warn!("failed to send event to relay {uri}");
                self.router.acks.resolve(&event.id, &uri, false);
            }
        }

        let deadline = Instant::now() + self.config.publish_timeout;
        let mut accepted_by = Vec::new();
        let mut failed_on = Vec::new();
        for (uri, rx) in waiters {
            let accepted = match timeout_at(deadline, rx).await {
                Ok(Ok(accepted)) => accepted,
                _ => {
                    self.router.acks.cancel(&event.id, &uri);
                    false
                }
            };
            if accepted {
                accepted_by.push(uri);
            } else {
                failed_on.push(uri);
            }
        }

        info!(
            "published event to {}/{} target relays",
            accepted_by.len(),
            targets.len()
        );
        Ok((accepted_by, failed_on))
    }

    /// Query every active relay and aggregate the stored events they return,
    /// de-duplicated by event id.
    ///
    /// Blocks until every relay has drained (EOSE), terminated the
    /// subscription, or the query timeout has elapsed; then closes the
    /// subscription on every relay it is still live on. Relay connections
    /// stay up. The limit is clamped to `[1, 64]`; out-of-range values fall
    /// back to 16.
    pub async fn query(&self, mut filters: Filters) -> Result<Vec<Event>> {
        match filters.limit {
            Some(limit) if (MIN_BATCH_LIMIT..=MAX_BATCH_LIMIT).contains(&limit) => {}
            _ => {
                warn!(
                    "filters limit must be between {MIN_BATCH_LIMIT} and {MAX_BATCH_LIMIT}, \
                     inclusive; setting limit to {DEFAULT_BATCH_LIMIT}"
                );
                filters.limit = Some(DEFAULT_BATCH_LIMIT);
            }
        }
        filters.validate()?;

        let sub_id = self.generate_subscription_id();
        let frame = ClientMessage::req(&sub_id, filters).to_json()?;

        let events = Arc::new(Mutex::new(Vec::new()));
        let collector = Arc::clone(&events);
        let handlers = SubscriptionHandlers {
            on_event: Arc::new(move |_sub_id, event| {
                if let Ok(mut events) = collector.lock() {
                    events.push(event);
                }
            }),
            on_eose: Arc::new(|sub_id| debug!("subscription {sub_id} drained")),
            on_closed: Arc::new(|sub_id, reason| {
                warn!("subscription {sub_id} terminated by relay: {reason}")
            }),
        };
        self.router.subscriptions.register(&sub_id, handlers, true);

        let targets = self.pool.active();
        let mut waiters = Vec::with_capacity(targets.len());
        for uri in &targets {
            let (tx, rx) = oneshot::channel();
            self.router.subscriptions.attach(&sub_id, uri, Some(tx));
            waiters.push(rx);
        }

        let sends = targets.iter().map(|uri| {
            let frame = &frame;
            async move { (uri.clone(), self.transport.send(frame, uri).await.1) }
        });
        for (uri, sent) in join_all(sends).await {
            if sent {
                debug!("sent query to relay {uri}");
            } else {
                warn!("failed to send query to relay {uri}");
                self.router.subscriptions.fail_relay(&sub_id, &uri);
            }
        }

        // Wait for every relay to drain or terminate; a timeout counts as a
        // termination of whatever is still live.
        let deadline = Instant::now() + self.config.query_timeout;
        for rx in waiters {
            match timeout_at(deadline, rx).await {
                Ok(Ok(true)) => {}
                Ok(Ok(false)) | Ok(Err(_)) => {}
                Err(_) => {
                    warn!("query {sub_id} timed out waiting for relays");
                    break;
                }
            }
        }

        let _ = self.unsubscribe(&sub_id).await?;
        self.router.subscriptions.forget(&sub_id);

        let events = events.lock().map(|mut e| std::mem::take(&mut *e)).unwrap_or_default();
        info!("query {sub_id} returned {} events", events.len());
        Ok(events)
    }

    /// Open a streaming subscription on every active relay.
    ///
    /// Matching events are delivered to the handlers as they arrive, without
    /// de-duplication. The caller owns the subscription and must eventually
    /// close it via [`unsubscribe`].
    ///
    /// [`unsubscribe`]: NostrService::unsubscribe
    pub async fn subscribe(
        &self,
        mut filters: Filters,
        handlers: SubscriptionHandlers,
    ) -> Result<String> {
        filters.validate()?;

        let sub_id = self.generate_subscription_id();
        let frame = ClientMessage::req(&sub_id, filters).to_json()?;

        self.router.subscriptions.register(&sub_id, handlers, false);

        let targets = self.pool.active();
        for uri in &targets {
            self.router.subscriptions.attach(&sub_id, uri, None);
        }

        let sends = targets.iter().map(|uri| {
            let frame = &frame;
            async move { (uri.clone(), self.transport.send(frame, uri).await.1) }
        });
        let mut live = 0usize;
        for (uri, sent) in join_all(sends).await {
            if sent {
                live += 1;
            } else {
                warn!("failed to send subscription request to relay {uri}");
                self.router.subscriptions.fail_relay(&sub_id, &uri);
            }
        }

        if live == 0 {
            // Nothing is live; drop the bookkeeping rather than leak it.
            self.router.subscriptions.forget(&sub_id);
        }

        info!(
            "opened subscription {sub_id} on {live}/{} relays",
            targets.len()
        );
        Ok(sub_id)
    }

    /// Close a subscription on every relay it is live on. Returns the relays
    /// the close request reached and those it failed on; the subscription is
    /// forgotten once no relay holds it.
    pub async fn unsubscribe(&self, sub_id: &str) -> Result<(Vec<String>, Vec<String>)> {
        let relays = self.router.subscriptions.relays_of(sub_id);
        let frame = ClientMessage::close(sub_id).to_json()?;

        let closes = relays.iter().map(|uri| {
            let frame = &frame;
            async move {
                if !self.transport.is_connected(uri).await {
                    return (uri.clone(), false);
                }
                debug!("sending {frame} to relay {uri}");
                self.transport.send(frame, uri).await
            }
        });

        let mut closed_on = Vec::new();
        let mut failed_on = Vec::new();
        for (uri, sent) in join_all(closes).await {
            if sent {
                self.router.subscriptions.detach(sub_id, &uri);
                closed_on.push(uri);
            } else {
                failed_on.push(uri);
            }
        }

        if failed_on.is_empty() {
            self.router.subscriptions.forget(sub_id);
        }

        info!(
            "closed subscription {sub_id} on {}/{} relays",
            closed_on.len(),
            relays.len()
        );
        Ok((closed_on, failed_on))
    }

    /// Close a subscription on a single relay. Does nothing and returns
    /// `false` when the subscription is not live there or the relay is not
    /// connected.
    pub async fn unsubscribe_relay(&self, sub_id: &str, uri: &str) -> Result<bool> {
        if !self.router.subscriptions.is_live(sub_id, uri) {
            return Ok(false);
        }
        if !self.transport.is_connected(uri).await {
            return Ok(false);
        }

        let frame = ClientMessage::close(sub_id).to_json()?;
        let (_, sent) = self.transport.send(&frame, uri).await;
        if sent {
            self.router.subscriptions.detach(sub_id, uri);
        }
        Ok(sent)
    }

    /// Close every live subscription. Returns the ids that still have a
    /// relay the close request could not reach.
    pub async fn unsubscribe_all(&self) -> Result<Vec<String>> {
        let mut remaining = Vec::new();
        for sub_id in self.router.subscriptions.ids() {
            let (_, failed) = self.unsubscribe(&sub_id).await?;
            if !failed.is_empty() {
                remaining.push(sub_id);
            }
        }
        Ok(remaining)
    }

    /// A process-unique subscription id.
    fn generate_subscription_id(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

#[async_trait]
impl PubSub for NostrService {
    async fn publish(&self, event: &Event) -> Result<(Vec<String>, Vec<String>)> {
        NostrService::publish(self, event).await
    }

    async fn subscribe(
        &self,
        filters: Filters,
        handlers: SubscriptionHandlers,
    ) -> Result<String> {
        NostrService::subscribe(self, filters, handlers).await
    }

    async fn subscription_relays(&self, sub_id: &str) -> Vec<String> {
        self.router.subscriptions.relays_of(sub_id)
    }

    async fn unsubscribe(&self, sub_id: &str) -> Result<(Vec<String>, Vec<String>)> {
        NostrService::unsubscribe(self, sub_id).await
    }
}

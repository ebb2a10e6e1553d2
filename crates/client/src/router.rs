//! Inbound frame demultiplexing.
//!
//! One handler is attached per relay connection; every frame a relay sends
//! is parsed once and routed: EVENT/EOSE/CLOSE to the subscription registry,
//! OK to the pending acknowledgement map. Frames this client does not
//! consume are ignored.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use weft_core::RelayMessage;

use crate::subscriptions::SubscriptionManager;
use crate::transport::MessageHandler;

/// Pending OK acknowledgements, keyed by `(event_id, relay)`.
///
/// Each key resolves at most once: the sender is removed from the map before
/// it fires.
#[derive(Default)]
pub(crate) struct AckRegistry {
    pending: Mutex<HashMap<(String, String), oneshot::Sender<bool>>>,
}

impl AckRegistry {
    pub(crate) fn register(&self, event_id: &str, uri: &str, sender: oneshot::Sender<bool>) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert((event_id.to_string(), uri.to_string()), sender);
        }
    }

    pub(crate) fn resolve(&self, event_id: &str, uri: &str, accepted: bool) {
        let sender = self
            .pending
            .lock()
            .ok()
            .and_then(|mut p| p.remove(&(event_id.to_string(), uri.to_string())));
        if let Some(sender) = sender {
            let _ = sender.send(accepted);
        }
    }

    /// Drop a pending acknowledgement that will never arrive.
    pub(crate) fn cancel(&self, event_id: &str, uri: &str) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&(event_id.to_string(), uri.to_string()));
        }
    }
}

/// Routes every inbound frame from every relay.
pub(crate) struct MessageRouter {
    pub(crate) subscriptions: SubscriptionManager,
    pub(crate) acks: AckRegistry,
}

impl MessageRouter {
    pub(crate) fn new() -> Self {
        Self {
            subscriptions: SubscriptionManager::default(),
            acks: AckRegistry::default(),
        }
    }

    /// Build the transport message handler for one relay.
    pub(crate) fn handler(self: &Arc<Self>, uri: &str) -> MessageHandler {
        let router = Arc::clone(self);
        let uri = uri.to_string();
        Arc::new(move |payload: String| router.dispatch(&uri, &payload))
    }

    pub(crate) fn dispatch(&self, uri: &str, raw: &str) {
        match RelayMessage::from_json(raw) {
            Ok(Some(RelayMessage::Event {
                subscription_id,
                event,
            })) => {
                debug!("event {} from {uri} for {subscription_id}", event.id);
                self.subscriptions
                    .handle_event(uri, &subscription_id, event);
            }
            Ok(Some(RelayMessage::Eose { subscription_id })) => {
                debug!("end of stored events from {uri} for {subscription_id}");
                self.subscriptions.handle_eose(uri, &subscription_id);
            }
            Ok(Some(RelayMessage::Closed {
                subscription_id,
                reason,
            })) => {
                warn!("{uri} closed subscription {subscription_id}: {reason}");
                self.subscriptions
                    .handle_closed(uri, &subscription_id, &reason);
            }
            Ok(Some(RelayMessage::Ok {
                event_id,
                accepted,
                reason,
            })) => {
                if accepted {
                    debug!("{uri} accepted event {event_id}");
                } else {
                    warn!("{uri} rejected event {event_id}: {reason}");
                }
                self.acks.resolve(&event_id, uri, accepted);
            }
            Ok(Some(RelayMessage::Notice { message })) => {
                info!("notice from {uri}: {message}");
            }
            Ok(None) => {}
            Err(e) => warn!("ignoring malformed frame from {uri}: {e}"),
        }
    }
}

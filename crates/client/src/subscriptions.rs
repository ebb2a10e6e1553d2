//! Subscription registry: live subscriptions and their per-relay state.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::debug;

use weft_core::Event;

/// Invoked with the subscription id and each matching event as it arrives.
pub type EventHandler = Arc<dyn Fn(&str, Event) + Send + Sync>;
/// Invoked with the subscription id when a relay signals end-of-stored-events.
pub type EoseHandler = Arc<dyn Fn(&str) + Send + Sync>;
/// Invoked with the subscription id and reason when a relay ends the
/// subscription.
pub type ClosedHandler = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// The callbacks driven by a subscription's inbound frames.
#[derive(Clone)]
pub struct SubscriptionHandlers {
    pub on_event: EventHandler,
    pub on_eose: EoseHandler,
    pub on_closed: ClosedHandler,
}

impl SubscriptionHandlers {
    /// Handlers that ignore everything; useful as a base to override.
    pub fn noop() -> Self {
        Self {
            on_event: Arc::new(|_, _| {}),
            on_eose: Arc::new(|_| {}),
            on_closed: Arc::new(|_, _| {}),
        }
    }
}

struct SubscriptionEntry {
    relays: HashSet<String>,
    /// Event ids already delivered; present only in de-duplicating mode.
    seen: Option<HashSet<String>>,
    handlers: SubscriptionHandlers,
    /// Per-relay completion signals for batch queries: `true` on EOSE,
    /// `false` on relay-side close or transport error.
    completions: HashMap<String, oneshot::Sender<bool>>,
}

#[derive(Default)]
struct Registry {
    by_sub: HashMap<String, SubscriptionEntry>,
    by_relay: HashMap<String, HashSet<String>>,
}

impl Registry {
    fn unlink(&mut self, sub_id: &str, uri: &str) {
        if let Some(subs) = self.by_relay.get_mut(uri) {
            subs.remove(sub_id);
            if subs.is_empty() {
                self.by_relay.remove(uri);
            }
        }
    }

    /// Remove a relay from a subscription; drops the whole entry once its
    /// last relay is gone. Returns the entry's pending completion for the
    /// relay, if any.
    fn detach(&mut self, sub_id: &str, uri: &str) -> Option<oneshot::Sender<bool>> {
        self.unlink(sub_id, uri);
        let entry = self.by_sub.get_mut(sub_id)?;
        entry.relays.remove(uri);
        let completion = entry.completions.remove(uri);
        if entry.relays.is_empty() {
            self.by_sub.remove(sub_id);
            debug!("subscription {sub_id} released");
        }
        completion
    }
}

/// Tracks every live subscription and routes its inbound frames.
///
/// Two indexes are kept consistent under one mutex: subscription id to the
/// relays it is live on, and relay to the subscription ids live on it. The
/// mutex is held only across map mutation; caller handlers and completion
/// signals fire after it is released.
#[derive(Default)]
pub struct SubscriptionManager {
    state: Mutex<Registry>,
}

impl SubscriptionManager {
    /// Register a subscription. `dedup` enables suppression of duplicate
    /// event ids across relays (batch mode).
    pub fn register(&self, sub_id: &str, handlers: SubscriptionHandlers, dedup: bool) {
        let mut state = self.state.lock().expect("subscription registry poisoned");
        state.by_sub.insert(
            sub_id.to_string(),
            SubscriptionEntry {
                relays: HashSet::new(),
                seen: dedup.then(HashSet::new),
                handlers,
                completions: HashMap::new(),
            },
        );
    }

    /// Record that a subscription is live on a relay. `completion` is
    /// resolved once the relay reaches end-of-stored-events (`true`) or the
    /// pair is terminated (`false`).
    pub fn attach(&self, sub_id: &str, uri: &str, completion: Option<oneshot::Sender<bool>>) {
        let mut state = self.state.lock().expect("subscription registry poisoned");
        if let Some(entry) = state.by_sub.get_mut(sub_id) {
            entry.relays.insert(uri.to_string());
            if let Some(completion) = completion {
                entry.completions.insert(uri.to_string(), completion);
            }
            state
                .by_relay
                .entry(uri.to_string())
                .or_default()
                .insert(sub_id.to_string());
        }
    }

    /// Remove a relay from a subscription after a successful client-side
    /// close. Returns whether the pair was live.
    pub fn detach(&self, sub_id: &str, uri: &str) -> bool {
        let completion = {
            let mut state = self.state.lock().expect("subscription registry poisoned");
            if !state
                .by_sub
                .get(sub_id)
                .map(|e| e.relays.contains(uri))
                .unwrap_or(false)
            {
                return false;
            }
            state.detach(sub_id, uri)
        };
        if let Some(completion) = completion {
            let _ = completion.send(false);
        }
        true
    }

    /// Mark a subscription as terminated on a relay because the transport
    /// failed; the pending completion, if any, resolves `false`.
    pub fn fail_relay(&self, sub_id: &str, uri: &str) {
        let completion = {
            let mut state = self.state.lock().expect("subscription registry poisoned");
            state.detach(sub_id, uri)
        };
        if let Some(completion) = completion {
            let _ = completion.send(false);
        }
    }

    /// Drop all subscription state for a relay whose connection is gone.
    /// Pending completions resolve `false`.
    pub fn drop_relay(&self, uri: &str) {
        let completions = {
            let mut state = self.state.lock().expect("subscription registry poisoned");
            let sub_ids: Vec<String> = state
                .by_relay
                .get(uri)
                .map(|subs| subs.iter().cloned().collect())
                .unwrap_or_default();
            sub_ids
                .into_iter()
                .filter_map(|sub_id| state.detach(&sub_id, uri))
                .collect::<Vec<_>>()
        };
        for completion in completions {
            let _ = completion.send(false);
        }
    }

    /// Forget a subscription entirely, regardless of remaining relays.
    pub fn forget(&self, sub_id: &str) {
        let mut state = self.state.lock().expect("subscription registry poisoned");
        if let Some(entry) = state.by_sub.remove(sub_id) {
            for uri in entry.relays {
                state.unlink(sub_id, &uri);
            }
        }
    }

    /// Whether the subscription is live on the given relay.
    pub fn is_live(&self, sub_id: &str, uri: &str) -> bool {
        self.state
            .lock()
            .map(|state| {
                state
                    .by_sub
                    .get(sub_id)
                    .map(|e| e.relays.contains(uri))
                    .unwrap_or(false)
            })
            .unwrap_or(false)
    }

    /// The relays a subscription is live on.
    pub fn relays_of(&self, sub_id: &str) -> Vec<String> {
        self.state
            .lock()
            .map(|state| {
                state
                    .by_sub
                    .get(sub_id)
                    .map(|e| e.relays.iter().cloned().collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    /// The ids of every live subscription.
    pub fn ids(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|state| state.by_sub.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Route an EVENT frame. In de-duplicating mode an event id already
    /// delivered for this subscription is suppressed. Events arriving after
    /// EOSE are still delivered.
    pub(crate) fn handle_event(&self, _uri: &str, sub_id: &str, event: Event) {
        let handlers = {
            let mut state = self.state.lock().expect("subscription registry poisoned");
            let Some(entry) = state.by_sub.get_mut(sub_id) else {
                debug!("dropping event for unknown subscription {sub_id}");
                return;
            };
            if let Some(seen) = entry.seen.as_mut() {
                if !seen.insert(event.id.clone()) {
                    return;
                }
            }
            entry.handlers.clone()
        };
        (handlers.on_event)(sub_id, event);
    }

    /// Route an EOSE frame: the `(sub, relay)` pair is drained.
    pub(crate) fn handle_eose(&self, uri: &str, sub_id: &str) {
        let resolved = {
            let mut state = self.state.lock().expect("subscription registry poisoned");
            let Some(entry) = state.by_sub.get_mut(sub_id) else {
                return;
            };
            (entry.completions.remove(uri), entry.handlers.clone())
        };
        let (completion, handlers) = resolved;
        if let Some(completion) = completion {
            let _ = completion.send(true);
        }
        (handlers.on_eose)(sub_id);
    }

    /// Route a relay-side CLOSE frame: the `(sub, relay)` pair is
    /// terminated.
    pub(crate) fn handle_closed(&self, uri: &str, sub_id: &str, reason: &str) {
        let resolved = {
            let mut state = self.state.lock().expect("subscription registry poisoned");
            let Some(entry) = state.by_sub.get(sub_id) else {
                return;
            };
            let handlers = entry.handlers.clone();
            let completion = state.detach(sub_id, uri);
            (completion, handlers)
        };
        let (completion, handlers) = resolved;
        if let Some(completion) = completion {
            let _ = completion.send(false);
        }
        (handlers.on_closed)(sub_id, reason);
    }
}

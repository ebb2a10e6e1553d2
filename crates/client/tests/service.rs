//! Service tests against a scripted transport: connection lifecycle,
//! publish acknowledgement partitions, batch and streaming queries, and
//! subscription teardown.

mod common;

use common::MockTransport;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use weft_client::{
    LocalSigner, NostrClient, NostrService, ServiceConfig, Signer, SubscriptionHandlers,
    Transport,
};
use weft_core::{Event, Filters, Keys, RelayMessage};

const RELAY_A: &str = "wss://relay.damus.io";
const RELAY_B: &str = "wss://nostr.thesamecat.io";

fn relays() -> Vec<String> {
    vec![RELAY_A.to_string(), RELAY_B.to_string()]
}

fn service(transport: &Arc<MockTransport>) -> NostrService {
    NostrService::new(Arc::clone(transport) as Arc<dyn Transport>, relays())
}

fn service_with_timeouts(transport: &Arc<MockTransport>, millis: u64) -> NostrService {
    NostrService::with_config(
        Arc::clone(transport) as Arc<dyn Transport>,
        relays(),
        ServiceConfig {
            query_timeout: Duration::from_millis(millis),
            publish_timeout: Duration::from_millis(millis),
        },
    )
}

fn text_note(keys: &Keys, content: &str) -> Event {
    let mut event = Event::new("", 1, vec![], content);
    keys.sign_event(&mut event).unwrap();
    event
}

/// The sub id of a `["REQ", <id>, …]` frame, if it is one.
fn req_sub_id(frame: &str) -> Option<String> {
    let value: Value = serde_json::from_str(frame).ok()?;
    let arr = value.as_array()?;
    if arr.first()?.as_str()? != "REQ" {
        return None;
    }
    Some(arr.get(1)?.as_str()?.to_string())
}

/// The event of an `["EVENT", <event>]` frame, if it is one.
fn published_event(frame: &str) -> Option<Event> {
    let value: Value = serde_json::from_str(frame).ok()?;
    let arr = value.as_array()?;
    if arr.first()?.as_str()? != "EVENT" {
        return None;
    }
    Event::from_value(arr.get(1)?.clone()).ok()
}

fn ok_frame(event_id: &str, accepted: bool, reason: &str) -> String {
    RelayMessage::Ok {
        event_id: event_id.to_string(),
        accepted,
        reason: reason.to_string(),
    }
    .to_json()
    .unwrap()
}

fn event_frame(sub_id: &str, event: &Event) -> String {
    RelayMessage::Event {
        subscription_id: sub_id.to_string(),
        event: event.clone(),
    }
    .to_json()
    .unwrap()
}

fn eose_frame(sub_id: &str) -> String {
    RelayMessage::Eose {
        subscription_id: sub_id.to_string(),
    }
    .to_json()
    .unwrap()
}

/// Script both relays to store three events and answer queries with them.
fn serve_stored_events(transport: &Arc<MockTransport>, events: Vec<Event>) {
    transport.respond(move |_uri, frame| {
        let Some(sub_id) = req_sub_id(frame) else {
            return vec![];
        };
        let mut frames: Vec<String> =
            events.iter().map(|e| event_frame(&sub_id, e)).collect();
        frames.push(eose_frame(&sub_id));
        frames
    });
}

#[tokio::test]
async fn connect_reports_active_relays() {
    let transport = MockTransport::new();
    let service = service(&transport);

    let active = service.connect().await.unwrap();
    assert_eq!(active, relays());
    assert!(service.is_connected(RELAY_A));
    assert!(service.is_connected(RELAY_B));
}

#[tokio::test]
async fn connect_is_idempotent() {
    let transport = MockTransport::new();
    let service = service(&transport);

    service.connect().await.unwrap();
    let active = service.connect().await.unwrap();
    assert_eq!(active.len(), 2);
}

#[tokio::test]
async fn failed_connections_stay_out_of_the_active_set() {
    let transport = MockTransport::new();
    transport.refuse_open(RELAY_A);
    let service = service(&transport);

    let active = service.connect().await.unwrap();
    assert_eq!(active, vec![RELAY_B.to_string()]);
    assert!(!service.is_connected(RELAY_A));
}

#[tokio::test]
async fn spontaneous_disconnects_are_reconciled() {
    let transport = MockTransport::new();
    let service = service(&transport);
    service.connect().await.unwrap();

    transport.drop_connection(RELAY_A);
    let active = service.connect().await.unwrap();

    // The dropped relay was evicted, reconnected, and is active again.
    assert!(active.contains(&RELAY_A.to_string()));
    assert!(transport.is_connected(RELAY_A).await);
}

#[tokio::test]
async fn disconnect_empties_the_active_set() {
    let transport = MockTransport::new();
    let service = service(&transport);
    service.connect().await.unwrap();

    service.disconnect().await.unwrap();
    assert!(service.active_relays().is_empty());
    assert!(!transport.is_connected(RELAY_A).await);
}

#[tokio::test]
async fn publish_collects_acceptance_from_every_relay() {
    let transport = MockTransport::new();
    transport.respond(|_uri, frame| match published_event(frame) {
        Some(event) => vec![ok_frame(&event.id, true, "Event accepted")],
        None => vec![],
    });
    let service = service(&transport);
    service.connect().await.unwrap();

    let keys = Keys::generate().unwrap();
    let event = text_note(&keys, "Hello, World!");
    let (accepted, failed) = service.publish(&event).await.unwrap();

    assert_eq!(accepted, relays());
    assert!(failed.is_empty());
}

#[tokio::test]
async fn publish_counts_transport_failure_against_the_relay() {
    let transport = MockTransport::new();
    transport.respond(|_uri, frame| match published_event(frame) {
        Some(event) => vec![ok_frame(&event.id, true, "")],
        None => vec![],
    });
    transport.fail_sends(RELAY_A);
    let service = service(&transport);
    service.connect().await.unwrap();

    let keys = Keys::generate().unwrap();
    let event = text_note(&keys, "Hello, World!");
    let (accepted, failed) = service.publish(&event).await.unwrap();

    assert_eq!(accepted, vec![RELAY_B.to_string()]);
    assert_eq!(failed, vec![RELAY_A.to_string()]);
}

#[tokio::test]
async fn publish_counts_rejection_as_failure() {
    let transport = MockTransport::new();
    transport.respond(|_uri, frame| match published_event(frame) {
        Some(event) => vec![ok_frame(&event.id, false, "Event rejected")],
        None => vec![],
    });
    let service = service(&transport);
    service.connect().await.unwrap();

    let keys = Keys::generate().unwrap();
    let event = text_note(&keys, "Hello, World!");
    let (accepted, failed) = service.publish(&event).await.unwrap();

    assert!(accepted.is_empty());
    assert_eq!(failed, relays());
}

#[tokio::test]
async fn publish_partitions_mixed_outcomes() {
    let transport = MockTransport::new();
    transport.respond(|uri, frame| match published_event(frame) {
        Some(event) if uri == RELAY_A => vec![ok_frame(&event.id, true, "")],
        Some(event) => vec![ok_frame(&event.id, false, "blocked: pubkey not allowed")],
        None => vec![],
    });
    let service = service(&transport);
    service.connect().await.unwrap();

    let keys = Keys::generate().unwrap();
    let event = text_note(&keys, "Hello, World!");
    let (accepted, failed) = service.publish(&event).await.unwrap();

    assert_eq!(accepted, vec![RELAY_A.to_string()]);
    assert_eq!(failed, vec![RELAY_B.to_string()]);
}

#[tokio::test]
async fn publish_times_out_silent_relays() {
    let transport = MockTransport::new();
    let service = service_with_timeouts(&transport, 100);
    service.connect().await.unwrap();

    let keys = Keys::generate().unwrap();
    let event = text_note(&keys, "Hello, World!");
    let (accepted, failed) = service.publish(&event).await.unwrap();

    assert!(accepted.is_empty());
    assert_eq!(failed.len(), 2);
}

#[tokio::test]
async fn publish_requires_a_signed_event() {
    let transport = MockTransport::new();
    let service = service(&transport);
    service.connect().await.unwrap();

    let mut unsigned = Event::new("ab", 1, vec![], "unsigned");
    unsigned.ensure_id().unwrap();
    assert!(service.publish(&unsigned).await.is_err());
}

#[tokio::test]
async fn query_deduplicates_across_relays() {
    let transport = MockTransport::new();
    let keys = Keys::generate().unwrap();
    let stored = vec![
        text_note(&keys, "Hello, World!"),
        text_note(&keys, "Welcome to Nostr!"),
        text_note(&keys, "Time for some introductions!"),
    ];
    serve_stored_events(&transport, stored.clone());

    let service = service(&transport);
    service.connect().await.unwrap();

    let filters = Filters {
        authors: vec![keys.public_key().to_string()],
        kinds: vec![0, 1],
        limit: Some(10),
        ..Default::default()
    };
    let events = service.query(filters).await.unwrap();

    // Both relays returned the same three events; each appears once.
    assert_eq!(events.len(), 3);
    for event in &stored {
        assert!(events.iter().any(|e| e.id == event.id));
    }
}

#[tokio::test]
async fn query_closes_the_subscription_but_not_the_connections() {
    let transport = MockTransport::new();
    let keys = Keys::generate().unwrap();
    serve_stored_events(&transport, vec![text_note(&keys, "Hello, World!")]);

    let service = service(&transport);
    service.connect().await.unwrap();

    let filters = Filters {
        kinds: vec![1],
        limit: Some(10),
        ..Default::default()
    };
    service.query(filters).await.unwrap();

    assert!(service.subscriptions().is_empty());
    assert!(service.is_connected(RELAY_A));
    assert!(service.is_connected(RELAY_B));
    let closes: Vec<String> = transport
        .sent_to(RELAY_A)
        .into_iter()
        .filter(|frame| frame.starts_with(r#"["CLOSE""#))
        .collect();
    assert_eq!(closes.len(), 1);
}

#[tokio::test]
async fn query_clamps_out_of_range_limits() {
    let transport = MockTransport::new();
    let keys = Keys::generate().unwrap();
    serve_stored_events(&transport, vec![]);

    let service = service(&transport);
    service.connect().await.unwrap();

    let filters = Filters {
        kinds: vec![1],
        limit: Some(5000),
        ..Default::default()
    };
    service.query(filters).await.unwrap();

    let req = transport
        .sent_to(RELAY_A)
        .into_iter()
        .find(|frame| frame.starts_with(r#"["REQ""#))
        .unwrap();
    assert!(req.contains(r#""limit":16"#));
}

#[tokio::test]
async fn query_finishes_when_a_relay_terminates_the_subscription() {
    let transport = MockTransport::new();
    let keys = Keys::generate().unwrap();
    let note = text_note(&keys, "Hello, World!");
    let served = note.clone();
    transport.respond(move |uri, frame| {
        let Some(sub_id) = req_sub_id(frame) else {
            return vec![];
        };
        if uri == RELAY_A {
            vec![event_frame(&sub_id, &served), eose_frame(&sub_id)]
        } else {
            vec![RelayMessage::Closed {
                subscription_id: sub_id,
                reason: "error: shutting down".to_string(),
            }
            .to_json()
            .unwrap()]
        }
    });

    let service = service(&transport);
    service.connect().await.unwrap();

    let filters = Filters {
        kinds: vec![1],
        limit: Some(10),
        ..Default::default()
    };
    let events = service.query(filters).await.unwrap();
    assert_eq!(events.len(), 1);
    assert!(service.subscriptions().is_empty());
}

#[tokio::test]
async fn query_times_out_stalled_relays() {
    let transport = MockTransport::new();
    let keys = Keys::generate().unwrap();
    let note = text_note(&keys, "Hello, World!");
    let served = note.clone();
    // Relay A answers; relay B never sends EOSE.
    transport.respond(move |uri, frame| {
        let Some(sub_id) = req_sub_id(frame) else {
            return vec![];
        };
        if uri == RELAY_A {
            vec![event_frame(&sub_id, &served), eose_frame(&sub_id)]
        } else {
            vec![]
        }
    });

    let service = service_with_timeouts(&transport, 100);
    service.connect().await.unwrap();

    let filters = Filters {
        kinds: vec![1],
        limit: Some(10),
        ..Default::default()
    };
    let events = service.query(filters).await.unwrap();
    assert_eq!(events.len(), 1);
    assert!(service.subscriptions().is_empty());
}

#[tokio::test]
async fn streaming_delivers_without_deduplication() {
    let transport = MockTransport::new();
    let keys = Keys::generate().unwrap();
    let stored = vec![
        text_note(&keys, "one"),
        text_note(&keys, "two"),
        text_note(&keys, "three"),
    ];
    serve_stored_events(&transport, stored);

    let service = service(&transport);
    service.connect().await.unwrap();

    let events_seen = Arc::new(AtomicUsize::new(0));
    let eoses_seen = Arc::new(AtomicUsize::new(0));
    let handlers = SubscriptionHandlers {
        on_event: {
            let events_seen = Arc::clone(&events_seen);
            Arc::new(move |_, _| {
                events_seen.fetch_add(1, Ordering::SeqCst);
            })
        },
        on_eose: {
            let eoses_seen = Arc::clone(&eoses_seen);
            Arc::new(move |_| {
                eoses_seen.fetch_add(1, Ordering::SeqCst);
            })
        },
        on_closed: Arc::new(|_, _| {}),
    };

    let filters = Filters {
        kinds: vec![1],
        limit: Some(10),
        ..Default::default()
    };
    let sub_id = service.subscribe(filters, handlers).await.unwrap();

    // Three events from each of the two relays, no de-duplication.
    assert_eq!(events_seen.load(Ordering::SeqCst), 6);
    assert_eq!(eoses_seen.load(Ordering::SeqCst), 2);

    // The subscription stays live until the caller closes it.
    assert_eq!(service.subscriptions(), vec![sub_id.clone()]);

    let (closed_on, failed_on) = service.unsubscribe(&sub_id).await.unwrap();
    assert_eq!(closed_on.len(), 2);
    assert!(failed_on.is_empty());
    assert!(service.subscriptions().is_empty());
    for uri in [RELAY_A, RELAY_B] {
        assert!(transport
            .sent_to(uri)
            .iter()
            .any(|frame| frame.starts_with(r#"["CLOSE""#)));
    }
}

#[tokio::test]
async fn streaming_surfaces_relay_side_closes() {
    let transport = MockTransport::new();
    let service = service(&transport);
    service.connect().await.unwrap();

    let closes_seen = Arc::new(Mutex::new(Vec::new()));
    let handlers = SubscriptionHandlers {
        on_event: Arc::new(|_, _| {}),
        on_eose: Arc::new(|_| {}),
        on_closed: {
            let closes_seen = Arc::clone(&closes_seen);
            Arc::new(move |_, reason: &str| {
                closes_seen.lock().unwrap().push(reason.to_string());
            })
        },
    };

    let filters = Filters {
        kinds: vec![1],
        limit: Some(10),
        ..Default::default()
    };
    let sub_id = service.subscribe(filters, handlers).await.unwrap();

    let close = RelayMessage::Closed {
        subscription_id: sub_id.clone(),
        reason: "rate limited".to_string(),
    }
    .to_json()
    .unwrap();
    transport.deliver(RELAY_A, &close);
    transport.deliver(RELAY_B, &close);

    assert_eq!(
        *closes_seen.lock().unwrap(),
        vec!["rate limited".to_string(), "rate limited".to_string()]
    );
    // Terminated on every relay: the entry is gone.
    assert!(service.subscriptions().is_empty());
}

#[tokio::test]
async fn unsubscribe_relay_is_a_noop_for_unknown_pairs() {
    let transport = MockTransport::new();
    let service = service(&transport);
    service.connect().await.unwrap();

    let filters = Filters {
        kinds: vec![1],
        limit: Some(10),
        ..Default::default()
    };
    let sub_id = service
        .subscribe(filters, SubscriptionHandlers::noop())
        .await
        .unwrap();

    assert!(service.unsubscribe_relay(&sub_id, RELAY_A).await.unwrap());
    // Already closed on that relay.
    assert!(!service.unsubscribe_relay(&sub_id, RELAY_A).await.unwrap());
    // Unknown subscription.
    assert!(!service.unsubscribe_relay("no-such-sub", RELAY_B).await.unwrap());
}

#[tokio::test]
async fn concurrent_subscriptions_close_in_bulk() {
    let transport = MockTransport::new();
    let service = service(&transport);
    service.connect().await.unwrap();

    let kind1 = Filters {
        kinds: vec![0, 1],
        limit: Some(10),
        ..Default::default()
    };
    let kind30023 = Filters {
        kinds: vec![30023],
        limit: Some(10),
        ..Default::default()
    };

    let first = service
        .subscribe(kind1, SubscriptionHandlers::noop())
        .await
        .unwrap();
    let second = service
        .subscribe(kind30023, SubscriptionHandlers::noop())
        .await
        .unwrap();
    assert_ne!(first, second);
    assert_eq!(service.subscriptions().len(), 2);

    let remaining = service.unsubscribe_all().await.unwrap();
    assert!(remaining.is_empty());
    assert!(service.subscriptions().is_empty());
}

#[tokio::test]
async fn disconnecting_a_relay_drops_its_subscription_state() {
    let transport = MockTransport::new();
    let service = service(&transport);
    service.connect().await.unwrap();

    let filters = Filters {
        kinds: vec![1],
        limit: Some(10),
        ..Default::default()
    };
    let sub_id = service
        .subscribe(filters, SubscriptionHandlers::noop())
        .await
        .unwrap();

    service
        .disconnect_relays(&[RELAY_A.to_string()])
        .await
        .unwrap();

    // Still live on the surviving relay only.
    assert_eq!(service.subscriptions(), vec![sub_id.clone()]);
    assert!(!service.unsubscribe_relay(&sub_id, RELAY_A).await.unwrap());
    assert!(service.unsubscribe_relay(&sub_id, RELAY_B).await.unwrap());
}

#[tokio::test]
async fn client_signs_and_publishes() {
    let transport = MockTransport::new();
    transport.respond(|_uri, frame| match published_event(frame) {
        Some(event) => vec![ok_frame(&event.id, true, "")],
        None => vec![],
    });

    let signer = Arc::new(LocalSigner::generate().unwrap());
    let client = NostrClient::builder()
        .transport(Arc::clone(&transport) as Arc<dyn Transport>)
        .signer(Arc::clone(&signer) as Arc<dyn Signer>)
        .default_relays([RELAY_A, RELAY_B])
        .build()
        .unwrap();

    client.start().await;
    client.connect().await.unwrap();

    let mut event = Event::new("", 1, vec![], "Hello, World!");
    let (accepted, failed) = client.publish(&mut event).await.unwrap();

    assert_eq!(event.pubkey, signer.public_key());
    Keys::verify_event(&event).unwrap();
    assert_eq!(accepted.len(), 2);
    assert!(failed.is_empty());
}

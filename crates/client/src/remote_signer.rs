//! NIP-46 remote-signer broker.
//!
//! The broker holds an ephemeral keypair used only for talking to the remote
//! signer. Each request is a JSON `{id, method, params}` object, encrypted
//! to the remote signer's public key, carried as the content of a kind-24133
//! event signed with the ephemeral key, and published over the shared
//! relays. Responses are kind-24133 events from the remote signer that tag
//! the ephemeral public key; the first one that decrypts resolves the
//! request.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use weft_core::nip04;
use weft_core::nip44::Nip44Cipher;
use weft_core::{
    BunkerToken, ConnectMetadata, Event, Filters, Keys, NostrConnectToken, SignerRequest,
    KIND_NOSTR_CONNECT,
};

use crate::error::{ClientError, Result};
use crate::service::PubSub;
use crate::signer::Signer;
use crate::subscriptions::SubscriptionHandlers;

/// Which cipher wraps outgoing requests. Incoming payloads are always
/// routed by their wire format, so a NIP-04 signer can answer a NIP-44
/// client and vice versa.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encryption {
    Nip04,
    Nip44,
}

/// Broker configuration.
#[derive(Debug, Clone)]
pub struct RemoteSignerConfig {
    /// How long to wait for the remote signer's response to one request.
    pub response_timeout: Duration,
    /// Cipher for outgoing requests.
    pub encryption: Encryption,
}

impl Default for RemoteSignerConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(15),
            encryption: Encryption::Nip44,
        }
    }
}

/// A signer that brokers signing through a remote signer over the relay
/// fabric.
pub struct RemoteSigner {
    pubsub: Arc<dyn PubSub>,
    keys: Keys,
    remote_pubkey: String,
    relays: Vec<String>,
    secret: Option<String>,
    config: RemoteSignerConfig,
}

impl RemoteSigner {
    /// Build a broker from a parsed `bunker://` token.
    pub fn new(pubsub: Arc<dyn PubSub>, token: BunkerToken) -> Result<Self> {
        Self::with_config(pubsub, token, RemoteSignerConfig::default())
    }

    pub fn with_config(
        pubsub: Arc<dyn PubSub>,
        token: BunkerToken,
        config: RemoteSignerConfig,
    ) -> Result<Self> {
        let keys = Keys::generate().map_err(|e| ClientError::Signer(e.to_string()))?;
        Ok(Self {
            pubsub,
            keys,
            remote_pubkey: token.remote_pubkey,
            relays: token.relays,
            secret: token.secret,
            config,
        })
    }

    /// Build a broker from a raw `bunker://` token string.
    pub fn from_token(pubsub: Arc<dyn PubSub>, token: &str) -> Result<Self> {
        let token = BunkerToken::parse(token)?;
        Self::new(pubsub, token)
    }

    /// The ephemeral public key this broker talks to the signer with.
    pub fn local_pubkey(&self) -> &str {
        self.keys.public_key()
    }

    /// The remote signer's public key.
    pub fn remote_pubkey(&self) -> &str {
        &self.remote_pubkey
    }

    /// The relays shared with the remote signer.
    pub fn relays(&self) -> &[String] {
        &self.relays
    }

    /// The shared secret from the bunker token, if one was issued.
    pub fn secret(&self) -> Option<&str> {
        self.secret.as_deref()
    }

    /// Render a `nostrconnect://` token inviting a signer to connect back
    /// to this broker.
    pub fn connection_token(&self, metadata: ConnectMetadata) -> Result<String> {
        let token =
            NostrConnectToken::new(self.keys.public_key(), self.relays.clone(), metadata)?;
        Ok(token.to_token()?)
    }

    /// Probe the remote signer. Resolves `true` iff it answers `pong`.
    pub async fn ping(&self) -> bool {
        match self.request(SignerRequest::ping()).await {
            Ok(Some(body)) => body == "pong",
            Ok(None) => false,
            Err(e) => {
                warn!("ping to remote signer failed: {e}");
                false
            }
        }
    }

    /// Establish the pairing, presenting the bunker secret when one was
    /// issued. Resolves `true` iff the signer acknowledges.
    pub async fn connect(&self) -> Result<bool> {
        let request = SignerRequest::connect(self.remote_pubkey.clone(), self.secret.clone());
        Ok(matches!(self.request(request).await?.as_deref(), Some("ack")))
    }

    /// The public key of the user the remote signer signs as, if it answers.
    pub async fn user_public_key(&self) -> Result<Option<String>> {
        self.request(SignerRequest::get_public_key()).await
    }

    /// Send one request and wait for the paired response.
    ///
    /// Resolves `Ok(None)` when no response arrives: every relay drained
    /// without one, the subscription was terminated, or the timeout
    /// elapsed.
    async fn request(&self, request: SignerRequest) -> Result<Option<String>> {
        let wrapped = self.wrap(&request)?;
        let filters = self.response_filters();

        let decryptor = Arc::new(ResponseDecryptor::new(&self.keys, &self.remote_pubkey)?);
        let outcome: Arc<Mutex<Option<oneshot::Sender<Option<String>>>>> = Arc::default();
        let (tx, rx) = oneshot::channel();
        *outcome.lock().expect("outcome slot poisoned") = Some(tx);

        // Relays send EOSE as soon as their stored matches are drained; the
        // request counts them and gives up once every live relay has drained
        // without producing a response. The expected count is unknown until
        // the subscription is open, so it starts unreachable.
        let eose_seen = Arc::new(AtomicUsize::new(0));
        let expected = Arc::new(AtomicUsize::new(usize::MAX));

        let handlers = {
            let outcome_event = Arc::clone(&outcome);
            let outcome_eose = Arc::clone(&outcome);
            let outcome_closed = Arc::clone(&outcome);
            let decryptor = Arc::clone(&decryptor);
            let eose_seen = Arc::clone(&eose_seen);
            let expected = Arc::clone(&expected);
            let expected_shape = filters.clone();
            SubscriptionHandlers {
                on_event: Arc::new(move |_sub_id, event| {
                    if !expected_shape.matches(&event) {
                        debug!("ignoring event {} outside the response filter", event.id);
                        return;
                    }
                    match decryptor.open(&event) {
                        Ok(body) => resolve(&outcome_event, Some(body)),
                        Err(e) => debug!("ignoring undecryptable signer event: {e}"),
                    }
                }),
                on_eose: Arc::new(move |_sub_id| {
                    let seen = eose_seen.fetch_add(1, Ordering::SeqCst) + 1;
                    if seen >= expected.load(Ordering::SeqCst) {
                        resolve(&outcome_eose, None);
                    }
                }),
                on_closed: Arc::new(move |_sub_id, _reason| {
                    resolve(&outcome_closed, None);
                }),
            }
        };

        // Subscribe before publishing so a fast response cannot slip past.
        let sub_id = self.pubsub.subscribe(filters, handlers).await?;
        let live = self.pubsub.subscription_relays(&sub_id).await;
        expected.store(live.len(), Ordering::SeqCst);
        if eose_seen.load(Ordering::SeqCst) >= live.len() {
            // Every relay already drained while the subscription was being
            // set up.
            resolve(&outcome, None);
        }

        let (accepted, _failed) = self.pubsub.publish(&wrapped).await?;
        if accepted.is_empty() {
            warn!("signer request {} reached no relays", request.id);
            let _ = self.pubsub.unsubscribe(&sub_id).await;
            return Ok(None);
        }

        let response = match timeout(self.config.response_timeout, rx).await {
            Ok(Ok(response)) => response,
            _ => None,
        };
        let _ = self.pubsub.unsubscribe(&sub_id).await;
        Ok(response)
    }

    /// Wrap a request: encrypt the payload to the remote signer and carry it
    /// in a kind-24133 event signed with the ephemeral key.
    fn wrap(&self, request: &SignerRequest) -> Result<Event> {
        let payload = serde_json::to_string(request)?;
        let content = match self.config.encryption {
            Encryption::Nip44 => Nip44Cipher::new(self.keys.secret_bytes(), &self.remote_pubkey)?
                .encrypt(&payload)?,
            Encryption::Nip04 => {
                nip04::encrypt(self.keys.secret_bytes(), &self.remote_pubkey, &payload)?
            }
        };

        let mut event = Event::new(
            self.keys.public_key(),
            KIND_NOSTR_CONNECT,
            vec![vec!["p".to_string(), self.remote_pubkey.clone()]],
            content,
        );
        self.keys
            .sign_event(&mut event)
            .map_err(|e| ClientError::Signer(e.to_string()))?;
        Ok(event)
    }

    /// The filter matching this broker's responses: kind-24133 events from
    /// the remote signer tagging the ephemeral key, from now on.
    fn response_filters(&self) -> Filters {
        let mut filters = Filters {
            authors: vec![self.remote_pubkey.clone()],
            kinds: vec![KIND_NOSTR_CONNECT],
            limit: Some(1),
            ..Default::default()
        };
        filters.tag("p", vec![self.keys.public_key().to_string()]);
        filters.since = Some(unix_now());
        filters
    }
}

#[async_trait]
impl Signer for RemoteSigner {
    /// Sign through the remote signer.
    ///
    /// Pings first; a signer that does not answer is unavailable. The event
    /// is then serialized as-is and handed to `sign_event`; the response is
    /// parsed back and replaces the caller's event in place.
    async fn sign(&self, event: &mut Event) -> Result<()> {
        if !self.ping().await {
            return Err(ClientError::Signer(
                "remote signer did not answer ping".to_string(),
            ));
        }

        let payload = serde_json::to_string(event)?;
        let response = self
            .request(SignerRequest::sign_event(payload))
            .await?
            .ok_or_else(|| {
                ClientError::Signer("remote signer did not answer sign_event".to_string())
            })?;

        let signed = Event::from_json(&response)?;
        *event = signed;
        Ok(())
    }
}

/// Decrypts signer responses: NIP-04 payloads are recognized by their
/// `?iv=` marker, everything else is treated as NIP-44.
struct ResponseDecryptor {
    cipher: Nip44Cipher,
    secret: Zeroizing<[u8; 32]>,
    remote_pubkey: String,
}

impl ResponseDecryptor {
    fn new(keys: &Keys, remote_pubkey: &str) -> Result<Self> {
        Ok(Self {
            cipher: Nip44Cipher::new(keys.secret_bytes(), remote_pubkey)?,
            secret: Zeroizing::new(*keys.secret_bytes()),
            remote_pubkey: remote_pubkey.to_string(),
        })
    }

    fn open(&self, event: &Event) -> Result<String> {
        if nip04::is_nip04_payload(&event.content) {
            Ok(nip04::decrypt(
                &self.secret,
                &self.remote_pubkey,
                &event.content,
            )?)
        } else {
            Ok(self.cipher.decrypt(&event.content)?)
        }
    }
}

fn resolve(slot: &Mutex<Option<oneshot::Sender<Option<String>>>>, value: Option<String>) {
    let sender = slot.lock().ok().and_then(|mut slot| slot.take());
    if let Some(sender) = sender {
        let _ = sender.send(value);
    }
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopPubSub;

    #[async_trait]
    impl PubSub for NoopPubSub {
        async fn publish(&self, _event: &Event) -> Result<(Vec<String>, Vec<String>)> {
            Ok((vec![], vec![]))
        }

        async fn subscribe(
            &self,
            _filters: Filters,
            _handlers: SubscriptionHandlers,
        ) -> Result<String> {
            Ok("sub".to_string())
        }

        async fn subscription_relays(&self, _sub_id: &str) -> Vec<String> {
            vec![]
        }

        async fn unsubscribe(&self, _sub_id: &str) -> Result<(Vec<String>, Vec<String>)> {
            Ok((vec![], vec![]))
        }
    }

    fn broker() -> RemoteSigner {
        let remote = Keys::generate().unwrap();
        let token = BunkerToken {
            remote_pubkey: remote.public_key().to_string(),
            relays: vec!["wss://relay.example.com".to_string()],
            secret: Some("s3cret".to_string()),
        };
        RemoteSigner::new(Arc::new(NoopPubSub), token).unwrap()
    }

    #[test]
    fn wrapped_requests_are_signed_kind_24133_events() {
        let broker = broker();
        let event = broker.wrap(&SignerRequest::ping()).unwrap();

        assert_eq!(event.kind, KIND_NOSTR_CONNECT);
        assert_eq!(event.pubkey, broker.local_pubkey());
        assert_eq!(
            event.tags,
            vec![vec!["p".to_string(), broker.remote_pubkey().to_string()]]
        );
        assert!(!event.sig.is_empty());
        Keys::verify_event(&event).unwrap();
        // The payload is encrypted, not plaintext JSON.
        assert!(!event.content.contains("ping"));
    }

    #[test]
    fn response_filter_targets_the_pairing() {
        let broker = broker();
        let filters = broker.response_filters();

        assert_eq!(filters.authors, vec![broker.remote_pubkey().to_string()]);
        assert_eq!(filters.kinds, vec![KIND_NOSTR_CONNECT]);
        assert_eq!(
            filters.tags.get("#p"),
            Some(&vec![broker.local_pubkey().to_string()])
        );
        assert!(filters.since.is_some());
        assert_eq!(filters.limit, Some(1));
    }

    #[test]
    fn connection_token_mentions_relays_and_metadata() {
        let broker = broker();
        let token = broker
            .connection_token(ConnectMetadata {
                name: "weft".to_string(),
                url: "https://example.com".to_string(),
                description: "test".to_string(),
            })
            .unwrap();
        assert!(token.starts_with(&format!("nostrconnect://{}", broker.local_pubkey())));
        assert!(token.contains("relay="));
        assert!(token.contains("metadata="));
    }

    #[test]
    fn decryptor_routes_by_payload_marker() {
        let remote = Keys::generate().unwrap();
        let local = Keys::generate().unwrap();
        let decryptor = ResponseDecryptor::new(&local, remote.public_key()).unwrap();

        let nip44_content =
            weft_core::nip44::encrypt(remote.secret_bytes(), local.public_key(), "pong").unwrap();
        let mut event = Event::new(remote.public_key(), KIND_NOSTR_CONNECT, vec![], nip44_content);
        assert_eq!(decryptor.open(&event).unwrap(), "pong");

        event.content =
            nip04::encrypt(remote.secret_bytes(), local.public_key(), "legacy pong").unwrap();
        assert_eq!(decryptor.open(&event).unwrap(), "legacy pong");
    }
}

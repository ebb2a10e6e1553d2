//! NIP-46: remote signing vocabulary.
//!
//! A client delegates signing to a remote signer reached over shared relays.
//! Requests are JSON-RPC-shaped `{id, method, params}` objects, encrypted to
//! the remote signer's public key and carried as the content of kind-24133
//! events. Two URL-shaped handshake tokens establish the pairing:
//!
//! - `bunker://<remote-pubkey>?relay=<uri>&...`: issued by the signer
//! - `nostrconnect://<local-pubkey>?relay=<uri>&...&metadata=<json>`: issued
//!   by the client

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Event kind for remote-signing requests and responses.
pub const KIND_NOSTR_CONNECT: u16 = 24133;

const BUNKER_SCHEME: &str = "bunker://";
const NOSTR_CONNECT_SCHEME: &str = "nostrconnect://";

/// Errors that can occur when handling connection tokens or requests.
#[derive(Debug, Error)]
pub enum Nip46Error {
    #[error("invalid connection token: {0}")]
    InvalidToken(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// A request to the remote signer, carried encrypted in event content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignerRequest {
    /// Random request id, echoed by the response.
    pub id: String,
    /// Method name, e.g. `ping` or `sign_event`.
    pub method: String,
    /// Positional parameters.
    pub params: Vec<String>,
}

impl SignerRequest {
    pub fn new(method: impl Into<String>, params: Vec<String>) -> Self {
        Self {
            id: generate_request_id(),
            method: method.into(),
            params,
        }
    }

    /// A keep-alive probe. The signer answers with the string `pong`.
    pub fn ping() -> Self {
        Self::new("ping", vec![])
    }

    /// Establish the pairing with a remote signer. The shared secret from
    /// the bunker token rides along when one was issued.
    pub fn connect(remote_pubkey: impl Into<String>, secret: Option<String>) -> Self {
        let mut params = vec![remote_pubkey.into()];
        if let Some(secret) = secret {
            params.push(secret);
        }
        Self::new("connect", params)
    }

    /// Ask for the public key of the user the signer signs as.
    pub fn get_public_key() -> Self {
        Self::new("get_public_key", vec![])
    }

    /// Ask the signer to sign the given serialized event. The signer answers
    /// with the serialized signed event.
    pub fn sign_event(event_json: impl Into<String>) -> Self {
        Self::new("sign_event", vec![event_json.into()])
    }

    pub fn to_json(&self) -> Result<String, Nip46Error> {
        serde_json::to_string(self).map_err(|e| Nip46Error::Serialization(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, Nip46Error> {
        serde_json::from_str(json).map_err(|e| Nip46Error::Serialization(e.to_string()))
    }
}

/// Generate a random request id: 16 random bytes, hex-encoded.
pub fn generate_request_id() -> String {
    use rand::Rng;
    let bytes: [u8; 16] = rand::rng().random();
    hex::encode(bytes)
}

/// A `bunker://` connection token, issued by a remote signer.
#[derive(Debug, Clone)]
pub struct BunkerToken {
    /// The remote signer's x-only public key, lowercase hex.
    pub remote_pubkey: String,
    /// Relays shared with the signer.
    pub relays: Vec<String>,
    /// Optional shared secret.
    pub secret: Option<String>,
}

impl BunkerToken {
    /// Parse a `bunker://` token.
    pub fn parse(token: &str) -> Result<Self, Nip46Error> {
        let rest = token.strip_prefix(BUNKER_SCHEME).ok_or_else(|| {
            Nip46Error::InvalidToken(format!("token must begin with {BUNKER_SCHEME}"))
        })?;

        let (pubkey, query) = match rest.split_once('?') {
            Some((pubkey, query)) => (pubkey, Some(query)),
            None => (rest, None),
        };

        if pubkey.len() != 64 || !pubkey.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Nip46Error::InvalidToken(
                "remote signer pubkey must be 64 hex characters".to_string(),
            ));
        }

        let mut relays = Vec::new();
        let mut secret = None;
        if let Some(query) = query {
            for param in query.split('&') {
                let Some((key, value)) = param.split_once('=') else {
                    return Err(Nip46Error::InvalidToken(format!(
                        "query parameter `{param}` is not of the form key=value"
                    )));
                };
                match key {
                    "relay" => {
                        let decoded = urlencoding::decode(value)
                            .map_err(|e| Nip46Error::InvalidToken(e.to_string()))?;
                        relays.push(decoded.into_owned());
                    }
                    "secret" => secret = Some(value.to_string()),
                    _ => {}
                }
            }
        }

        if relays.is_empty() {
            return Err(Nip46Error::InvalidToken(
                "at least one relay is required".to_string(),
            ));
        }

        Ok(Self {
            remote_pubkey: pubkey.to_ascii_lowercase(),
            relays,
            secret,
        })
    }
}

impl std::fmt::Display for BunkerToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{BUNKER_SCHEME}{}", self.remote_pubkey)?;
        let mut sep = '?';
        for relay in &self.relays {
            write!(f, "{sep}relay={}", urlencoding::encode(relay))?;
            sep = '&';
        }
        if let Some(secret) = &self.secret {
            write!(f, "{sep}secret={secret}")?;
        }
        Ok(())
    }
}

/// Client metadata carried by a `nostrconnect://` token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectMetadata {
    pub name: String,
    pub url: String,
    pub description: String,
}

/// A `nostrconnect://` connection token, issued by the client.
#[derive(Debug, Clone)]
pub struct NostrConnectToken {
    /// The client's ephemeral x-only public key, lowercase hex.
    pub local_pubkey: String,
    /// Relays on which the client listens for the signer.
    pub relays: Vec<String>,
    /// Client metadata shown by the signer.
    pub metadata: ConnectMetadata,
}

impl NostrConnectToken {
    pub fn new(
        local_pubkey: impl Into<String>,
        relays: Vec<String>,
        metadata: ConnectMetadata,
    ) -> Result<Self, Nip46Error> {
        if relays.is_empty() {
            return Err(Nip46Error::InvalidToken(
                "at least one relay is required".to_string(),
            ));
        }
        Ok(Self {
            local_pubkey: local_pubkey.into(),
            relays,
            metadata,
        })
    }

    /// Render the token.
    pub fn to_token(&self) -> Result<String, Nip46Error> {
        let metadata = serde_json::to_string(&self.metadata)
            .map_err(|e| Nip46Error::Serialization(e.to_string()))?;

        let mut token = format!("{NOSTR_CONNECT_SCHEME}{}", self.local_pubkey);
        let mut sep = '?';
        for relay in &self.relays {
            token.push(sep);
            token.push_str("relay=");
            token.push_str(&urlencoding::encode(relay));
            sep = '&';
        }
        token.push(sep);
        token.push_str("metadata=");
        token.push_str(&urlencoding::encode(&metadata));
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PUBKEY: &str = "f7234bd4c1394dda46d09f35bd384dd30cc552ad5541990f98844fb06676e9ca";

    #[test]
    fn signer_requests_have_unique_ids() {
        let a = SignerRequest::ping();
        let b = SignerRequest::ping();
        assert_eq!(a.method, "ping");
        assert!(a.params.is_empty());
        assert_eq!(a.id.len(), 32);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn connect_request_carries_the_secret_when_present() {
        let request = SignerRequest::connect(PUBKEY, Some("s3cret".to_string()));
        assert_eq!(request.method, "connect");
        assert_eq!(request.params, vec![PUBKEY.to_string(), "s3cret".to_string()]);

        let request = SignerRequest::connect(PUBKEY, None);
        assert_eq!(request.params, vec![PUBKEY.to_string()]);
    }

    #[test]
    fn sign_event_request_carries_the_payload() {
        let event_json = r#"{"kind":1,"content":"test"}"#;
        let request = SignerRequest::sign_event(event_json);
        assert_eq!(request.method, "sign_event");
        assert_eq!(request.params, vec![event_json.to_string()]);

        let json = request.to_json().unwrap();
        let recovered = SignerRequest::from_json(&json).unwrap();
        assert_eq!(recovered.id, request.id);
        assert_eq!(recovered.params, request.params);
    }

    #[test]
    fn bunker_token_parses_relays_and_secret() {
        let token = format!(
            "bunker://{PUBKEY}?relay=wss%3A%2F%2Frelay.example.com&secret=abc123"
        );
        let parsed = BunkerToken::parse(&token).unwrap();
        assert_eq!(parsed.remote_pubkey, PUBKEY);
        assert_eq!(parsed.relays, vec!["wss://relay.example.com".to_string()]);
        assert_eq!(parsed.secret.as_deref(), Some("abc123"));
    }

    #[test]
    fn bunker_token_accepts_multiple_relays() {
        let token = format!(
            "bunker://{PUBKEY}?relay=wss%3A%2F%2Fone.example&relay=wss%3A%2F%2Ftwo.example"
        );
        let parsed = BunkerToken::parse(&token).unwrap();
        assert_eq!(parsed.relays.len(), 2);
        assert!(parsed.secret.is_none());
    }

    #[test]
    fn bunker_token_rejects_malformed_input() {
        assert!(BunkerToken::parse("nostrconnect://abc").is_err());
        assert!(BunkerToken::parse("bunker://short?relay=wss%3A%2F%2Fr.example").is_err());
        assert!(BunkerToken::parse(&format!("bunker://{PUBKEY}")).is_err());
        assert!(BunkerToken::parse(&format!("bunker://{PUBKEY}?relay")).is_err());
    }

    #[test]
    fn bunker_token_round_trips() {
        let token = BunkerToken {
            remote_pubkey: PUBKEY.to_string(),
            relays: vec!["wss://relay.example.com".to_string()],
            secret: Some("s3cret".to_string()),
        };
        let rendered = token.to_string();
        let parsed = BunkerToken::parse(&rendered).unwrap();
        assert_eq!(parsed.remote_pubkey, token.remote_pubkey);
        assert_eq!(parsed.relays, token.relays);
        assert_eq!(parsed.secret, token.secret);
    }

    #[test]
    fn nostrconnect_token_carries_metadata_json() {
        let token = NostrConnectToken::new(
            PUBKEY,
            vec!["wss://relay.example.com".to_string()],
            ConnectMetadata {
                name: "weft".to_string(),
                url: "https://example.com".to_string(),
                description: "a test client".to_string(),
            },
        )
        .unwrap();

        let rendered = token.to_token().unwrap();
        assert!(rendered.starts_with(&format!("nostrconnect://{PUBKEY}?")));
        assert!(rendered.contains("relay=wss%3A%2F%2Frelay.example.com"));

        let metadata_raw = rendered.split("metadata=").nth(1).unwrap();
        let metadata: ConnectMetadata =
            serde_json::from_str(&urlencoding::decode(metadata_raw).unwrap()).unwrap();
        assert_eq!(metadata.name, "weft");
        assert_eq!(metadata.description, "a test client");
    }

    #[test]
    fn nostrconnect_token_requires_relays() {
        let result = NostrConnectToken::new(
            PUBKEY,
            vec![],
            ConnectMetadata {
                name: String::new(),
                url: String::new(),
                description: String::new(),
            },
        );
        assert!(result.is_err());
    }
}

//! Nostr events: the single wire unit of the protocol.
//!
//! Every payload exchanged with a relay is an event. The significance of a
//! particular event is carried by its `kind`, `tags`, and `content`; the `id`
//! is content-derived and the `sig` binds the whole record to its author.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Valid event kinds are integers in `[0, MAX_EVENT_KIND)`.
pub const MAX_EVENT_KIND: u16 = 40_000;

/// Errors that can occur when validating, serializing, or parsing events.
#[derive(Debug, Error)]
pub enum EventError {
    #[error("the pubkey of the event author is required")]
    MissingPubkey,

    #[error("event kind {0} is out of range")]
    InvalidKind(u16),

    #[error("the event has no id; derive it before use")]
    MissingId,

    #[error("the event is not signed")]
    MissingSignature,

    #[error("invalid event JSON: {0}")]
    InvalidJson(String),
}

/// A Nostr event.
///
/// The `id` is the lowercase hex SHA-256 of the canonical serialization and
/// is filled in by [`Event::ensure_id`] (or any path that serializes the
/// event). Once set it is never recomputed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// SHA-256 hash of the canonical event data, lowercase hex.
    pub id: String,
    /// X-only public key of the event author, lowercase hex.
    pub pubkey: String,
    /// Unix timestamp of the event creation, in seconds.
    pub created_at: i64,
    /// Event kind, in `[0, 40000)`.
    pub kind: u16,
    /// Arbitrary event metadata. Each tag is a non-empty list whose first
    /// element is the tag name.
    pub tags: Vec<Vec<String>>,
    /// Event content.
    pub content: String,
    /// 64-byte Schnorr signature over the event id, lowercase hex.
    pub sig: String,
}

impl Event {
    /// Create an unsigned event draft. The id and signature are filled in by
    /// the serialization and signing paths.
    pub fn new(
        pubkey: impl Into<String>,
        kind: u16,
        tags: Vec<Vec<String>>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: String::new(),
            pubkey: pubkey.into(),
            created_at: 0,
            kind,
            tags,
            content: content.into(),
            sig: String::new(),
        }
    }

    /// Validate the event fields.
    ///
    /// `created_at` defaults to the present if it is not already set.
    pub fn validate(&mut self) -> Result<(), EventError> {
        if self.pubkey.is_empty() {
            return Err(EventError::MissingPubkey);
        }
        if self.created_at <= 0 {
            self.created_at = unix_now();
        }
        if self.kind >= MAX_EVENT_KIND {
            return Err(EventError::InvalidKind(self.kind));
        }
        Ok(())
    }

    /// The canonical pre-image for the event id: the compact JSON array
    /// `[0, pubkey, created_at, kind, tags, content]` with no insignificant
    /// whitespace.
    pub fn canonical(&self) -> String {
        serde_json::json!([
            0,
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content
        ])
        .to_string()
    }

    /// Compute the event id from the current field values.
    pub fn compute_id(&self) -> String {
        let digest = Sha256::digest(self.canonical().as_bytes());
        hex::encode(digest)
    }

    /// Validate the event and derive its id if it is not already set.
    pub fn ensure_id(&mut self) -> Result<(), EventError> {
        self.validate()?;
        if self.id.is_empty() {
            self.id = self.compute_id();
        }
        Ok(())
    }

    /// Validate the event, derive its id, and serialize it to a JSON string.
    pub fn serialize(&mut self) -> Result<String, EventError> {
        self.ensure_id()?;
        serde_json::to_string(self).map_err(|e| EventError::InvalidJson(e.to_string()))
    }

    /// Parse an event from a JSON string. All seven fields must be present.
    pub fn from_json(json: &str) -> Result<Self, EventError> {
        serde_json::from_str(json).map_err(|e| EventError::InvalidJson(e.to_string()))
    }

    /// Parse an event from an already-parsed JSON value.
    pub fn from_value(value: serde_json::Value) -> Result<Self, EventError> {
        serde_json::from_value(value).map_err(|e| EventError::InvalidJson(e.to_string()))
    }

    /// Compare two events by id.
    ///
    /// Returns an error when either side has no id yet, since an event
    /// without an id has no identity to compare.
    pub fn same_as(&self, other: &Event) -> Result<bool, EventError> {
        if self.id.is_empty() || other.id.is_empty() {
            return Err(EventError::MissingId);
        }
        Ok(self.id == other.id)
    }
}

/// Events are equal when their ids are equal. An event without an id is
/// never equal to anything; use [`Event::same_as`] for a checked comparison.
impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        !self.id.is_empty() && self.id == other.id
    }
}

pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_event() -> Event {
        let mut event = Event::new(
            "f7234bd4c1394dda46d09f35bd384dd30cc552ad5541990f98844fb06676e9ca",
            1,
            vec![vec![
                "e".to_string(),
                "5c83da77af1dec6d7289834998ad7aafbd9e2191396d75ec3cc27f5a77226f36".to_string(),
            ]],
            "Hello, World!",
        );
        event.created_at = 1700000000;
        event
    }

    #[test]
    fn canonical_form_is_compact_array() {
        let mut event = Event::new("ab", 1, vec![], "hi");
        event.created_at = 123;
        assert_eq!(event.canonical(), r#"[0,"ab",123,1,[],"hi"]"#);
    }

    #[test]
    fn id_is_deterministic() {
        let a = test_event();
        let b = test_event();
        assert_eq!(a.compute_id(), b.compute_id());
        assert_eq!(a.compute_id().len(), 64);
    }

    #[test]
    fn id_depends_on_content() {
        let a = test_event();
        let mut b = test_event();
        b.content = "Welcome to Nostr!".to_string();
        assert_ne!(a.compute_id(), b.compute_id());
    }

    #[test]
    fn ensure_id_is_idempotent() {
        let mut event = test_event();
        event.ensure_id().unwrap();
        let first = event.id.clone();
        event.content = "mutated after the fact".to_string();
        event.ensure_id().unwrap();
        assert_eq!(event.id, first);
    }

    #[test]
    fn serialize_round_trips_by_id() {
        let mut event = test_event();
        let json = Event::serialize(&mut event).unwrap();
        let parsed = Event::from_json(&json).unwrap();
        assert!(event.same_as(&parsed).unwrap());
        assert_eq!(event, parsed);
    }

    #[test]
    fn validate_requires_pubkey() {
        let mut event = Event::new("", 1, vec![], "hi");
        assert!(matches!(event.validate(), Err(EventError::MissingPubkey)));
    }

    #[test]
    fn validate_rejects_out_of_range_kind() {
        let mut event = Event::new("ab", MAX_EVENT_KIND, vec![], "hi");
        assert!(matches!(
            event.validate(),
            Err(EventError::InvalidKind(MAX_EVENT_KIND))
        ));
    }

    #[test]
    fn validate_defaults_created_at() {
        let mut event = Event::new("ab", 1, vec![], "hi");
        event.validate().unwrap();
        assert!(event.created_at > 0);
    }

    #[test]
    fn parse_rejects_missing_fields() {
        let json = r#"{"pubkey":"ab","created_at":1,"kind":1,"tags":[],"content":"x"}"#;
        assert!(Event::from_json(json).is_err());
    }

    #[test]
    fn equality_without_id_is_a_typed_error() {
        let a = test_event();
        let b = test_event();
        assert!(matches!(a.same_as(&b), Err(EventError::MissingId)));
        assert_ne!(a, b);
    }
}

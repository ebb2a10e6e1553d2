//! Relay protocol wire frames.
//!
//! **Client to relay:**
//! - `["EVENT", <event>]`: publish an event
//! - `["REQ", <sub_id>, <filters>]`: open a subscription
//! - `["CLOSE", <sub_id>]`: close a subscription
//!
//! **Relay to client:**
//! - `["EVENT", <sub_id>, <event>]`: event matching a subscription
//! - `["EOSE", <sub_id>]`: end of stored events
//! - `["CLOSE", <sub_id>, <reason>]`: subscription ended by the relay
//! - `["OK", <event_id>, <bool>, <reason>]`: per-event acknowledgement
//! - `["NOTICE", <message>]`: human-readable message
//!
//! Frames with an unknown head are ignored rather than rejected; relays are
//! free to speak extensions this client does not understand.

use serde_json::{json, Value};
use thiserror::Error;

use crate::event::{Event, EventError};
use crate::filters::Filters;

/// Errors that can occur when building or parsing wire frames.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("invalid event in frame: {0}")]
    InvalidEvent(#[from] EventError),
}

/// Frames sent from the client to a relay.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    /// Publish an event.
    Event(Event),
    /// Open a subscription.
    Req {
        subscription_id: String,
        filters: Filters,
    },
    /// Close a subscription.
    Close { subscription_id: String },
}

impl ClientMessage {
    pub fn event(event: Event) -> Self {
        Self::Event(event)
    }

    pub fn req(subscription_id: impl Into<String>, filters: Filters) -> Self {
        Self::Req {
            subscription_id: subscription_id.into(),
            filters,
        }
    }

    pub fn close(subscription_id: impl Into<String>) -> Self {
        Self::Close {
            subscription_id: subscription_id.into(),
        }
    }

    /// Serialize the frame to its wire form.
    pub fn to_json(&self) -> Result<String, MessageError> {
        let value = match self {
            Self::Event(event) => json!(["EVENT", event]),
            Self::Req {
                subscription_id,
                filters,
            } => json!(["REQ", subscription_id, filters]),
            Self::Close { subscription_id } => json!(["CLOSE", subscription_id]),
        };
        serde_json::to_string(&value).map_err(|e| MessageError::InvalidJson(e.to_string()))
    }
}

/// Frames received from a relay.
#[derive(Debug, Clone)]
pub enum RelayMessage {
    /// An event matching a subscription.
    Event {
        subscription_id: String,
        event: Event,
    },
    /// End of stored events for a subscription.
    Eose { subscription_id: String },
    /// The relay ended a subscription.
    Closed {
        subscription_id: String,
        reason: String,
    },
    /// Acknowledgement for a published event.
    Ok {
        event_id: String,
        accepted: bool,
        reason: String,
    },
    /// Human-readable message from the relay.
    Notice { message: String },
}

impl RelayMessage {
    /// Parse a raw frame received from a relay.
    ///
    /// Returns `Ok(None)` for frames this client does not consume (unknown
    /// heads, non-array payloads) and an error for frames that claim a known
    /// head but are structurally broken.
    pub fn from_json(raw: &str) -> Result<Option<Self>, MessageError> {
        let value: Value =
            serde_json::from_str(raw).map_err(|e| MessageError::InvalidJson(e.to_string()))?;

        let arr = match value.as_array() {
            Some(arr) if !arr.is_empty() => arr,
            _ => return Ok(None),
        };

        let head = match arr[0].as_str() {
            Some(head) => head,
            None => return Ok(None),
        };

        match head {
            "EVENT" => {
                let subscription_id = frame_str(arr, 1, "subscription id")?;
                let event = Event::from_value(
                    arr.get(2)
                        .cloned()
                        .ok_or_else(|| MessageError::InvalidFrame("missing event".to_string()))?,
                )?;
                Ok(Some(Self::Event {
                    subscription_id,
                    event,
                }))
            }
            "EOSE" => Ok(Some(Self::Eose {
                subscription_id: frame_str(arr, 1, "subscription id")?,
            })),
            "CLOSE" => Ok(Some(Self::Closed {
                subscription_id: frame_str(arr, 1, "subscription id")?,
                reason: frame_str(arr, 2, "reason")?,
            })),
            "OK" => {
                let event_id = frame_str(arr, 1, "event id")?;
                let accepted = arr
                    .get(2)
                    .and_then(Value::as_bool)
                    .ok_or_else(|| MessageError::InvalidFrame("missing flag".to_string()))?;
                let reason = frame_str(arr, 3, "reason").unwrap_or_default();
                Ok(Some(Self::Ok {
                    event_id,
                    accepted,
                    reason,
                }))
            }
            "NOTICE" => Ok(Some(Self::Notice {
                message: frame_str(arr, 1, "message")?,
            })),
            _ => Ok(None),
        }
    }

    /// Serialize the frame to its wire form, as a relay would emit it.
    pub fn to_json(&self) -> Result<String, MessageError> {
        let value = match self {
            Self::Event {
                subscription_id,
                event,
            } => json!(["EVENT", subscription_id, event]),
            Self::Eose { subscription_id } => json!(["EOSE", subscription_id]),
            Self::Closed {
                subscription_id,
                reason,
            } => json!(["CLOSE", subscription_id, reason]),
            Self::Ok {
                event_id,
                accepted,
                reason,
            } => json!(["OK", event_id, accepted, reason]),
            Self::Notice { message } => json!(["NOTICE", message]),
        };
        serde_json::to_string(&value).map_err(|e| MessageError::InvalidJson(e.to_string()))
    }
}

fn frame_str(arr: &[Value], index: usize, what: &str) -> Result<String, MessageError> {
    arr.get(index)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| MessageError::InvalidFrame(format!("missing {what}")))
}

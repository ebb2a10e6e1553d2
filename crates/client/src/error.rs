//! Error types for the relay fabric.

use thiserror::Error;
use weft_core::nip04::Nip04Error;
use weft_core::nip44::Nip44Error;
use weft_core::{EventError, FilterError, KeyError, MessageError, Nip46Error};

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors surfaced by client operations.
///
/// Per-relay transport failures and relay rejections are not errors: every
/// operation that targets a set of relays returns a partitioned
/// `(ok, failed)` result instead of failing on partial success.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The event is structurally invalid.
    #[error("invalid event: {0}")]
    Event(#[from] EventError),

    /// The filters are invalid.
    #[error("invalid filter: {0}")]
    Filter(#[from] FilterError),

    /// A wire frame could not be built.
    #[error("invalid frame: {0}")]
    Message(#[from] MessageError),

    /// A connection token could not be parsed or rendered.
    #[error("invalid connection token: {0}")]
    ConnectionToken(#[from] Nip46Error),

    /// Key material is invalid.
    #[error("key error: {0}")]
    Key(#[from] KeyError),

    /// The signer could not produce a signature.
    #[error("signer unavailable: {0}")]
    Signer(String),

    /// A cipher, key validation, or signature routine failed.
    #[error("crypto failure: {0}")]
    Crypto(String),

    /// The transport could not carry out an operation at all.
    #[error("transport failure: {0}")]
    Transport(String),

    /// JSON handling failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<Nip04Error> for ClientError {
    fn from(error: Nip04Error) -> Self {
        Self::Crypto(error.to_string())
    }
}

impl From<Nip44Error> for ClientError {
    fn from(error: Nip44Error) -> Self {
        Self::Crypto(error.to_string())
    }
}

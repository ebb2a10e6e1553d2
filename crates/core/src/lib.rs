//! Nostr protocol core for weft.
//!
//! This crate provides the runtime-free half of the library:
//! - Events: canonical serialization, id derivation, validation
//! - Filters: relay query descriptors
//! - Wire frames: client→relay and relay→client protocol messages
//! - Keys: secp256k1 keypairs, Schnorr signing and verification
//! - NIP-04: legacy AES-256-CBC encrypted payloads
//! - NIP-44: versioned ChaCha20 + HMAC-SHA256 encrypted payloads
//! - NIP-46: remote-signing requests and connection tokens
//!
//! The async relay fabric (connection pool, subscriptions, publishing,
//! signers) lives in `weft-client`.

mod event;
mod filters;
mod keys;
mod message;
pub mod nip04;
pub mod nip44;
pub mod nip46;

pub use event::{Event, EventError, MAX_EVENT_KIND};
pub use filters::{FilterError, Filters};
pub use keys::{KeyError, Keys};
pub use message::{ClientMessage, MessageError, RelayMessage};
pub use nip46::{
    BunkerToken, ConnectMetadata, Nip46Error, NostrConnectToken, SignerRequest,
    KIND_NOSTR_CONNECT,
};

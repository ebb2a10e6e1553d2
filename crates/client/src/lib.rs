//! Concurrent multi-relay Nostr client.
//!
//! This crate provides the async half of weft:
//! - [`Transport`]: the duplex text-channel contract relays are reached
//!   through, with a tokio-tungstenite implementation
//! - [`RelayPool`]: parallel connect/disconnect with active-set tracking
//! - [`NostrService`]: publishing with per-relay acknowledgements, batch and
//!   streaming queries, subscription lifecycle
//! - [`Signer`]: the signing contract, with a local Schnorr signer and a
//!   NIP-46 remote-signer broker
//!
//! # Example
//!
//! ```no_run
//! use weft_client::NostrClient;
//! use weft_core::{Event, Filters};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = NostrClient::builder()
//!         .default_relays(["wss://relay.damus.io", "wss://nos.lol"])
//!         .build()?;
//!
//!     client.start().await;
//!     client.connect().await?;
//!
//!     let mut event = Event::new("", 1, vec![], "Hello, World!");
//!     let (accepted, failed) = client.publish(&mut event).await?;
//!     println!("accepted by {accepted:?}, failed on {failed:?}");
//!
//!     let filters = Filters {
//!         kinds: vec![1],
//!         limit: Some(16),
//!         ..Default::default()
//!     };
//!     for event in client.query(filters).await? {
//!         println!("{}: {}", event.pubkey, event.content);
//!     }
//!
//!     client.disconnect().await?;
//!     client.shutdown().await;
//!     Ok(())
//! }
//! ```

mod client;
mod error;
mod pool;
mod remote_signer;
mod router;
mod service;
mod signer;
mod subscriptions;
mod transport;
mod websocket;

pub use client::{NostrClient, NostrClientBuilder};
pub use error::{ClientError, Result};
pub use pool::RelayPool;
pub use remote_signer::{Encryption, RemoteSigner, RemoteSignerConfig};
pub use service::{NostrService, PubSub, ServiceConfig};
pub use signer::{LocalSigner, Signer};
pub use subscriptions::{
    ClosedHandler, EoseHandler, EventHandler, SubscriptionHandlers, SubscriptionManager,
};
pub use transport::{MessageHandler, Transport};
pub use websocket::{TransportConfig, WebSocketTransport};

//! The signing contract and the local Schnorr signer.

use async_trait::async_trait;

use weft_core::{Event, Keys};

use crate::error::{ClientError, Result};

/// Signs events in place by populating `sig` (and `pubkey`/`id` when the
/// signer owns them).
#[async_trait]
pub trait Signer: Send + Sync {
    async fn sign(&self, event: &mut Event) -> Result<()>;
}

/// Signs locally with a held secp256k1 keypair.
pub struct LocalSigner {
    keys: Keys,
}

impl LocalSigner {
    pub fn new(keys: Keys) -> Self {
        Self { keys }
    }

    /// A signer over a freshly generated keypair.
    pub fn generate() -> Result<Self> {
        let keys = Keys::generate().map_err(|e| ClientError::Signer(e.to_string()))?;
        Ok(Self { keys })
    }

    /// The signer's x-only public key, lowercase hex.
    pub fn public_key(&self) -> &str {
        self.keys.public_key()
    }
}

#[async_trait]
impl Signer for LocalSigner {
    async fn sign(&self, event: &mut Event) -> Result<()> {
        self.keys
            .sign_event(event)
            .map_err(|e| ClientError::Signer(e.to_string()))
    }
}

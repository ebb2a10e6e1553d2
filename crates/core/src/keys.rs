//! secp256k1 keypairs: generation, Schnorr signing, and verification.

use rand::RngCore;
use secp256k1::{
    ecdh, schnorr, All, Keypair, Message, Parity, PublicKey, Secp256k1, SecretKey, XOnlyPublicKey,
};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::event::Event;

/// Upper bound on attempts when drawing random scalars for a new secret key.
const MAX_KEYGEN_ATTEMPTS: usize = 64;

/// Errors that can occur when working with keys and signatures.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("failed to generate a valid secret key")]
    Generation,

    #[error("invalid secret key")]
    InvalidSecretKey,

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("failed to sign event: {0}")]
    Signature(String),

    #[error("invalid signature encoding")]
    InvalidSignature,

    #[error("event id does not match the event data")]
    IdMismatch,

    #[error("signature verification failed")]
    Verification,
}

/// A secp256k1 keypair.
///
/// The secret scalar is kept in a zeroized buffer for the ECDH paths; the
/// buffer is wiped when the keys are dropped.
pub struct Keys {
    secp: Secp256k1<All>,
    keypair: Keypair,
    secret: Zeroizing<[u8; 32]>,
    public_hex: String,
}

impl Keys {
    /// Generate a fresh keypair.
    ///
    /// Random scalars are drawn until one is a valid secret key, bounded to
    /// avoid spinning on a broken entropy source.
    pub fn generate() -> Result<Self, KeyError> {
        let mut bytes = Zeroizing::new([0u8; 32]);
        for _ in 0..MAX_KEYGEN_ATTEMPTS {
            rand::rng().fill_bytes(bytes.as_mut());
            if let Ok(secret_key) = SecretKey::from_slice(bytes.as_ref()) {
                return Ok(Self::from_secret_key(secret_key, bytes));
            }
        }
        Err(KeyError::Generation)
    }

    /// Build keys from a 64-character hex secret key.
    pub fn parse(secret_hex: &str) -> Result<Self, KeyError> {
        let decoded = hex::decode(secret_hex).map_err(|_| KeyError::InvalidSecretKey)?;
        let mut bytes = Zeroizing::new([0u8; 32]);
        if decoded.len() != bytes.len() {
            return Err(KeyError::InvalidSecretKey);
        }
        bytes.copy_from_slice(&decoded);
        let secret_key =
            SecretKey::from_slice(bytes.as_ref()).map_err(|_| KeyError::InvalidSecretKey)?;
        Ok(Self::from_secret_key(secret_key, bytes))
    }

    fn from_secret_key(secret_key: SecretKey, secret: Zeroizing<[u8; 32]>) -> Self {
        let secp = Secp256k1::new();
        let keypair = Keypair::from_secret_key(&secp, &secret_key);
        let (xonly, _parity) = keypair.x_only_public_key();
        let public_hex = hex::encode(xonly.serialize());
        Self {
            secp,
            keypair,
            secret,
            public_hex,
        }
    }

    /// The x-only public key, lowercase hex.
    pub fn public_key(&self) -> &str {
        &self.public_hex
    }

    /// The raw secret scalar, for the ECDH-based cipher paths.
    pub fn secret_bytes(&self) -> &[u8; 32] {
        &self.secret
    }

    /// Sign an event in place.
    ///
    /// Fills the author pubkey when unset, validates the event, derives its
    /// id, and signs the id digest with BIP-340 Schnorr using fresh 32-byte
    /// auxiliary randomness.
    pub fn sign_event(&self, event: &mut Event) -> Result<(), KeyError> {
        if event.pubkey.is_empty() {
            event.pubkey = self.public_hex.clone();
        }
        event
            .ensure_id()
            .map_err(|e| KeyError::Signature(e.to_string()))?;

        let digest = decode_id(&event.id)?;
        let message = Message::from_digest(digest);

        let mut aux = [0u8; 32];
        rand::rng().fill_bytes(&mut aux);

        let signature = self
            .secp
            .sign_schnorr_with_aux_rand(&message, &self.keypair, &aux);
        event.sig = hex::encode(signature.serialize());
        Ok(())
    }

    /// Verify a signed event: the id must match the event data and the
    /// signature must verify against the author pubkey.
    pub fn verify_event(event: &Event) -> Result<(), KeyError> {
        if event.id.is_empty() || event.sig.is_empty() {
            return Err(KeyError::Verification);
        }
        if event.id != event.compute_id() {
            return Err(KeyError::IdMismatch);
        }

        let digest = decode_id(&event.id)?;
        let message = Message::from_digest(digest);
        let pubkey = parse_xonly(&event.pubkey)?;

        let sig_bytes = hex::decode(&event.sig).map_err(|_| KeyError::InvalidSignature)?;
        let signature =
            schnorr::Signature::from_slice(&sig_bytes).map_err(|_| KeyError::InvalidSignature)?;

        let secp = Secp256k1::verification_only();
        secp.verify_schnorr(&signature, &message, &pubkey)
            .map_err(|_| KeyError::Verification)
    }
}

impl std::fmt::Debug for Keys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keys")
            .field("public_key", &self.public_hex)
            .finish_non_exhaustive()
    }
}

/// Derive the shared ECDH x-coordinate between a secret key and a peer
/// public key given as hex (x-only or compressed).
///
/// This is the unhashed x-coordinate of the shared point, which both the
/// NIP-04 and NIP-44 key schedules are defined over.
pub(crate) fn shared_secret_x(
    secret: &[u8; 32],
    public_key_hex: &str,
) -> Result<Zeroizing<[u8; 32]>, KeyError> {
    let secret_key = SecretKey::from_slice(secret).map_err(|_| KeyError::InvalidSecretKey)?;
    let public_key = parse_public_key(public_key_hex)?;

    let point = ecdh::shared_secret_point(&public_key, &secret_key);
    let mut shared_x = Zeroizing::new([0u8; 32]);
    shared_x.copy_from_slice(&point[..32]);
    Ok(shared_x)
}

/// Parse a peer public key from hex: either a 64-character x-only key (even
/// parity is assumed, as on the Nostr wire) or a 66-character compressed key.
fn parse_public_key(public_key_hex: &str) -> Result<PublicKey, KeyError> {
    let decoded = hex::decode(public_key_hex)
        .map_err(|_| KeyError::InvalidPublicKey(public_key_hex.to_string()))?;
    match decoded.len() {
        32 => {
            let xonly = XOnlyPublicKey::from_slice(&decoded)
                .map_err(|_| KeyError::InvalidPublicKey(public_key_hex.to_string()))?;
            Ok(PublicKey::from_x_only_public_key(xonly, Parity::Even))
        }
        33 => PublicKey::from_slice(&decoded)
            .map_err(|_| KeyError::InvalidPublicKey(public_key_hex.to_string())),
        _ => Err(KeyError::InvalidPublicKey(public_key_hex.to_string())),
    }
}

fn decode_id(id: &str) -> Result<[u8; 32], KeyError> {
    let decoded = hex::decode(id).map_err(|_| KeyError::IdMismatch)?;
    decoded.try_into().map_err(|_| KeyError::IdMismatch)
}

fn parse_xonly(public_key_hex: &str) -> Result<XOnlyPublicKey, KeyError> {
    let decoded = hex::decode(public_key_hex)
        .map_err(|_| KeyError::InvalidPublicKey(public_key_hex.to_string()))?;
    XOnlyPublicKey::from_slice(&decoded)
        .map_err(|_| KeyError::InvalidPublicKey(public_key_hex.to_string()))
}

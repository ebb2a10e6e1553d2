//! NIP-44: versioned encrypted payloads (version 2).
//!
//! The construction:
//! - ECDH over secp256k1, then HKDF-extract with the salt `nip44-v2` to get
//!   a per-pair conversation key
//! - per-message HKDF-expand of a random 32-byte nonce into a ChaCha20 key,
//!   a ChaCha20 nonce, and an HMAC-SHA256 key
//! - ChaCha20 over the length-prefixed, power-of-two padded plaintext
//! - HMAC-SHA256 over nonce ‖ ciphertext
//!
//! Wire form: `base64(version ‖ nonce ‖ ciphertext ‖ mac)`.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::keys::{shared_secret_x, KeyError};

/// NIP-44 version 2.
pub const VERSION: u8 = 2;

/// Plaintext length bounds, in bytes.
pub const MIN_PLAINTEXT_LEN: usize = 1;
pub const MAX_PLAINTEXT_LEN: usize = 65535;

/// Minimum padded message size.
const MIN_PADDED_LEN: usize = 32;

/// Payload component sizes.
const NONCE_SIZE: usize = 32;
const MAC_SIZE: usize = 32;
const CHACHA_KEY_SIZE: usize = 32;
const CHACHA_NONCE_SIZE: usize = 12;
const HMAC_KEY_SIZE: usize = 32;

/// HKDF salt for the conversation key.
const HKDF_SALT: &[u8] = b"nip44-v2";

type HmacSha256 = Hmac<Sha256>;

/// Errors that can occur during NIP-44 operations.
#[derive(Debug, Error)]
pub enum Nip44Error {
    #[error("plaintext too short (minimum {MIN_PLAINTEXT_LEN} byte)")]
    PlaintextTooShort,

    #[error("plaintext too long (maximum {MAX_PLAINTEXT_LEN} bytes)")]
    PlaintextTooLong,

    #[error("invalid payload structure")]
    InvalidPayload,

    #[error("unsupported version: {0}")]
    UnsupportedVersion(u8),

    #[error("MAC verification failed")]
    MacVerificationFailed,

    #[error("invalid padding")]
    InvalidPadding,

    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("key error: {0}")]
    Key(#[from] KeyError),
}

/// A reusable cipher bound to one conversation.
///
/// Derives the conversation key once and keeps it for the lifetime of the
/// value; the key buffer is zeroized on drop. Each encryption draws a fresh
/// random nonce.
pub struct Nip44Cipher {
    conversation_key: Zeroizing<[u8; 32]>,
}

impl Nip44Cipher {
    /// Build a cipher for the conversation between a secret key and a peer
    /// public key (hex, x-only or compressed).
    pub fn new(secret_key: &[u8; 32], peer_public_key: &str) -> Result<Self, Nip44Error> {
        let shared_x = shared_secret_x(secret_key, peer_public_key)?;

        let (prk, _) = Hkdf::<Sha256>::extract(Some(HKDF_SALT), shared_x.as_ref());
        let mut conversation_key = Zeroizing::new([0u8; 32]);
        conversation_key.copy_from_slice(&prk);

        Ok(Self { conversation_key })
    }

    /// Encrypt a plaintext, producing the base64 wire payload.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, Nip44Error> {
        let mut nonce = [0u8; NONCE_SIZE];
        use rand::RngCore;
        rand::rng().fill_bytes(&mut nonce);

        self.encrypt_with_nonce(plaintext, &nonce)
    }

    fn encrypt_with_nonce(&self, plaintext: &str, nonce: &[u8; 32]) -> Result<String, Nip44Error> {
        let keys = MessageKeys::derive(&self.conversation_key, nonce)?;

        let mut ciphertext = pad(plaintext)?;
        let mut cipher = ChaCha20::new((&*keys.chacha_key).into(), (&*keys.chacha_nonce).into());
        cipher.apply_keystream(&mut ciphertext);

        let mut mac = HmacSha256::new_from_slice(keys.hmac_key.as_ref())
            .map_err(|_| Nip44Error::InvalidPayload)?;
        mac.update(nonce);
        mac.update(&ciphertext);
        let mac_bytes = mac.finalize().into_bytes();

        let mut payload = Vec::with_capacity(1 + NONCE_SIZE + ciphertext.len() + MAC_SIZE);
        payload.push(VERSION);
        payload.extend_from_slice(nonce);
        payload.extend_from_slice(&ciphertext);
        payload.extend_from_slice(&mac_bytes);

        Ok(BASE64.encode(&payload))
    }

    /// Decrypt a base64 wire payload.
    pub fn decrypt(&self, payload: &str) -> Result<String, Nip44Error> {
        let decoded = BASE64.decode(payload)?;

        if decoded.len() < 1 + NONCE_SIZE + MIN_PADDED_LEN + MAC_SIZE {
            return Err(Nip44Error::InvalidPayload);
        }

        let version = decoded[0];
        if version != VERSION {
            return Err(Nip44Error::UnsupportedVersion(version));
        }

        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&decoded[1..1 + NONCE_SIZE]);
        let ciphertext = &decoded[1 + NONCE_SIZE..decoded.len() - MAC_SIZE];
        let mac_received = &decoded[decoded.len() - MAC_SIZE..];

        let keys = MessageKeys::derive(&self.conversation_key, &nonce)?;

        let mut mac = HmacSha256::new_from_slice(keys.hmac_key.as_ref())
            .map_err(|_| Nip44Error::InvalidPayload)?;
        mac.update(&nonce);
        mac.update(ciphertext);
        mac.verify_slice(mac_received)
            .map_err(|_| Nip44Error::MacVerificationFailed)?;

        let mut plaintext = Zeroizing::new(ciphertext.to_vec());
        let mut cipher = ChaCha20::new((&*keys.chacha_key).into(), (&*keys.chacha_nonce).into());
        cipher.apply_keystream(&mut plaintext);

        unpad(&plaintext)
    }
}

/// Encrypt a plaintext to a peer with a one-shot cipher.
pub fn encrypt(
    secret_key: &[u8; 32],
    peer_public_key: &str,
    plaintext: &str,
) -> Result<String, Nip44Error> {
    Nip44Cipher::new(secret_key, peer_public_key)?.encrypt(plaintext)
}

/// Decrypt a payload from a peer with a one-shot cipher.
pub fn decrypt(
    secret_key: &[u8; 32],
    peer_public_key: &str,
    payload: &str,
) -> Result<String, Nip44Error> {
    Nip44Cipher::new(secret_key, peer_public_key)?.decrypt(payload)
}

/// Per-message key material, wiped when dropped.
struct MessageKeys {
    chacha_key: Zeroizing<[u8; CHACHA_KEY_SIZE]>,
    chacha_nonce: Zeroizing<[u8; CHACHA_NONCE_SIZE]>,
    hmac_key: Zeroizing<[u8; HMAC_KEY_SIZE]>,
}

impl MessageKeys {
    /// HKDF-expand the conversation key with the message nonce into the
    /// ChaCha20 key, ChaCha20 nonce, and HMAC key.
    fn derive(conversation_key: &[u8; 32], nonce: &[u8; 32]) -> Result<Self, Nip44Error> {
        let hkdf = Hkdf::<Sha256>::from_prk(conversation_key)
            .map_err(|_| Nip44Error::InvalidPayload)?;

        let mut output = Zeroizing::new([0u8; CHACHA_KEY_SIZE + CHACHA_NONCE_SIZE + HMAC_KEY_SIZE]);
        hkdf.expand(nonce, output.as_mut())
            .map_err(|_| Nip44Error::InvalidPayload)?;

        let mut chacha_key = Zeroizing::new([0u8; CHACHA_KEY_SIZE]);
        let mut chacha_nonce = Zeroizing::new([0u8; CHACHA_NONCE_SIZE]);
        let mut hmac_key = Zeroizing::new([0u8; HMAC_KEY_SIZE]);

        chacha_key.copy_from_slice(&output[0..32]);
        chacha_nonce.copy_from_slice(&output[32..44]);
        hmac_key.copy_from_slice(&output[44..76]);

        Ok(Self {
            chacha_key,
            chacha_nonce,
            hmac_key,
        })
    }
}

/// Padded length for a given unpadded length: power-of-two rounding up to
/// 256 bytes, then multiples of 32, with a 32-byte floor.
fn calc_padded_len(unpadded_len: usize) -> usize {
    if unpadded_len <= 32 {
        return 32;
    }
    if unpadded_len <= 256 {
        unpadded_len.next_power_of_two()
    } else {
        unpadded_len.div_ceil(32) * 32
    }
}

/// Pad a plaintext: `[length: u16 big-endian][plaintext][zeros]`.
fn pad(plaintext: &str) -> Result<Vec<u8>, Nip44Error> {
    let bytes = plaintext.as_bytes();
    if bytes.len() < MIN_PLAINTEXT_LEN {
        return Err(Nip44Error::PlaintextTooShort);
    }
    if bytes.len() > MAX_PLAINTEXT_LEN {
        return Err(Nip44Error::PlaintextTooLong);
    }

    let unpadded_len = 2 + bytes.len();
    let mut padded = vec![0u8; calc_padded_len(unpadded_len)];
    padded[0..2].copy_from_slice(&(bytes.len() as u16).to_be_bytes());
    padded[2..unpadded_len].copy_from_slice(bytes);
    Ok(padded)
}

/// Validate the padding structure and extract the plaintext.
fn unpad(padded: &[u8]) -> Result<String, Nip44Error> {
    if padded.len() < 2 {
        return Err(Nip44Error::InvalidPadding);
    }

    let plaintext_len = u16::from_be_bytes([padded[0], padded[1]]) as usize;
    if !(MIN_PLAINTEXT_LEN..=MAX_PLAINTEXT_LEN).contains(&plaintext_len) {
        return Err(Nip44Error::InvalidPadding);
    }

    let unpadded_len = 2 + plaintext_len;
    if padded.len() != calc_padded_len(unpadded_len) || padded.len() < unpadded_len {
        return Err(Nip44Error::InvalidPadding);
    }
    if padded[unpadded_len..].iter().any(|&b| b != 0) {
        return Err(Nip44Error::InvalidPadding);
    }

    String::from_utf8(padded[2..unpadded_len].to_vec()).map_err(|_| Nip44Error::InvalidPadding)
}

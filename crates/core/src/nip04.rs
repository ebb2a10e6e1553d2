//! NIP-04: encrypted direct-message payloads (legacy).
//!
//! Superseded by NIP-44 and kept for compatibility with payloads that are
//! still on the wire. The scheme is AES-256-CBC keyed with the unhashed
//! x-coordinate of the ECDH shared point, with the ciphertext and IV
//! base64-encoded as `<ciphertext>?iv=<iv>`.

use aes::Aes256;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use thiserror::Error;

use crate::keys::{shared_secret_x, KeyError};

/// The marker separating ciphertext from IV on the wire. Its presence is
/// also how NIP-04 payloads are told apart from NIP-44 ones.
pub const IV_MARKER: &str = "?iv=";

const IV_SIZE: usize = 16;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Errors that can occur during NIP-04 operations.
#[derive(Debug, Error)]
pub enum Nip04Error {
    #[error("invalid payload: expected <ciphertext>?iv=<iv>")]
    InvalidPayload,

    #[error("IV must be {IV_SIZE} bytes, got {0}")]
    InvalidIv(usize),

    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("key error: {0}")]
    Key(#[from] KeyError),

    #[error("decryption failed")]
    Decryption,
}

/// Whether a ciphertext carries the NIP-04 IV marker.
pub fn is_nip04_payload(payload: &str) -> bool {
    payload.contains(IV_MARKER)
}

/// Encrypt a plaintext to a peer.
///
/// `peer_public_key` is hex, x-only or compressed. Returns the wire form
/// `<base64 ciphertext>?iv=<base64 iv>` with a fresh random IV.
pub fn encrypt(
    secret_key: &[u8; 32],
    peer_public_key: &str,
    plaintext: &str,
) -> Result<String, Nip04Error> {
    let shared_x = shared_secret_x(secret_key, peer_public_key)?;

    let mut iv = [0u8; IV_SIZE];
    rand::rng().fill_bytes(&mut iv);

    let ciphertext = Aes256CbcEnc::new((&*shared_x).into(), (&iv).into())
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

    Ok(format!(
        "{}{}{}",
        BASE64.encode(ciphertext),
        IV_MARKER,
        BASE64.encode(iv)
    ))
}

/// Decrypt a payload from a peer.
pub fn decrypt(
    secret_key: &[u8; 32],
    peer_public_key: &str,
    payload: &str,
) -> Result<String, Nip04Error> {
    let (ciphertext_b64, iv_b64) = payload
        .split_once(IV_MARKER)
        .ok_or(Nip04Error::InvalidPayload)?;

    let ciphertext = BASE64.decode(ciphertext_b64)?;
    let iv = BASE64.decode(iv_b64)?;
    if iv.len() != IV_SIZE {
        return Err(Nip04Error::InvalidIv(iv.len()));
    }

    let shared_x = shared_secret_x(secret_key, peer_public_key)?;

    let mut iv_bytes = [0u8; IV_SIZE];
    iv_bytes.copy_from_slice(&iv);

    let plaintext = Aes256CbcDec::new((&*shared_x).into(), (&iv_bytes).into())
        .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
        .map_err(|_| Nip04Error::Decryption)?;

    String::from_utf8(plaintext).map_err(|_| Nip04Error::Decryption)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::Keys;

    #[test]
    fn encrypt_decrypt_round_trip() {
        let alice = Keys::generate().unwrap();
        let bob = Keys::generate().unwrap();

        let message = "Hello, Nostr!";
        let payload = encrypt(alice.secret_bytes(), bob.public_key(), message).unwrap();
        assert!(payload.contains("?iv="));

        let recovered = decrypt(bob.secret_bytes(), alice.public_key(), &payload).unwrap();
        assert_eq!(recovered, message);
    }

    #[test]
    fn multi_block_messages_round_trip() {
        let alice = Keys::generate().unwrap();
        let bob = Keys::generate().unwrap();

        let message = "A message long enough to span several AES blocks, \
                       exercising the padding across block boundaries.";
        let payload = encrypt(alice.secret_bytes(), bob.public_key(), message).unwrap();
        let recovered = decrypt(bob.secret_bytes(), alice.public_key(), &payload).unwrap();
        assert_eq!(recovered, message);
    }

    #[test]
    fn decrypt_rejects_missing_marker() {
        let keys = Keys::generate().unwrap();
        let result = decrypt(keys.secret_bytes(), keys.public_key(), "bm90IGEgcGF5bG9hZA==");
        assert!(matches!(result, Err(Nip04Error::InvalidPayload)));
    }

    #[test]
    fn decrypt_rejects_short_iv() {
        let keys = Keys::generate().unwrap();
        // "test" base64-encoded is 4 bytes, not 16.
        let result = decrypt(keys.secret_bytes(), keys.public_key(), "dGVzdA==?iv=dGVzdA==");
        assert!(matches!(result, Err(Nip04Error::InvalidIv(4))));
    }

    #[test]
    fn decrypt_with_wrong_key_fails() {
        let alice = Keys::generate().unwrap();
        let bob = Keys::generate().unwrap();
        let eve = Keys::generate().unwrap();

        let payload = encrypt(alice.secret_bytes(), bob.public_key(), "secret").unwrap();
        let result = decrypt(eve.secret_bytes(), alice.public_key(), &payload);
        assert!(result.is_err());
    }

    #[test]
    fn payload_marker_detection() {
        assert!(is_nip04_payload("abc?iv=def"));
        assert!(!is_nip04_payload("AqEBbase64payload"));
    }
}

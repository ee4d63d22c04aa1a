//! One-way hashing and symmetric payload encryption.
//!
//! Hashing is bcrypt and runs on the blocking pool so callers can await it from
//! request handlers. Texts longer than bcrypt's 72-byte input are refused rather
//! than silently truncated. Encryption is ChaCha20-Poly1305 under a key derived from an
//! arbitrary string (SHA-256), producing `base64url(nonce || ciphertext)`.

use base64ct::{Base64UrlUnpadded, Encoding};
use chacha20poly1305::{
    ChaCha20Poly1305, Key, Nonce,
    aead::{Aead, KeyInit},
};
use rand::{RngCore, rngs::OsRng};
use serde::{Serialize, de::DeserializeOwned};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Shortest accepted encryption key, in characters.
pub const MIN_KEY_LENGTH: usize = 15;

/// bcrypt cost used when callers do not pick one.
pub const DEFAULT_COST: u32 = bcrypt::DEFAULT_COST;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("hash error: {0}")]
    Hash(String),
    #[error("compare error: {0}")]
    Compare(String),
    #[error("encryption key must be at least {MIN_KEY_LENGTH} characters")]
    KeyTooShort,
    #[error("payload could not be serialized")]
    Serialize(#[source] serde_json::Error),
    #[error("encryption failure")]
    Encrypt,
    #[error("malformed ciphertext")]
    Malformed,
    #[error("ciphertext failed authentication")]
    Tampered,
    #[error("decrypted payload is not valid json")]
    Payload(#[source] serde_json::Error),
}

/// Hash `text` with a random salt and the given bcrypt cost.
///
/// # Errors
/// Returns `CryptoError::Hash` if bcrypt rejects the cost, the text exceeds
/// 72 bytes, or the task fails.
pub async fn hash(text: &str, cost: u32) -> Result<String, CryptoError> {
    let text = text.to_string();

    tokio::task::spawn_blocking(move || {
        bcrypt::non_truncating_hash(text, cost).map_err(|e| CryptoError::Hash(e.to_string()))
    })
    .await
    .map_err(|e| CryptoError::Hash(format!("task join error: {e}")))?
}

/// Check whether `raw` hashes to `hashed`. Texts over 72 bytes never match,
/// since [`hash`] refuses them.
///
/// # Errors
/// Returns `CryptoError::Compare` if `hashed` is not a valid bcrypt hash or the task fails.
pub async fn compare(raw: &str, hashed: &str) -> Result<bool, CryptoError> {
    let raw = raw.to_string();
    let hashed = hashed.to_string();

    tokio::task::spawn_blocking(move || {
        match bcrypt::non_truncating_verify(raw, &hashed) {
            Err(bcrypt::BcryptError::Truncation(_)) => Ok(false),
            other => other.map_err(|e| CryptoError::Compare(e.to_string())),
        }
    })
    .await
    .map_err(|e| CryptoError::Compare(format!("task join error: {e}")))?
}

fn cipher(key: &str) -> Result<ChaCha20Poly1305, CryptoError> {
    if key.chars().count() < MIN_KEY_LENGTH {
        return Err(CryptoError::KeyTooShort);
    }

    let digest = Sha256::digest(key.as_bytes());
    Ok(ChaCha20Poly1305::new(Key::from_slice(digest.as_slice())))
}

/// Encrypt any serializable payload (object, string, number...) under `key`.
///
/// # Errors
/// Returns `CryptoError::KeyTooShort` for keys under [`MIN_KEY_LENGTH`] characters.
pub fn encrypt<T: Serialize + ?Sized>(key: &str, payload: &T) -> Result<String, CryptoError> {
    let cipher = cipher(key)?;
    let plaintext = serde_json::to_vec(payload).map_err(CryptoError::Serialize)?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_slice())
        .map_err(|_| CryptoError::Encrypt)?;

    let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&ciphertext);

    Ok(Base64UrlUnpadded::encode_string(&sealed))
}

/// Decrypt a value produced by [`encrypt`].
///
/// # Errors
/// - `Malformed` when the input is not base64url or is too short,
/// - `Tampered` when the key does not match or any byte was altered,
/// - `Payload` when the plaintext is not the expected json shape.
pub fn decrypt<T: DeserializeOwned>(key: &str, ciphertext: &str) -> Result<T, CryptoError> {
    let cipher = cipher(key)?;
    let sealed =
        Base64UrlUnpadded::decode_vec(ciphertext.trim()).map_err(|_| CryptoError::Malformed)?;

    if sealed.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::Malformed);
    }

    let (nonce_bytes, body) = sealed.split_at(NONCE_LEN);
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce_bytes), body)
        .map_err(|_| CryptoError::Tampered)?;

    serde_json::from_slice(&plaintext).map_err(CryptoError::Payload)
}

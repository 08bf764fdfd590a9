//! Per-user payload obfuscation for the WebSocket transport.
//!
//! Key derivation: SHA-256(user id) -> 256-bit AES key
//! Encryption: AES-256-GCM with random 12-byte nonce
//! Wire format: base64( nonce (12 bytes) || ciphertext (includes GCM tag) )
//!
//! This is transport-level obfuscation keyed by the recipient's identity, not
//! end-to-end encryption. A connection with no bound user (first contact)
//! exchanges frames in the clear.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::Rng;
use sha2::{Digest, Sha256};

use crate::error::{ImError, Result};

/// Derive a user's AES-256-GCM key from their user id.
pub fn user_key(uid: &str) -> Key<Aes256Gcm> {
    let digest: [u8; 32] = Sha256::digest(uid.as_bytes()).into();
    Key::<Aes256Gcm>::from(digest)
}

/// Encrypt an outbound payload for the given user.
pub fn encrypt(uid: &str, plaintext: &str) -> Result<String> {
    let cipher = Aes256Gcm::new(&user_key(uid));
    let nonce_bytes: [u8; 12] = rand::rng().random();
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|e| ImError::Cipher(format!("encryption failed: {e}")))?;

    let mut raw = Vec::with_capacity(12 + ciphertext.len());
    raw.extend_from_slice(&nonce_bytes);
    raw.extend_from_slice(&ciphertext);
    Ok(STANDARD.encode(raw))
}

/// Decrypt an inbound payload from the given user.
pub fn decrypt(uid: &str, armored: &str) -> Result<String> {
    let raw = STANDARD
        .decode(armored.trim())
        .map_err(|e| ImError::Cipher(format!("invalid base64: {e}")))?;
    if raw.len() < 12 {
        return Err(ImError::Cipher("payload too short (< 12 bytes)".to_string()));
    }
    let cipher = Aes256Gcm::new(&user_key(uid));
    let nonce = Nonce::from_slice(&raw[..12]);
    let plaintext = cipher
        .decrypt(nonce, &raw[12..])
        .map_err(|e| ImError::Cipher(format!("decryption failed: {e}")))?;
    String::from_utf8(plaintext).map_err(|e| ImError::Cipher(format!("invalid utf-8: {e}")))
}

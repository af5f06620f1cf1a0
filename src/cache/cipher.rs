//! Entry Encryption
//!
//! ChaCha20-Poly1305 over the stored payload. The key is the SHA-256 of the
//! configured secret and every entry gets a fresh random nonce, so equal
//! values never produce equal ciphertext. A payload that was altered, or
//! sealed under another key, fails to open.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};

use super::entry::NONCE_LEN;
use crate::error::{Error, Result};

/// Authenticated cipher for encrypted cache layers
#[derive(Clone)]
pub struct EntryCipher {
    aead: ChaCha20Poly1305,
}

impl EntryCipher {
    /// Derive the cipher key from a secret string
    pub fn new(secret: &str) -> Self {
        let key = Sha256::digest(secret.as_bytes());
        Self {
            aead: ChaCha20Poly1305::new(Key::from_slice(&key)),
        }
    }

    /// Seal with a fresh nonce
    pub fn encrypt(&self, plain: &[u8]) -> Result<(Vec<u8>, [u8; NONCE_LEN])> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let sealed = self
            .aead
            .encrypt(Nonce::from_slice(&nonce), plain)
            .map_err(|e| Error::Internal(format!("entry encryption failed: {e}")))?;
        Ok((sealed, nonce))
    }

    /// Open a sealed payload; fails if it was altered or sealed under
    /// another key
    pub fn decrypt(&self, sealed: &[u8], nonce: &[u8; NONCE_LEN]) -> Result<Vec<u8>> {
        self.aead
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|e| Error::Internal(format!("entry authentication failed: {e}")))
    }
}

impl std::fmt::Debug for EntryCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryCipher").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_then_decrypt() {
        let cipher = EntryCipher::new("dashboard-secret");
        let plain = br#"{"user":"ada","roles":["admin","auditor"],"active":true}"#;
        let (sealed, nonce) = cipher.encrypt(plain).unwrap();
        assert_ne!(&sealed[..plain.len()], plain.as_slice());
        assert_eq!(cipher.decrypt(&sealed, &nonce).unwrap(), plain);
    }

    #[test]
    fn test_nonce_varies_ciphertext() {
        let cipher = EntryCipher::new("k");
        let (a, na) = cipher.encrypt(b"same value").unwrap();
        let (b, nb) = cipher.encrypt(b"same value").unwrap();
        assert_ne!(na, nb);
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_fails_to_open() {
        let (sealed, nonce) = EntryCipher::new("right").encrypt(b"secret payload").unwrap();
        assert!(EntryCipher::new("wrong").decrypt(&sealed, &nonce).is_err());
    }

    #[test]
    fn test_altered_payload_fails_to_open() {
        let cipher = EntryCipher::new("k");
        let (mut sealed, nonce) = cipher.encrypt(b"balance=100").unwrap();
        sealed[0] ^= 0x01;
        assert!(cipher.decrypt(&sealed, &nonce).is_err());
    }
}

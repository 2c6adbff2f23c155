//! AES-256-GCM envelope for the certificate enrollment exchange.
//!
//! The enrollment token key does double duty: knowledge of it authorises the
//! request, and it encrypts exactly one request/response pair. Every seal
//! draws a fresh random nonce, so a key is never paired with a repeated
//! nonce within its single-use lifetime.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};

use crate::error::{CryptoError, Result};
use crate::rng;

/// AES-256 key length in bytes.
pub const TOKEN_KEY_LEN: usize = 32;

/// GCM nonce length in bytes.
pub const NONCE_LEN: usize = 12;

/// Encrypt `plaintext` under the 32-byte token key.
///
/// Returns the ciphertext (including the GCM auth tag) and the freshly
/// generated nonce. The nonce must travel alongside the ciphertext.
pub fn seal(plaintext: &[u8], key: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
    let cipher = cipher_for(key)?;
    let nonce_bytes: [u8; NONCE_LEN] = rng::random_bytes();
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| CryptoError::Encrypt(e.to_string()))?;

    Ok((ciphertext, nonce_bytes.to_vec()))
}

/// Decrypt and authenticate `ciphertext` under the 32-byte token key.
///
/// Fails with [`CryptoError::Decrypt`] on any tampering, truncation or
/// wrong-key condition.
pub fn open(ciphertext: &[u8], nonce: &[u8], key: &[u8]) -> Result<Vec<u8>> {
    let cipher = cipher_for(key)?;
    if nonce.len() != NONCE_LEN {
        return Err(CryptoError::Decrypt(format!(
            "nonce must be {NONCE_LEN} bytes, got {}",
            nonce.len()
        )));
    }

    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::Decrypt("auth tag verification failed".into()))
}

fn cipher_for(key: &[u8]) -> Result<Aes256Gcm> {
    if key.len() != TOKEN_KEY_LEN {
        return Err(CryptoError::InvalidKey(format!(
            "token key must be {TOKEN_KEY_LEN} bytes, got {}",
            key.len()
        )));
    }
    Aes256Gcm::new_from_slice(key).map_err(|e| CryptoError::InvalidKey(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> [u8; TOKEN_KEY_LEN] {
        rng::random_bytes()
    }

    #[test]
    fn seal_open_roundtrip() {
        let key = key();
        let (ct, nonce) = seal(b"-----BEGIN CERTIFICATE REQUEST-----", &key).unwrap();
        let pt = open(&ct, &nonce, &key).unwrap();
        assert_eq!(pt, b"-----BEGIN CERTIFICATE REQUEST-----");
    }

    #[test]
    fn nonces_are_fresh_per_seal() {
        let key = key();
        let (_, n1) = seal(b"same input", &key).unwrap();
        let (_, n2) = seal(b"same input", &key).unwrap();
        assert_ne!(n1, n2);
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let key = key();
        let (mut ct, nonce) = seal(b"payload", &key).unwrap();
        for i in 0..ct.len() {
            ct[i] ^= 0x01;
            assert!(open(&ct, &nonce, &key).is_err(), "byte {i} flip accepted");
            ct[i] ^= 0x01;
        }
    }

    #[test]
    fn tampered_nonce_fails() {
        let key = key();
        let (ct, mut nonce) = seal(b"payload", &key).unwrap();
        nonce[0] ^= 0x80;
        assert!(open(&ct, &nonce, &key).is_err());
    }

    #[test]
    fn truncated_ciphertext_fails() {
        let key = key();
        let (ct, nonce) = seal(b"payload", &key).unwrap();
        assert!(open(&ct[..ct.len() - 1], &nonce, &key).is_err());
    }

    #[test]
    fn wrong_key_fails() {
        let (ct, nonce) = seal(b"payload", &key()).unwrap();
        assert!(open(&ct, &nonce, &key()).is_err());
    }

    #[test]
    fn short_key_rejected() {
        assert!(seal(b"x", &[0u8; 16]).is_err());
        assert!(open(b"x", &[0u8; NONCE_LEN], &[0u8; 16]).is_err());
    }

    #[test]
    fn empty_plaintext_roundtrip() {
        let key = key();
        let (ct, nonce) = seal(b"", &key).unwrap();
        assert_eq!(open(&ct, &nonce, &key).unwrap(), b"");
    }
}

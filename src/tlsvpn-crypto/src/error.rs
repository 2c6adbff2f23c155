//! Error types for cryptographic operations.

use thiserror::Error;

/// Error type for all cryptographic operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Key generation failed (e.g. insufficient entropy)
    #[error("key generation failed: {0}")]
    KeyGen(String),

    /// Invalid key material (wrong size, bad format)
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    /// Encryption operation failed
    #[error("encryption failed: {0}")]
    Encrypt(String),

    /// Decryption failed (wrong key, corrupted data, auth tag mismatch)
    #[error("decryption failed or data tampered: {0}")]
    Decrypt(String),

    /// X.509 certificate error
    #[error("certificate error: {0}")]
    Certificate(String),

    /// Certificate signing request parse or signature failure
    #[error("CSR error: {0}")]
    Csr(String),

    /// File system I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for cryptographic operations.
pub type Result<T> = std::result::Result<T, CryptoError>;

impl From<rcgen::Error> for CryptoError {
    fn from(e: rcgen::Error) -> Self {
        CryptoError::Certificate(e.to_string())
    }
}

impl From<rsa::Error> for CryptoError {
    fn from(e: rsa::Error) -> Self {
        CryptoError::KeyGen(e.to_string())
    }
}

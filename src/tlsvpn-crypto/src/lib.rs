//! # tlsvpn-crypto
//!
//! Cryptographic building blocks for the tls-vpn daemon:
//!
//! - **Envelope**: AES-256-GCM seal/open used by the token-based certificate
//!   enrollment exchange
//! - **PKI**: CA lifecycle, server certificate issuance, CSR generation and
//!   CSR-based client certificate signing
//! - **RNG**: secure randomness helpers for keys, nonces and identifiers

pub mod envelope;
pub mod error;
pub mod pki;
pub mod rng;

pub use envelope::{open, seal, NONCE_LEN, TOKEN_KEY_LEN};
pub use error::{CryptoError, Result};
pub use pki::{CertAuthority, PkiConfig};

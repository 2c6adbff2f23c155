//! Secure randomness helpers.

use rand::{rngs::OsRng, RngCore};

/// Fill the provided buffer with secure randomness.
pub fn fill(dest: &mut [u8]) {
    OsRng.fill_bytes(dest);
}

/// Return a uniformly random 64-bit value.
pub fn random_u64() -> u64 {
    OsRng.next_u64()
}

/// Return `N` uniformly random bytes.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut buf = [0u8; N];
    OsRng.fill_bytes(&mut buf);
    buf
}

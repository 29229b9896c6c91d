//! Cryptographic primitives for tollgate.
//!
//! This module provides:
//! - Long-term Ed25519 identities and their X25519 key-exchange form
//! - Shared-secret memoization per remote public key
//! - Per-connection key derivation (HKDF-SHA256)
//! - Symmetric AEAD codecs (XChaCha20-Poly1305, AES-256-GCM)

mod cipher;
mod kdf;
mod keys;

pub use cipher::{Cipher, EncryptionAlgo};
pub use kdf::KeySchedule;
pub use keys::{PublicKey, SharedKeyCache, SigningKeyPair};

/// Size of a connection nonce in bytes.
pub const CONN_NONCE_SIZE: usize = 32;

/// Size of a derived symmetric encryption key in bytes.
pub const ENCRYPT_KEY_SIZE: usize = 32;

/// Generate cryptographically secure random bytes.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut bytes);
    bytes
}

/// Constant-time comparison of byte slices.
pub fn secure_compare(a: &[u8], b: &[u8]) -> bool {
    constant_time_eq::constant_time_eq(a, b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_bytes() {
        let r1: [u8; 32] = random_bytes();
        let r2: [u8; 32] = random_bytes();
        assert_ne!(r1, r2);
    }

    #[test]
    fn test_secure_compare() {
        let a = [1u8, 2, 3, 4];
        let b = [1u8, 2, 3, 4];
        let c = [1u8, 2, 3, 5];

        assert!(secure_compare(&a, &b));
        assert!(!secure_compare(&a, &c));
    }
}

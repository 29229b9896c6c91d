//! Key derivation for tollgate.
//!
//! Uses HKDF-SHA256 for all key material derivation.

use hkdf::Hkdf;
use sha2::Sha256;

use super::ENCRYPT_KEY_SIZE;

/// Key schedule for deriving all cryptographic keys.
pub struct KeySchedule;

impl KeySchedule {
    /// Domain separation prefix for all tollgate keys.
    const DOMAIN: &'static [u8] = b"tollgate/v1/";

    /// Derive a 32-byte key.
    pub fn derive_key(ikm: &[u8], salt: Option<&[u8]>, info: &[u8]) -> [u8; ENCRYPT_KEY_SIZE] {
        let hk = Hkdf::<Sha256>::new(salt, ikm);
        let mut okm = [0u8; ENCRYPT_KEY_SIZE];
        hk.expand(info, &mut okm)
            .expect("32-byte HKDF output should be valid");
        okm
    }

    /// Derive the per-connection encryption key from the shared secret and
    /// the connection nonce.
    ///
    /// Deterministic: both peers derive the same key from the same inputs,
    /// and the nonce binds the key to a single connection.
    pub fn connection_key(shared_secret: &[u8; 32], nonce: &[u8]) -> [u8; ENCRYPT_KEY_SIZE] {
        let mut info = Vec::with_capacity(Self::DOMAIN.len() + b"conn-key".len());
        info.extend_from_slice(Self::DOMAIN);
        info.extend_from_slice(b"conn-key");
        Self::derive_key(shared_secret, Some(nonce), &info)
    }
}

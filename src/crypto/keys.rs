//! Key management for tollgate.
//!
//! Every node has a single long-term Ed25519 signing identity. Key
//! exchange reuses that identity: the signing key converts to an X25519
//! static secret and the peer's verifying key converts through the
//! Edwards-to-Montgomery map, so two peers agree on a shared secret
//! without exchanging extra key material.

use std::fmt;

use dashmap::DashMap;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use crate::error::CryptoError;

/// Length of an Ed25519 public key.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Ed25519 public key identifying a peer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey(pub [u8; PUBLIC_KEY_SIZE]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; PUBLIC_KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength(bytes.len()))?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }

    /// Convert to the X25519 form for key exchange.
    pub fn to_x25519(&self) -> Result<X25519Public, CryptoError> {
        let verifying =
            VerifyingKey::from_bytes(&self.0).map_err(|_| CryptoError::InvalidPublicKey)?;
        Ok(X25519Public::from(verifying.to_montgomery().to_bytes()))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(s).map_err(|_| CryptoError::InvalidPublicKey)?;
        Self::from_slice(&bytes)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", &self.to_hex()[..8])
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Long-term Ed25519 signing identity.
#[derive(Clone)]
pub struct SigningKeyPair {
    signing: SigningKey,
    verifying: VerifyingKey,
}

impl SigningKeyPair {
    /// Generate a new random identity.
    pub fn generate() -> Self {
        let signing = SigningKey::generate(&mut OsRng);
        let verifying = signing.verifying_key();
        Self { signing, verifying }
    }

    /// Create from a 32-byte seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        let signing = SigningKey::from_bytes(&seed);
        let verifying = signing.verifying_key();
        Self { signing, verifying }
    }

    /// The public identity.
    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.verifying.to_bytes())
    }

    /// Sign a message.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        let sig: Signature = self.signing.sign(message);
        sig.to_bytes()
    }

    /// Verify a signature against this identity.
    pub fn verify(&self, message: &[u8], signature: &[u8; 64]) -> Result<(), CryptoError> {
        let sig = Signature::from_bytes(signature);
        self.verifying
            .verify(message, &sig)
            .map_err(|_| CryptoError::InvalidPublicKey)
    }

    /// Derive the X25519 static secret for key exchange.
    ///
    /// Uses the standard Ed25519-to-Curve25519 conversion: SHA-512 of the
    /// seed, low 32 bytes, clamped (the clamp happens inside
    /// `StaticSecret`). The same long-term identity thus serves both
    /// signing and key agreement, and both sides of a connection derive
    /// matching X25519 keys from their Ed25519 identities.
    pub fn to_x25519_secret(&self) -> StaticSecret {
        let hash = Sha512::digest(self.signing.to_bytes());
        let mut scalar = [0u8; 32];
        scalar.copy_from_slice(&hash[..32]);
        StaticSecret::from(scalar)
    }
}

impl fmt::Debug for SigningKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKeyPair")
            .field("public", &self.public_key())
            .finish_non_exhaustive()
    }
}

/// Memoized X25519 shared secrets, keyed by the remote Ed25519 public key.
///
/// Shared-secret computation involves a scalar multiplication per peer;
/// connections to the same peer reuse the cached result.
pub struct SharedKeyCache {
    secret: StaticSecret,
    cache: DashMap<[u8; PUBLIC_KEY_SIZE], [u8; 32]>,
}

impl SharedKeyCache {
    pub fn new(identity: &SigningKeyPair) -> Self {
        Self {
            secret: identity.to_x25519_secret(),
            cache: DashMap::new(),
        }
    }

    /// Shared secret with the given remote identity, computing and caching
    /// it on first use.
    pub fn shared_key(&self, remote: &PublicKey) -> Result<[u8; 32], CryptoError> {
        if let Some(shared) = self.cache.get(remote.as_bytes()) {
            return Ok(*shared);
        }

        let their_x25519 = remote.to_x25519()?;
        let shared = *self.secret.diffie_hellman(&their_x25519).as_bytes();

        self.cache.insert(*remote.as_bytes(), shared);
        Ok(shared)
    }
}

impl fmt::Debug for SharedKeyCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedKeyCache")
            .field("cached", &self.cache.len())
            .finish_non_exhaustive()
    }
}

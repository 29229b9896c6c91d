//! Symmetric AEAD codecs.
//!
//! Each connection gets one [`Cipher`] per direction pair, constructed
//! from the derived connection key. Every sealed message carries a fresh
//! random nonce so datagram reordering and loss never desynchronize the
//! peers.

use std::fmt;
use std::str::FromStr;

use aes_gcm::Aes256Gcm;
use chacha20poly1305::{
    aead::{generic_array::GenericArray, Aead, KeyInit},
    XChaCha20Poly1305,
};
use serde::{Deserialize, Serialize};

use super::ENCRYPT_KEY_SIZE;
use crate::error::CryptoError;

/// Authentication tag size shared by both AEADs.
pub const TAG_SIZE: usize = 16;

/// Encryption algorithm negotiated during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum EncryptionAlgo {
    /// Pass-through, no encryption.
    None,
    /// XChaCha20-Poly1305 with a 24-byte random nonce.
    #[default]
    XChaCha20Poly1305,
    /// AES-256-GCM with a 12-byte random nonce.
    Aes256Gcm,
}

impl EncryptionAlgo {
    /// Nonce length prepended to every sealed message.
    pub fn nonce_size(self) -> usize {
        match self {
            Self::None => 0,
            Self::XChaCha20Poly1305 => 24,
            Self::Aes256Gcm => 12,
        }
    }

    /// Per-message ciphertext expansion.
    pub fn overhead(self) -> usize {
        match self {
            Self::None => 0,
            _ => self.nonce_size() + TAG_SIZE,
        }
    }
}

impl FromStr for EncryptionAlgo {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "none" => Ok(Self::None),
            "xchacha20-poly1305" | "xchacha20poly1305" => Ok(Self::XChaCha20Poly1305),
            "aes-256-gcm" | "aes256gcm" | "aes-gcm" => Ok(Self::Aes256Gcm),
            other => Err(CryptoError::UnknownAlgorithm(other.to_string())),
        }
    }
}

impl fmt::Display for EncryptionAlgo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::XChaCha20Poly1305 => write!(f, "xchacha20-poly1305"),
            Self::Aes256Gcm => write!(f, "aes-256-gcm"),
        }
    }
}

enum CipherInner {
    XChaCha(Box<XChaCha20Poly1305>),
    Aes(Box<Aes256Gcm>),
}

/// Per-connection AEAD codec.
///
/// Construct with [`Cipher::new`] for any algorithm other than
/// [`EncryptionAlgo::None`]; pass-through connections simply never build a
/// cipher.
pub struct Cipher {
    algo: EncryptionAlgo,
    inner: CipherInner,
}

impl Cipher {
    pub fn new(algo: EncryptionAlgo, key: &[u8; ENCRYPT_KEY_SIZE]) -> Result<Self, CryptoError> {
        let inner = match algo {
            EncryptionAlgo::None => {
                return Err(CryptoError::EncryptionFailed(
                    "cannot build a cipher for algorithm none".into(),
                ))
            }
            EncryptionAlgo::XChaCha20Poly1305 => CipherInner::XChaCha(Box::new(
                XChaCha20Poly1305::new_from_slice(key)
                    .map_err(|e| CryptoError::EncryptionFailed(format!("cipher init: {e}")))?,
            )),
            EncryptionAlgo::Aes256Gcm => CipherInner::Aes(Box::new(
                Aes256Gcm::new_from_slice(key)
                    .map_err(|e| CryptoError::EncryptionFailed(format!("cipher init: {e}")))?,
            )),
        };
        Ok(Self { algo, inner })
    }

    pub fn algo(&self) -> EncryptionAlgo {
        self.algo
    }

    /// Seal a plaintext: output is `nonce ‖ ciphertext ‖ tag`.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match &self.inner {
            CipherInner::XChaCha(cipher) => {
                let nonce: [u8; 24] = crate::crypto::random_bytes();
                let ct = cipher
                    .encrypt(GenericArray::from_slice(&nonce), plaintext)
                    .map_err(|_| CryptoError::EncryptionFailed("seal".into()))?;
                let mut out = Vec::with_capacity(nonce.len() + ct.len());
                out.extend_from_slice(&nonce);
                out.extend_from_slice(&ct);
                Ok(out)
            }
            CipherInner::Aes(cipher) => {
                let nonce: [u8; 12] = crate::crypto::random_bytes();
                let ct = cipher
                    .encrypt(GenericArray::from_slice(&nonce), plaintext)
                    .map_err(|_| CryptoError::EncryptionFailed("seal".into()))?;
                let mut out = Vec::with_capacity(nonce.len() + ct.len());
                out.extend_from_slice(&nonce);
                out.extend_from_slice(&ct);
                Ok(out)
            }
        }
    }

    /// Open a sealed message produced by [`Cipher::seal`].
    pub fn open(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce_size = self.algo.nonce_size();
        if data.len() < nonce_size + TAG_SIZE {
            return Err(CryptoError::DecryptionFailed(format!(
                "short message: {} bytes",
                data.len()
            )));
        }
        let (nonce, ct) = data.split_at(nonce_size);
        match &self.inner {
            CipherInner::XChaCha(cipher) => cipher
                .decrypt(GenericArray::from_slice(nonce), ct)
                .map_err(|_| CryptoError::DecryptionFailed("authentication failed".into())),
            CipherInner::Aes(cipher) => cipher
                .decrypt(GenericArray::from_slice(nonce), ct)
                .map_err(|_| CryptoError::DecryptionFailed("authentication failed".into())),
        }
    }
}

impl fmt::Debug for Cipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cipher").field("algo", &self.algo).finish()
    }
}

//! Error types for tollgate.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Result type alias for tollgate operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for tollgate.
#[derive(Error, Debug)]
pub enum Error {
    // Cryptographic errors
    #[error("cryptographic error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("public key mismatch")]
    PublicKeyMismatch,

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    // Transport errors
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("connection failed to {addr}: {reason}")]
    ConnectionFailed { addr: SocketAddr, reason: String },

    #[error("connection timeout")]
    ConnectionTimeout,

    // Protocol errors
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    // Discovery errors
    #[error("no service providers for {0}")]
    NoProviders(String),

    #[error("directory RPC error: {0}")]
    Directory(String),

    // Payment errors
    #[error("insufficient wallet balance")]
    InsufficientBalance,

    #[error("payment shortfall: last claimed {claimed}, expected {expected}")]
    PaymentShortfall { claimed: String, expected: String },

    #[error("nano pay error: {0}")]
    NanoPay(String),

    // Lifecycle errors
    #[error("tunnel is closed")]
    Closed,

    // Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid price: {0}")]
    InvalidPrice(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // General errors
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Cryptographic operation errors.
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("key derivation failed: {0}")]
    KeyDerivationFailed(String),

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("invalid key length {0}")]
    InvalidKeyLength(usize),

    #[error("unknown encryption algorithm: {0}")]
    UnknownAlgorithm(String),

    #[error("no encryption key for connection")]
    MissingEncryptKey,
}

/// Transport layer errors.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("bind failed on {addr}: {reason}")]
    BindFailed { addr: SocketAddr, reason: String },

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    #[error("socket error: {0}")]
    SocketError(String),

    #[error("UDP error: {0}")]
    Udp(String),

    #[error("TCP error: {0}")]
    Tcp(String),
}

/// Protocol parsing and handling errors.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("metadata too large: {size} bytes (max {max})")]
    MetadataTooLarge { size: usize, max: usize },

    #[error("empty metadata")]
    EmptyMetadata,

    #[error("malformed varint")]
    MalformedVarint,

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("unencrypted datagram from encrypted peer")]
    UnencryptedDatagram,

    #[error("datagram too short: {0} bytes")]
    DatagramTooShort(usize),
}

impl Error {
    /// Check if error is recoverable (retry with the next candidate or
    /// after a backoff).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionTimeout
                | Error::ConnectionFailed { .. }
                | Error::Directory(_)
                | Error::Transport(
                    TransportError::SendFailed(_) | TransportError::ReceiveFailed(_)
                )
                | Error::Io(_)
        )
    }

    /// Check if error must tear down the current session.
    pub fn should_reconnect(&self) -> bool {
        matches!(
            self,
            Error::HandshakeFailed(_)
                | Error::PublicKeyMismatch
                | Error::PaymentShortfall { .. }
                | Error::Protocol(_)
        )
    }
}

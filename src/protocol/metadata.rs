//! Metadata messages exchanged over the tunnel and the topic.

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::crypto::EncryptionAlgo;
use crate::error::{ProtocolError, Result};
use crate::types::Price;

/// Key identifying one connection: `publicKey ‖ nonce`.
///
/// The TCP handshake stores the derived encrypt key under this key, and
/// the UDP mux looks it up to bind a datagram flow to the same session.
pub type ConnKey = Vec<u8>;

/// Build the connection key for a public key / nonce pair.
pub fn conn_key(public_key: &[u8], nonce: &[u8]) -> ConnKey {
    let mut k = Vec::with_capacity(public_key.len() + nonce.len());
    k.extend_from_slice(public_key);
    k.extend_from_slice(nonce);
    k
}

/// Handshake message exchanged on every new TCP connection and carried in
/// UDP control datagrams.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionMetadata {
    /// Sender's Ed25519 public key (32 bytes).
    #[serde(default)]
    pub public_key: Vec<u8>,
    /// Per-connection nonce, chosen by the nonce-generating side.
    #[serde(default)]
    pub nonce: Vec<u8>,
    /// Negotiated symmetric algorithm.
    #[serde(default)]
    pub encryption_algo: EncryptionAlgo,
    /// Bandwidth-measurement connection: the server sends
    /// `measurement_bytes_downlink` random bytes and closes.
    #[serde(default)]
    pub is_measurement: bool,
    #[serde(default)]
    pub measurement_bytes_downlink: u32,
    /// Latency probe datagram, never installs a codec.
    #[serde(default)]
    pub is_ping: bool,
}

impl ConnectionMetadata {
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| ProtocolError::Serialization(e.to_string()).into())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data)
            .map_err(|e| ProtocolError::Deserialization(e.to_string()).into())
    }
}

/// First message on every multiplexed stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMetadata {
    /// Marks the dedicated payment substream.
    #[serde(default)]
    pub is_payment: bool,
    /// Target service for user streams.
    #[serde(default)]
    pub service_id: u32,
    /// Index into the service's forwarded port list.
    #[serde(default)]
    pub port_index: u32,
}

impl StreamMetadata {
    pub fn payment() -> Self {
        Self {
            is_payment: true,
            ..Self::default()
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| ProtocolError::Serialization(e.to_string()).into())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data)
            .map_err(|e| ProtocolError::Deserialization(e.to_string()).into())
    }
}

/// Service advertisement published under the subscription topic.
///
/// Published as base64 of the binary serialization; the raw string is kept
/// alongside decoded copies so cached entries can be re-published verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceMetadata {
    /// Externally reachable IP of the exit.
    pub ip: String,
    pub tcp_port: u32,
    pub udp_port: u32,
    /// Index of the offered service.
    pub service_id: u32,
    /// Ports forwarded at the exit.
    #[serde(default)]
    pub service_tcp: Vec<u32>,
    #[serde(default)]
    pub service_udp: Vec<u32>,
    /// `"entryToExit exitToEntry"` tokens per traffic unit.
    #[serde(default)]
    pub price: String,
    /// Wallet address receiving payments; empty means the exit's own.
    #[serde(default)]
    pub beneficiary_addr: String,
}

impl ServiceMetadata {
    /// Serialize to the base64 form published on the topic.
    pub fn encode(&self) -> Result<String> {
        let raw =
            bincode::serialize(self).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(base64::engine::general_purpose::STANDARD.encode(raw))
    }

    /// Parse the base64 form read from a subscription.
    pub fn decode(encoded: &str) -> Result<Self> {
        let raw = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| ProtocolError::Deserialization(format!("base64: {e}")))?;
        if raw.len() > super::MAX_SERVICE_METADATA_SIZE {
            return Err(ProtocolError::MetadataTooLarge {
                size: raw.len(),
                max: super::MAX_SERVICE_METADATA_SIZE,
            }
            .into());
        }
        bincode::deserialize(&raw)
            .map_err(|e| ProtocolError::Deserialization(e.to_string()).into())
    }

    /// Parsed per-direction price.
    pub fn parse_price(&self) -> Result<Price> {
        self.price.parse()
    }

    pub fn tcp_addr(&self) -> String {
        format!("{}:{}", self.ip, self.tcp_port)
    }

    pub fn udp_addr(&self) -> String {
        format!("{}:{}", self.ip, self.udp_port)
    }

    pub fn has_udp(&self) -> bool {
        !self.service_udp.is_empty()
    }
}

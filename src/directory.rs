//! Seam to the decentralized name/messaging network.
//!
//! tollgate never talks to the chain directly; everything it needs from
//! the network client — topic subscriber RPCs, balances, block height,
//! queued subscribe submission and nano-pay construction — goes through
//! [`DirectoryClient`]. Production wires a real client here, tests wire
//! an in-memory one.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::crypto::PublicKey;
use crate::error::{Error, Result};
use crate::payment::{NanoPayClaimer, NanoPayIssuer};
use crate::types::Amount;

/// One on-chain subscription record.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionInfo {
    /// Published metadata, base64 of the service metadata serialization.
    pub meta: String,
    /// Absolute block height at which the subscription lapses; 0 when the
    /// record does not exist.
    pub expires_at: u64,
}

/// Client of the name/messaging network.
#[async_trait]
pub trait DirectoryClient: Send + Sync {
    /// Wallet address of the local account.
    fn wallet_address(&self) -> String;

    /// Client address of the local account on the messaging network.
    fn client_address(&self) -> String;

    /// Ed25519 public key of the local account.
    fn public_key(&self) -> PublicKey;

    async fn balance(&self, address: &str) -> Result<Amount>;

    async fn height(&self) -> Result<u64>;

    /// Number of subscribers under a topic, optionally restricted to
    /// subscribers whose public key starts with `prefix` (the one-byte
    /// shards discovery samples from).
    async fn subscribers_count(&self, topic: &str, prefix: Option<&[u8]>) -> Result<usize>;

    /// One page of subscribers with their published metadata.
    async fn subscribers(
        &self,
        topic: &str,
        offset: usize,
        limit: usize,
        prefix: Option<&[u8]>,
    ) -> Result<HashMap<String, String>>;

    /// Subscription record of one subscriber.
    async fn subscription(&self, topic: &str, address: &str) -> Result<SubscriptionInfo>;

    /// Submit a (queued) subscribe transaction.
    async fn subscribe(
        &self,
        identifier: &str,
        topic: &str,
        duration: u64,
        meta: &str,
        fee: Amount,
        replace_tx_pool: bool,
    ) -> Result<()>;

    /// Derive the wallet address receiving payments for a client address.
    fn resolve_wallet_address(&self, client_address: &str) -> Result<String>;

    /// Create a nano-pay issuer toward `recipient`.
    async fn new_nano_pay(
        &self,
        recipient: &str,
        fee: Amount,
        duration: u64,
    ) -> Result<Box<dyn NanoPayIssuer>>;

    /// Create a nano-pay claimer for the local account.
    async fn new_nano_pay_claimer(
        &self,
        claim_interval: Duration,
    ) -> Result<std::sync::Arc<dyn NanoPayClaimer>>;
}

/// Extract the Ed25519 public key from a client address.
///
/// Client addresses are `identifier.pubkeyhex` (the identifier part,
/// possibly dotted itself, is optional); the final component is always the
/// hex public key.
pub fn client_addr_public_key(address: &str) -> Result<PublicKey> {
    let hex_part = address.rsplit('.').next().unwrap_or(address);
    PublicKey::from_hex(hex_part)
        .map_err(|_| Error::Directory(format!("invalid client address: {address}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SigningKeyPair;

    #[test]
    fn test_client_addr_public_key() {
        let kp = SigningKeyPair::generate();
        let pk = kp.public_key();

        let bare = pk.to_hex();
        assert_eq!(client_addr_public_key(&bare).unwrap(), pk);

        let with_identifier = format!("exit-7.{}", pk.to_hex());
        assert_eq!(client_addr_public_key(&with_identifier).unwrap(), pk);

        assert!(client_addr_public_key("nonsense").is_err());
    }
}

//! Exit-side service advertisement.
//!
//! Keeps a subscription to `prefix + serviceName` alive with the encoded
//! service metadata as its payload. Renewal is scheduled at a jittered
//! fraction of the remaining lease so a fleet of exits does not resubscribe
//! in lockstep.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::directory::DirectoryClient;
use crate::error::Result;
use crate::protocol::ServiceMetadata;
use crate::types::Amount;

/// Jitter factor applied to renewal scheduling.
pub const SUBSCRIBE_DURATION_RANDOM_FACTOR: f64 = 0.1;

/// Upper bound between subscription checks, whatever the lease says.
pub const MAX_CHECK_SUBSCRIBE_INTERVAL: Duration = Duration::from_secs(60);

/// Renew when fewer than this many blocks remain on the lease.
const EXPIRY_MARGIN_BLOCKS: u64 = 3;

/// Expected block time of the underlying chain.
const BLOCK_INTERVAL: Duration = Duration::from_secs(20);

/// Publisher configuration.
#[derive(Debug, Clone)]
pub struct PublishConfig {
    /// Requested lease length in blocks.
    pub duration: u64,
    /// Fee per subscribe transaction, capped at the current balance.
    pub fee: Amount,
    /// Replace a queued subscribe transaction instead of stacking one.
    pub replace_tx_pool: bool,
}

/// Maintains one topic subscription carrying the service metadata.
pub struct MetadataPublisher {
    directory: Arc<dyn DirectoryClient>,
    topic: String,
    metadata_raw: String,
    config: PublishConfig,
    close: CancellationToken,
}

impl MetadataPublisher {
    pub fn new(
        directory: Arc<dyn DirectoryClient>,
        topic: String,
        metadata: &ServiceMetadata,
        config: PublishConfig,
        close: CancellationToken,
    ) -> Result<Self> {
        Ok(Self {
            directory,
            topic,
            metadata_raw: metadata.encode()?,
            config,
            close,
        })
    }

    /// The raw payload being published.
    pub fn metadata_raw(&self) -> &str {
        &self.metadata_raw
    }

    /// Run the renewal loop until the close token fires.
    pub async fn run(self) {
        loop {
            let wait = self.next_renewal_delay().await;
            if !wait.is_zero() {
                tokio::select! {
                    _ = self.close.cancelled() => return,
                    _ = tokio::time::sleep(wait) => {}
                }
            }
            if self.close.is_cancelled() {
                return;
            }

            self.resubscribe().await;

            let lease = BLOCK_INTERVAL
                * self.config.duration.saturating_sub(EXPIRY_MARGIN_BLOCKS).max(1) as u32;
            let wait = jittered(lease).min(MAX_CHECK_SUBSCRIBE_INTERVAL);
            tokio::select! {
                _ = self.close.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// How long the current subscription allows us to wait before acting.
    /// Zero means renew now.
    async fn next_renewal_delay(&self) -> Duration {
        let own = self.directory.client_address();
        let sub = match self.directory.subscription(&self.topic, &own).await {
            Ok(sub) => sub,
            Err(e) => {
                warn!("get existing subscription: {e}");
                return Duration::ZERO;
            }
        };

        if sub.meta.is_empty() && sub.expires_at == 0 {
            return Duration::ZERO;
        }
        if sub.meta != self.metadata_raw {
            info!("existing subscription meta needs update");
            return Duration::ZERO;
        }

        let height = match self.directory.height().await {
            Ok(h) => h,
            Err(e) => {
                warn!("get current height: {e}");
                return Duration::ZERO;
            }
        };

        let blocks_left = sub.expires_at.saturating_sub(height);
        if blocks_left < EXPIRY_MARGIN_BLOCKS {
            info!("existing subscription is expiring");
            return Duration::ZERO;
        }

        info!(blocks_left, "existing subscription still valid");
        jittered(BLOCK_INTERVAL * blocks_left as u32)
    }

    async fn resubscribe(&self) {
        let mut fee = self.config.fee;
        if !fee.is_zero() {
            match self
                .directory
                .balance(&self.directory.wallet_address())
                .await
            {
                Ok(balance) if fee > balance => fee = balance,
                Ok(_) => {}
                Err(e) => warn!("get balance: {e}"),
            }
        }

        if let Err(e) = self
            .directory
            .subscribe(
                "",
                &self.topic,
                self.config.duration,
                &self.metadata_raw,
                fee,
                self.config.replace_tx_pool,
            )
            .await
        {
            warn!("subscribe failed: {e}");
        } else {
            info!(topic = %self.topic, "subscription submitted");
        }
    }
}

/// Scale a duration down by up to [`SUBSCRIBE_DURATION_RANDOM_FACTOR`].
fn jittered(d: Duration) -> Duration {
    let factor = 1.0 - rand::thread_rng().gen::<f64>() * SUBSCRIBE_DURATION_RANDOM_FACTOR;
    d.mul_f64(factor)
}

//! Streaming micropayments over the tunnel.
//!
//! The entry watches the byte counters and periodically writes an
//! incremented, signed nano-pay transaction on the dedicated payment
//! substream. The exit claims each transaction and runs a watchdog that
//! closes the session when coverage falls behind.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::protocol::{
    read_var_bytes, write_stream_metadata, write_var_bytes, StreamMetadata,
    MAX_NANO_PAY_TXN_SIZE,
};
use crate::types::{Amount, Price, TrafficCounters, TRAFFIC_UNIT};

/// Unpaid traffic units that trigger an immediate payment.
pub const TRAFFIC_PAYMENT_THRESHOLD: u64 = 32;

/// Traffic units that may stay unpaid before enforcement closes.
pub const MAX_TRAFFIC_UNPAID: u64 = 1;

/// Required ratio of claimed amount to accumulated cost.
pub const MIN_TRAFFIC_COVERAGE: f64 = 0.9;

/// Grace window before sampled totals are adopted by the watchdog.
pub const TRAFFIC_DELAY: Duration = Duration::from_secs(10);

/// Extra wait for in-flight payments before a violation verdict.
pub const MAX_NANO_PAY_DELAY: Duration = Duration::from_secs(30);

/// Longest interval between two payments regardless of traffic.
pub const NANO_PAY_UPDATE_INTERVAL: Duration = Duration::from_secs(180);

/// Validity of a nano-pay instance, in blocks.
pub const NANO_PAY_DURATION_BLOCKS: u64 = 4320;

/// Off-chain payment issuer: every call returns a signed transaction whose
/// cumulative amount grew by the given delta.
#[async_trait]
pub trait NanoPayIssuer: Send + Sync {
    fn recipient(&self) -> String;

    async fn increment(&self, delta: Amount, fee: Amount) -> Result<Vec<u8>>;
}

/// Off-chain payment claimer: settles incremental transactions and tracks
/// the cumulative claimed amount.
#[async_trait]
pub trait NanoPayClaimer: Send + Sync {
    /// Claim one transaction, returning the new cumulative amount.
    async fn claim(&self, tx: &[u8]) -> Result<Amount>;

    /// Cumulative amount claimed so far.
    fn amount(&self) -> Amount;

    fn is_closed(&self) -> bool;
}

/// Fee policy of the paying side.
#[derive(Debug, Clone, Default)]
pub struct PayerConfig {
    /// Explicit per-transaction fee; when unset the fee is
    /// `max(cost * fee_percentage, min_fee)`.
    pub fee: Option<Amount>,
    pub min_fee: Amount,
    pub fee_percentage: f64,
}

/// The payment substream plus the wallet address it pays into.
pub type SharedPaymentStream = Arc<tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

/// Source of nano-pay issuers (the chain client).
#[async_trait]
pub trait NanoPaySource: Send + Sync {
    async fn new_nano_pay(
        &self,
        recipient: &str,
        fee: Amount,
        duration: u64,
    ) -> Result<Box<dyn NanoPayIssuer>>;
}

/// Mark a freshly opened stream as the payment substream.
pub async fn open_payment_stream<S>(stream: &mut S) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    write_stream_metadata(stream, &StreamMetadata::payment()).await
}

/// Entry-side payment loop.
///
/// Wakes every 100 ms; a payment fires when unpaid traffic exceeds
/// [`TRAFFIC_PAYMENT_THRESHOLD`] traffic units or the last payment is
/// older than [`NANO_PAY_UPDATE_INTERVAL`]. Returns when the tunnel
/// closes or the payment channel becomes unusable.
pub async fn start_payment(
    counters: Arc<TrafficCounters>,
    price: Price,
    source: Arc<dyn NanoPaySource>,
    config: PayerConfig,
    close: CancellationToken,
    get_payment_stream: impl Fn() -> BoxFuture<'static, Result<(SharedPaymentStream, String)>>
        + Send
        + Sync,
) {
    let mut np: Option<Box<dyn NanoPayIssuer>> = None;
    let mut last_cost = Amount::ZERO;
    let mut last_payment_time = Instant::now();
    let tick = Duration::from_millis(100);

    'outer: loop {
        loop {
            tokio::select! {
                _ = close.cancelled() => return,
                _ = tokio::time::sleep(tick) => {}
            }
            let (used_e2x, used_x2e) = counters.used();
            let (paid_e2x, paid_x2e) = counters.paid();
            if (used_e2x + used_x2e) - (paid_e2x + paid_x2e)
                > TRAFFIC_PAYMENT_THRESHOLD * TRAFFIC_UNIT
            {
                break;
            }
            if last_payment_time.elapsed() > NANO_PAY_UPDATE_INTERVAL {
                break;
            }
        }

        let (used_e2x, used_x2e) = counters.used();
        let (paid_e2x, paid_x2e) = counters.paid();
        let cost = price
            .entry_to_exit
            .cost_for_bytes(used_e2x - paid_e2x)
            .saturating_add(price.exit_to_entry.cost_for_bytes(used_x2e - paid_x2e));
        if cost == last_cost || cost <= Amount::ZERO {
            continue;
        }
        let cost_time = Instant::now();

        let (stream, receiver) = match get_payment_stream().await {
            Ok(v) => v,
            Err(e) => {
                warn!("get payment stream: {e}");
                continue;
            }
        };
        if receiver.is_empty() {
            continue;
        }

        if np.as_ref().map_or(true, |p| p.recipient() != receiver) {
            np = match source
                .new_nano_pay(
                    &receiver,
                    config.fee.unwrap_or(Amount::ZERO),
                    NANO_PAY_DURATION_BLOCKS,
                )
                .await
            {
                Ok(p) => Some(p),
                Err(e) => {
                    warn!("create nano pay: {e}");
                    continue;
                }
            };
        }
        let issuer = np.as_ref().expect("issuer just created");

        let fee = config.fee.unwrap_or_else(|| {
            let f = cost.mul_f64(config.fee_percentage);
            if f < config.min_fee {
                config.min_fee
            } else {
                f
            }
        });

        let mut tx = None;
        for attempt in 0..3 {
            if attempt > 0 {
                tokio::select! {
                    _ = close.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
            }
            match issuer.increment(cost, fee).await {
                Ok(t) => {
                    tx = Some(t);
                    break;
                }
                Err(e) => debug!("nano pay increment failed: {e}"),
            }
        }
        let Some(tx) = tx else {
            warn!("sending nano pay failed after retries, stopping payments");
            return;
        };
        if tx.is_empty() {
            warn!("nano pay produced an empty transaction, stopping payments");
            return;
        }

        {
            let mut guard = stream.lock().await;
            if let Err(e) = write_var_bytes(&mut *guard, &tx, MAX_NANO_PAY_TXN_SIZE).await {
                warn!("write payment stream: {e}");
                continue 'outer;
            }
        }

        counters.record_paid(used_e2x, used_x2e);
        last_cost = cost;
        last_payment_time = cost_time;
        info!(%cost, "nano pay sent");
    }
}

/// Exit-side view of the latest claimed payment.
#[derive(Debug)]
pub struct ClaimState {
    last_payment_time: Mutex<Instant>,
    /// Raw [`Amount`] of the cumulative claim.
    last_payment_amount: AtomicI64,
    bytes_paid: AtomicU64,
}

impl Default for ClaimState {
    fn default() -> Self {
        Self::new()
    }
}

impl ClaimState {
    pub fn new() -> Self {
        Self {
            last_payment_time: Mutex::new(Instant::now()),
            last_payment_amount: AtomicI64::new(0),
            bytes_paid: AtomicU64::new(0),
        }
    }

    pub fn last_payment_amount(&self) -> Amount {
        Amount::from_raw(self.last_payment_amount.load(Ordering::Relaxed))
    }

    pub fn last_payment_time(&self) -> Instant {
        *self.last_payment_time.lock()
    }

    pub fn bytes_paid(&self) -> u64 {
        self.bytes_paid.load(Ordering::Relaxed)
    }

    fn record(&self, amount: Amount, bytes_paid: u64) {
        self.last_payment_amount
            .store(amount.raw(), Ordering::Relaxed);
        self.bytes_paid.store(bytes_paid, Ordering::Relaxed);
        *self.last_payment_time.lock() = Instant::now();
    }
}

/// Exit-side payment reader: claim every transaction arriving on the
/// payment substream.
///
/// Returns `Ok(())` when the claimer reports itself closed; stream errors
/// propagate so the session tears down.
pub async fn handle_payment_stream<R>(
    stream: &mut R,
    claimer: Arc<dyn NanoPayClaimer>,
    state: Arc<ClaimState>,
    get_total: impl Fn() -> (Amount, u64) + Send + Sync,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    loop {
        let tx = read_var_bytes(stream, MAX_NANO_PAY_TXN_SIZE)
            .await
            .map_err(|e| Error::NanoPay(format!("couldn't read payment stream: {e}")))?;
        if tx.is_empty() {
            return Err(Error::NanoPay("empty transaction bytes".into()));
        }

        let (total_cost, total_bytes) = get_total();
        if total_cost.is_zero() {
            continue;
        }

        let mut claimed = None;
        for attempt in 0..3 {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs(3)).await;
            }
            match claimer.claim(&tx).await {
                Ok(amount) => {
                    claimed = Some(amount);
                    break;
                }
                Err(e) => warn!("couldn't claim nano pay: {e}"),
            }
        }
        let Some(_) = claimed else {
            if claimer.is_closed() {
                info!("nano pay claimer closed");
                return Ok(());
            }
            continue;
        };

        let cumulative = claimer.amount();
        let bytes_paid = ((i128::from(total_bytes) * i128::from(cumulative.raw()))
            / i128::from(total_cost.raw())) as u64;
        state.record(cumulative, bytes_paid);
    }
}

/// Exit-side coverage watchdog.
///
/// Samples `(total_cost, total_bytes)` every second but adopts each sample
/// only after [`TRAFFIC_DELAY`], giving in-flight payments time to land.
/// After the payment triggers would have fired, waits another
/// [`MAX_NANO_PAY_DELAY`] and then closes the session if both shortfall
/// conditions hold. Returns `Ok(())` on external close, the shortfall
/// error on violation.
pub async fn enforce_payment(
    state: Arc<ClaimState>,
    get_total: Arc<dyn Fn() -> (Amount, u64) + Send + Sync>,
    close: CancellationToken,
) -> Result<()> {
    let delayed: Arc<Mutex<(Amount, u64)>> = Arc::new(Mutex::new((Amount::ZERO, 0)));

    // Sampler: every second, capture the totals and schedule their
    // adoption TRAFFIC_DELAY later.
    {
        let delayed = Arc::clone(&delayed);
        let get_total = Arc::clone(&get_total);
        let close = close.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = close.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
                let sample = get_total();
                let delayed = Arc::clone(&delayed);
                tokio::spawn(async move {
                    tokio::time::sleep(TRAFFIC_DELAY).await;
                    *delayed.lock() = sample;
                });
            }
        });
    }

    let tick = Duration::from_millis(100);
    loop {
        let (total_cost, total_bytes);
        loop {
            tokio::select! {
                _ = close.cancelled() => return Ok(()),
                _ = tokio::time::sleep(tick) => {}
            }
            let (cost, bytes) = *delayed.lock();
            if cost <= state.last_payment_amount() {
                continue;
            }
            if state.last_payment_time().elapsed() > NANO_PAY_UPDATE_INTERVAL {
                total_cost = cost;
                total_bytes = bytes;
                break;
            }
            if bytes.saturating_sub(state.bytes_paid()) > TRAFFIC_PAYMENT_THRESHOLD * TRAFFIC_UNIT
            {
                total_cost = cost;
                total_bytes = bytes;
                break;
            }
        }

        tokio::select! {
            _ = close.cancelled() => return Ok(()),
            _ = tokio::time::sleep(MAX_NANO_PAY_DELAY) => {}
        }

        let last_amount = state.last_payment_amount();
        let unpaid = total_cost.saturating_sub(last_amount);
        let coverage_floor = total_cost.mul_f64(MIN_TRAFFIC_COVERAGE);
        // One traffic unit's worth at the session's observed price.
        let unpaid_ceiling = if total_bytes == 0 {
            Amount::ZERO
        } else {
            Amount::from_raw(
                ((MAX_TRAFFIC_UNPAID * TRAFFIC_UNIT) as f64 * total_cost.to_f64()
                    / total_bytes as f64) as i64,
            )
        };

        if last_amount < coverage_floor && unpaid > unpaid_ceiling {
            warn!(
                since_last_payment = ?state.last_payment_time().elapsed(),
                claimed = %last_amount,
                expected = %total_cost,
                "not enough payment"
            );
            return Err(Error::PaymentShortfall {
                claimed: last_amount.to_string(),
                expected: total_cost.to_string(),
            });
        }
    }
}

/// Watch the claimer's error channel; a fatal (closed-claimer) error ends
/// the session.
pub async fn watch_claimer(
    mut errors: mpsc::Receiver<Error>,
    claimer: Arc<dyn NanoPayClaimer>,
) -> Result<()> {
    while let Some(e) = errors.recv().await {
        warn!("couldn't claim nano pay: {e}");
        if claimer.is_closed() {
            return Err(Error::NanoPay("nano pay claimer closed".into()));
        }
    }
    Ok(())
}

//! Node measurement: latency and bandwidth probes.
//!
//! Both stages run on a bounded worker pool. The latency stage ranks by
//! TCP connect time; the optional bandwidth stage downloads a fixed number
//! of encrypted bytes through a measurement-mode connection and ranks by
//! the worst observed one-second window. Verdicts feed the favorite/avoid
//! storage.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::{RngCore, SeedableRng};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::directory::client_addr_public_key;
use crate::discovery::{AvoidNode, FavoriteNode, MeasureStorage, Node};
use crate::error::{Error, Result};
use crate::protocol::ConnectionMetadata;
use crate::transport::ConnWrapper;

/// Per-probe TCP connect timeout.
pub const MEASURE_DELAY_TIMEOUT: Duration = Duration::from_secs(1);

/// Latency-stage survivors, sorted ascending by delay.
pub const MEASURE_DELAY_TOP_COUNT: usize = 32;

/// Bandwidth successes after which remaining workers are cancelled.
pub const MEASURE_BANDWIDTH_TOP_COUNT: usize = 8;

/// Default pool sizes; both are clamped by the configured pool limit.
pub const DEFAULT_MEASURE_DELAY_WORKERS: usize = 32;
pub const DEFAULT_MEASURE_BANDWIDTH_WORKERS: usize = 8;

/// Throughput sampling window.
const BANDWIDTH_WINDOW: Duration = Duration::from_secs(1);

/// Measurement-stage tuning, derived from the tunnel configuration.
#[derive(Debug, Clone)]
pub struct MeasureConfig {
    pub delay_workers: usize,
    pub bandwidth_workers: usize,
    /// Per-probe download budget.
    pub bandwidth_timeout: Duration,
    /// Overall budget for the whole bandwidth stage.
    pub bandwidth_workers_timeout: Duration,
    /// Bytes the server sends on a measurement connection.
    pub measurement_bytes: u32,
}

impl Default for MeasureConfig {
    fn default() -> Self {
        Self {
            delay_workers: DEFAULT_MEASURE_DELAY_WORKERS,
            bandwidth_workers: DEFAULT_MEASURE_BANDWIDTH_WORKERS,
            bandwidth_timeout: Duration::from_secs(10),
            bandwidth_workers_timeout: Duration::from_secs(32),
            measurement_bytes: 1 << 20,
        }
    }
}

impl MeasureConfig {
    /// Clamp worker counts to a pool limit (0 keeps the defaults).
    pub fn clamped(mut self, max_pool_size: usize) -> Self {
        if max_pool_size > 0 {
            self.delay_workers = self.delay_workers.min(max_pool_size);
            self.bandwidth_workers = self.bandwidth_workers.min(max_pool_size);
        }
        self
    }
}

/// Measure TCP connect time for every node concurrently.
///
/// Nodes that fail or time out are dropped. The result is sorted
/// non-decreasing by delay and truncated to [`MEASURE_DELAY_TOP_COUNT`].
pub async fn measure_delay(
    nodes: Vec<Node>,
    workers: usize,
    timeout: Duration,
) -> Vec<Node> {
    let started = Instant::now();
    let total = nodes.len();
    let nodes = Arc::new(nodes);
    let next = Arc::new(AtomicUsize::new(0));
    let results: Arc<Mutex<Vec<Node>>> = Arc::new(Mutex::new(Vec::with_capacity(total)));

    let workers = workers.max(1).min(total.max(1));
    let mut handles = Vec::with_capacity(workers);
    for _ in 0..workers {
        let nodes = Arc::clone(&nodes);
        let next = Arc::clone(&next);
        let results = Arc::clone(&results);
        handles.push(tokio::spawn(async move {
            loop {
                let i = next.fetch_add(1, Ordering::Relaxed);
                if i >= nodes.len() {
                    return;
                }
                let node = &nodes[i];
                let addr = node.metadata.tcp_addr();
                let probe_start = Instant::now();
                match tokio::time::timeout(timeout, TcpStream::connect(&addr)).await {
                    Ok(Ok(_conn)) => {
                        let delay = probe_start.elapsed().as_secs_f32() * 1000.0;
                        let mut measured = node.clone();
                        measured.delay = Some(delay);
                        results.lock().push(measured);
                    }
                    Ok(Err(e)) => debug!(%addr, "delay probe failed: {e}"),
                    Err(_) => debug!(%addr, "delay probe timed out"),
                }
            }
        }));
    }
    for handle in handles {
        let _ = handle.await;
    }

    let mut measured = Arc::try_unwrap(results)
        .map(Mutex::into_inner)
        .unwrap_or_default();
    measured.sort_by(|a, b| {
        a.delay
            .partial_cmp(&b.delay)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    measured.truncate(MEASURE_DELAY_TOP_COUNT);

    info!(
        probed = total,
        reachable = measured.len(),
        elapsed = ?started.elapsed(),
        "delay measurement finished"
    );
    measured
}

/// Measure downlink bandwidth for delay-ranked nodes.
///
/// Each worker dials the node, runs a measurement-mode handshake and times
/// the download. Success records the node (and upserts a favorite);
/// failure other than cancellation upserts an avoid entry. Once
/// [`MEASURE_BANDWIDTH_TOP_COUNT`] successes are in, the stage cancels.
/// Survivors are sorted non-increasing by bandwidth.
pub async fn measure_bandwidth(
    wrapper: Arc<ConnWrapper>,
    nodes: Vec<Node>,
    n: usize,
    config: &MeasureConfig,
    storage: Option<Arc<MeasureStorage>>,
) -> Vec<Node> {
    let started = Instant::now();
    let cancel = CancellationToken::new();
    let deadline = cancel.clone();
    tokio::spawn({
        let timeout = config.bandwidth_workers_timeout;
        async move {
            tokio::time::sleep(timeout).await;
            deadline.cancel();
        }
    });

    let total = nodes.len();
    let nodes = Arc::new(nodes);
    let next = Arc::new(AtomicUsize::new(0));
    let results: Arc<Mutex<Vec<Node>>> = Arc::new(Mutex::new(Vec::new()));

    let workers = config.bandwidth_workers.max(1).min(total.max(1));
    let mut handles = Vec::with_capacity(workers);
    for _ in 0..workers {
        let wrapper = Arc::clone(&wrapper);
        let nodes = Arc::clone(&nodes);
        let next = Arc::clone(&next);
        let results = Arc::clone(&results);
        let storage = storage.clone();
        let cancel = cancel.clone();
        let config = config.clone();
        handles.push(tokio::spawn(async move {
            loop {
                if cancel.is_cancelled() {
                    return;
                }
                let i = next.fetch_add(1, Ordering::Relaxed);
                if i >= nodes.len() {
                    return;
                }
                let node = &nodes[i];

                match probe_bandwidth(&wrapper, node, &config, &cancel).await {
                    Ok((min_bw, max_bw)) => {
                        info!(
                            addr = %node.metadata.tcp_addr(),
                            min_kbs = min_bw / 1024.0,
                            max_kbs = max_bw / 1024.0,
                            "bandwidth measured"
                        );
                        if let Some(storage) = &storage {
                            let updated = storage.add_favorite_node(FavoriteNode {
                                ip: node.metadata.ip.clone(),
                                address: node.address.clone(),
                                metadata: node.metadata_raw.clone(),
                                delay: node.delay.unwrap_or_default(),
                                min_bandwidth: min_bw / 1024.0,
                                max_bandwidth: max_bw / 1024.0,
                            });
                            if updated {
                                if let Err(e) = storage.save_favorites() {
                                    warn!("saving favorites: {e}");
                                }
                            }
                        }

                        let mut measured = node.clone();
                        measured.bandwidth = Some(min_bw);
                        let mut results = results.lock();
                        results.push(measured);
                        if results.len() >= n {
                            debug!("collected enough results, cancelling bandwidth stage");
                            cancel.cancel();
                        }
                    }
                    Err(e) => {
                        if cancel.is_cancelled() {
                            return;
                        }
                        debug!(addr = %node.metadata.tcp_addr(), "bandwidth probe failed: {e}");
                        if let Some(storage) = &storage {
                            storage.add_avoid_node(AvoidNode {
                                ip: node.metadata.ip.clone(),
                                address: node.address.clone(),
                            });
                            if let Err(e) = storage.save_avoid_nodes() {
                                warn!("saving avoid nodes: {e}");
                            }
                            info!(ip = %node.metadata.ip, "added avoid node");
                        }
                    }
                }
            }
        }));
    }
    for handle in handles {
        let _ = handle.await;
    }

    let mut measured = Arc::try_unwrap(results)
        .map(Mutex::into_inner)
        .unwrap_or_default();
    measured.sort_by(|a, b| {
        b.bandwidth
            .partial_cmp(&a.bandwidth)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    info!(
        probed = total,
        measured = measured.len(),
        elapsed = ?started.elapsed(),
        "bandwidth measurement finished"
    );
    measured
}

async fn probe_bandwidth(
    wrapper: &ConnWrapper,
    node: &Node,
    config: &MeasureConfig,
    cancel: &CancellationToken,
) -> Result<(f64, f64)> {
    let remote_key = client_addr_public_key(&node.address)?;
    let addr = node.metadata.tcp_addr();

    let conn = tokio::select! {
        _ = cancel.cancelled() => return Err(Error::Closed),
        res = tokio::time::timeout(MEASURE_DELAY_TIMEOUT, TcpStream::connect(&addr)) => {
            res.map_err(|_| Error::ConnectionTimeout)?
                .map_err(Error::Io)?
        }
    };

    let meta = ConnectionMetadata {
        is_measurement: true,
        measurement_bytes_downlink: config.measurement_bytes,
        ..Default::default()
    };
    let (mut conn, _) = tokio::select! {
        _ = cancel.cancelled() => return Err(Error::Closed),
        res = wrapper.wrap(conn, Some(&remote_key), Some(meta)) => res?,
    };

    tokio::select! {
        _ = cancel.cancelled() => Err(Error::Closed),
        res = measure_download(
            &mut conn,
            config.measurement_bytes as usize,
            config.bandwidth_timeout,
        ) => res,
    }
}

/// Client half of a measurement connection: read `expected` bytes and
/// report `(min, max)` window throughput in bytes per second.
///
/// Windows are [`BANDWIDTH_WINDOW`] long; a download finishing inside the
/// first window reports its overall rate for both bounds.
pub async fn measure_download<S>(
    conn: &mut S,
    expected: usize,
    timeout: Duration,
) -> Result<(f64, f64)>
where
    S: AsyncRead + Unpin,
{
    let deadline = Instant::now() + timeout;
    let start = Instant::now();
    let mut buf = [0u8; 4096];
    let mut received = 0usize;

    let mut window_start = start;
    let mut window_bytes = 0u64;
    let mut min_rate = f64::INFINITY;
    let mut max_rate: f64 = 0.0;

    while received < expected {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .ok_or(Error::ConnectionTimeout)?;
        let n = tokio::time::timeout(remaining, conn.read(&mut buf))
            .await
            .map_err(|_| Error::ConnectionTimeout)??;
        if n == 0 {
            break;
        }
        received += n;
        window_bytes += n as u64;

        let elapsed = window_start.elapsed();
        if elapsed >= BANDWIDTH_WINDOW {
            let rate = window_bytes as f64 / elapsed.as_secs_f64();
            min_rate = min_rate.min(rate);
            max_rate = max_rate.max(rate);
            window_start = Instant::now();
            window_bytes = 0;
        }
    }

    if received == 0 {
        return Err(Error::Transport(crate::error::TransportError::ReceiveFailed(
            "measurement peer sent no data".into(),
        )));
    }

    if min_rate.is_infinite() {
        // Finished before the first full window.
        let rate = received as f64 / start.elapsed().as_secs_f64().max(f64::EPSILON);
        return Ok((rate, rate));
    }
    Ok((min_rate, max_rate))
}

/// Server half of a measurement connection: send exactly `total` random
/// bytes, flush, and let the caller close.
pub async fn serve_measurement<S>(conn: &mut S, total: u32) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut remaining = total as usize;
    let mut buf = [0u8; 4096];
    let mut rng = rand::rngs::StdRng::from_entropy();
    while remaining > 0 {
        let n = remaining.min(buf.len());
        rng.fill_bytes(&mut buf[..n]);
        conn.write_all(&buf[..n]).await?;
        remaining -= n;
    }
    conn.flush().await?;
    Ok(())
}

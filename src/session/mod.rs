//! Tunnel lifecycle: connect, reconnect, linger, close.
//!
//! [`Tunnel`] is the shared state of one service endpoint (entry or
//! exit): configuration, directory client, handshake state, the live
//! TCP/UDP connections, byte counters and the close signal. The entry
//! side drives [`Tunnel::create_server_conn`]; the exit side accepts
//! inbound connections through [`Tunnel::wrap_incoming`].

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{ServiceConfig, ServiceOptions, TunnelConfig};
use crate::crypto::{PublicKey, SigningKeyPair};
use crate::directory::{client_addr_public_key, DirectoryClient};
use crate::discovery::{self, MeasureStorage, Node};
use crate::error::{Error, Result};
use crate::measure::{self, MeasureConfig, MEASURE_BANDWIDTH_TOP_COUNT, MEASURE_DELAY_TIMEOUT};
use crate::payment::{NanoPayIssuer, NanoPaySource, PayerConfig};
use crate::protocol::{ConnectionMetadata, ServiceMetadata, PIPE_BUFFER_SIZE};
use crate::transport::{ConnWrapper, TunnelConn, UdpMux, UdpMuxConfig};
use crate::types::{Amount, Price, TrafficCounters};

/// Backoff between reconnect rounds.
pub const RECONNECT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Ceiling on the bytes an exit serves per measurement connection.
const MAX_MEASUREMENT_BYTES: u32 = 64 << 20;

/// Close-time behavior while sessions are still active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Linger {
    /// Close immediately.
    #[default]
    Immediate,
    /// Wait for all active sessions to finish.
    Forever,
    /// Wait up to the given duration.
    Timeout(Duration),
}

#[derive(Default)]
struct TunnelState {
    connected: bool,
    metadata: Option<ServiceMetadata>,
    remote_address: String,
    price: Price,
    payment_receiver: String,
    tcp: Option<TunnelConn<TcpStream>>,
    udp: Option<Arc<UdpMux>>,
    udp_read: Option<mpsc::Receiver<Vec<u8>>>,
}

/// Shared state of one tunnel endpoint.
pub struct Tunnel {
    service: ServiceConfig,
    options: ServiceOptions,
    config: TunnelConfig,
    directory: Arc<dyn DirectoryClient>,
    wrapper: Arc<ConnWrapper>,
    counters: Arc<TrafficCounters>,
    storage: Option<Arc<MeasureStorage>>,
    is_server: bool,
    reverse_metadata: RwLock<Option<ServiceMetadata>>,
    preset_node: RwLock<Option<Node>>,
    state: RwLock<TunnelState>,
    linger: RwLock<Linger>,
    close: CancellationToken,
    connect_lock: tokio::sync::Mutex<()>,
    on_connect: watch::Sender<u64>,
    active_sessions: watch::Sender<usize>,
    sort_hook: Option<Box<dyn Fn(&mut Vec<Node>) + Send + Sync>>,
}

impl Tunnel {
    pub fn new(
        service: ServiceConfig,
        options: ServiceOptions,
        config: TunnelConfig,
        directory: Arc<dyn DirectoryClient>,
        identity: Arc<SigningKeyPair>,
        is_server: bool,
    ) -> Result<Self> {
        let algo = service.encryption_algo()?;
        let wrapper = Arc::new(ConnWrapper::new(identity, algo, is_server));

        let storage = match (&config.measure_storage_path, is_server) {
            (Some(path), false) => {
                let topic = format!("{}{}", config.subscription_prefix, service.name);
                Some(Arc::new(MeasureStorage::new(path, &topic)))
            }
            _ => None,
        };

        Ok(Self {
            service,
            options,
            config,
            directory,
            wrapper,
            counters: Arc::new(TrafficCounters::new()),
            storage,
            is_server,
            reverse_metadata: RwLock::new(None),
            preset_node: RwLock::new(None),
            state: RwLock::new(TunnelState::default()),
            linger: RwLock::new(Linger::Immediate),
            close: CancellationToken::new(),
            connect_lock: tokio::sync::Mutex::new(()),
            on_connect: watch::channel(0).0,
            active_sessions: watch::channel(0).0,
            sort_hook: None,
        })
    }

    /// Override final candidate ordering (after measurement).
    pub fn set_sort_hook(&mut self, hook: impl Fn(&mut Vec<Node>) + Send + Sync + 'static) {
        self.sort_hook = Some(Box::new(hook));
    }

    /// Pin a single remote node, bypassing discovery and measurement.
    pub fn set_remote_node(&self, node: Node) {
        *self.preset_node.write() = Some(node);
    }

    /// Port lists the entry asks the exit to serve in reverse mode.
    pub fn set_reverse_metadata(&self, metadata: ServiceMetadata) {
        *self.reverse_metadata.write() = Some(metadata);
    }

    pub fn topic(&self) -> String {
        format!("{}{}", self.config.subscription_prefix, self.service.name)
    }

    pub fn service(&self) -> &ServiceConfig {
        &self.service
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    pub fn counters(&self) -> Arc<TrafficCounters> {
        Arc::clone(&self.counters)
    }

    pub fn conn_wrapper(&self) -> Arc<ConnWrapper> {
        Arc::clone(&self.wrapper)
    }

    pub fn close_token(&self) -> CancellationToken {
        self.close.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.close.is_cancelled()
    }

    pub fn connected(&self) -> bool {
        self.state.read().connected
    }

    pub fn price(&self) -> Price {
        self.state.read().price
    }

    pub fn payment_receiver(&self) -> String {
        self.state.read().payment_receiver.clone()
    }

    pub fn remote_address(&self) -> String {
        self.state.read().remote_address.clone()
    }

    pub fn metadata(&self) -> Option<ServiceMetadata> {
        self.state.read().metadata.clone()
    }

    /// Receiver notified (by counter bump) on every successful connect.
    pub fn on_connect(&self) -> watch::Receiver<u64> {
        self.on_connect.subscribe()
    }

    /// Accumulated session cost and byte total at the current prices.
    pub fn total_cost(&self) -> (Amount, u64) {
        let price = self.price();
        let (e2x, x2e) = self.counters.used();
        let cost = price
            .entry_to_exit
            .cost_for_bytes(e2x)
            .saturating_add(price.exit_to_entry.cost_for_bytes(x2e));
        (cost, e2x + x2e)
    }

    /// Fee policy for the entry-side payment loop.
    pub fn payer_config(&self) -> PayerConfig {
        PayerConfig {
            fee: self.config.nano_pay_fee,
            min_fee: self.config.min_nano_pay_fee,
            fee_percentage: self.config.nano_pay_fee_percentage,
        }
    }

    /// Nano-pay source backed by the directory client.
    pub fn nano_pay_source(&self) -> Arc<dyn NanoPaySource> {
        Arc::new(DirectoryPaySource(Arc::clone(&self.directory)))
    }

    /// Take ownership of the established TCP connection (the stream
    /// multiplexer runs on it).
    pub fn take_tcp_conn(&self) -> Option<TunnelConn<TcpStream>> {
        self.state.write().tcp.take()
    }

    pub fn udp_mux(&self) -> Option<Arc<UdpMux>> {
        self.state.read().udp.clone()
    }

    /// Take the UDP read channel (decrypted user datagrams).
    pub fn take_udp_read_chan(&self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.state.write().udp_read.take()
    }

    fn set_payment_receiver(&self, receiver: String) {
        self.state.write().payment_receiver = receiver;
    }

    /// Discovery + measurement: the top `n` candidates for this service.
    pub async fn top_performance_nodes(
        &self,
        measure_bandwidth: bool,
        n: usize,
    ) -> Result<Vec<Node>> {
        if let Some(preset) = self.preset_node.read().clone() {
            return Ok(vec![preset]);
        }

        // Serialize measurement runs sharing a storage directory, so one
        // run sees the verdicts of the previous one.
        let _storage_guard = match &self.storage {
            Some(storage) => {
                let lock = discovery::path_lock(storage.dir());
                let guard = lock.lock_owned().await;
                storage.load()?;
                Some(guard)
            }
            None => None,
        };

        let topic = self.topic();
        let subscribers = discovery::enumerate_subscribers(
            self.directory.as_ref(),
            &topic,
            self.config.get_subscribers_batch_size,
            &self.options.address_filter,
            self.storage.as_deref(),
        )
        .await?;

        let max_price: Price = self.options.max_price.parse()?;
        let filtered = discovery::filter_nodes(
            subscribers,
            max_price,
            &self.options.address_filter,
            &self.options.ip_filter,
            self.storage.as_deref(),
        );

        let mut candidates = if filtered.len() <= 1 {
            filtered
        } else {
            let measure_config = MeasureConfig {
                bandwidth_timeout: self.config.measure_bandwidth_timeout,
                bandwidth_workers_timeout: self.config.measure_bandwidth_workers_timeout,
                measurement_bytes: self.config.measurement_bytes_downlink,
                ..MeasureConfig::default()
            }
            .clamped(self.config.max_pool_size);

            let by_delay = measure::measure_delay(
                filtered,
                measure_config.delay_workers,
                MEASURE_DELAY_TIMEOUT,
            )
            .await;

            if measure_bandwidth {
                measure::measure_bandwidth(
                    Arc::clone(&self.wrapper),
                    by_delay,
                    n,
                    &measure_config,
                    self.storage.clone(),
                )
                .await
            } else {
                by_delay.into_iter().take(n).collect()
            }
        };

        if let Some(sort) = &self.sort_hook {
            sort(&mut candidates);
        }
        Ok(candidates)
    }

    /// Entry side: ensure a live connection to an exit, connecting (or
    /// reconnecting when `force`) through the candidate list.
    pub async fn create_server_conn(&self, force: bool) -> Result<()> {
        if self.is_server || (self.connected() && !force) {
            return Ok(());
        }
        let _connecting = self.connect_lock.lock().await;
        if self.connected() && !force {
            return Ok(());
        }

        loop {
            if self.is_closed() {
                return Err(Error::Closed);
            }

            self.set_payment_receiver(String::new());

            if !self.config.min_balance.is_zero() {
                let max_price: Price = self.options.max_price.parse()?;
                if !max_price.is_free() {
                    match self
                        .directory
                        .balance(&self.directory.wallet_address())
                        .await
                    {
                        Ok(balance) => {
                            if balance < self.config.min_balance {
                                return Err(Error::InsufficientBalance);
                            }
                        }
                        Err(e) => warn!("balance lookup failed: {e}"),
                    }
                }
            }

            let candidates = match self
                .top_performance_nodes(self.config.measure_bandwidth, MEASURE_BANDWIDTH_TOP_COUNT)
                .await
            {
                Ok(c) => c,
                Err(e) => {
                    warn!("discovery failed: {e}");
                    self.sleep_or_close(RECONNECT_RETRY_DELAY).await?;
                    continue;
                }
            };
            if candidates.is_empty() {
                self.sleep_or_close(RECONNECT_RETRY_DELAY).await?;
                continue;
            }

            for node in candidates {
                if self.is_closed() {
                    return Err(Error::Closed);
                }
                match self.connect_to_candidate(&node).await {
                    Ok(()) => return Ok(()),
                    Err(e) => {
                        warn!(address = %node.address, "candidate failed: {e}");
                        self.sleep_or_close(RECONNECT_RETRY_DELAY).await?;
                    }
                }
            }
        }
    }

    async fn connect_to_candidate(&self, node: &Node) -> Result<()> {
        // Refresh the candidate's metadata unless the node is pinned; a
        // stale cached advertisement may point at a moved endpoint.
        let mut metadata = node.metadata.clone();
        if self.preset_node.read().is_none() {
            match self.directory.subscription(&self.topic(), &node.address).await {
                Ok(sub) => match ServiceMetadata::decode(&sub.meta) {
                    Ok(latest) => metadata = latest,
                    Err(e) => warn!(address = %node.address, "stale metadata kept: {e}"),
                },
                Err(e) => warn!(address = %node.address, "subscription refresh failed: {e}"),
            }
        }

        info!(
            ip = %metadata.ip,
            address = %node.address,
            delay_ms = node.delay.unwrap_or_default(),
            bandwidth_kbs = node.bandwidth.unwrap_or_default() / 1024.0,
            "selected exit"
        );

        let price = metadata.parse_price()?;

        let receiver = if !metadata.beneficiary_addr.is_empty() {
            metadata.beneficiary_addr.clone()
        } else {
            self.directory.resolve_wallet_address(&node.address)?
        };

        if let Some(reverse) = self.reverse_metadata.read().clone() {
            metadata.service_tcp = reverse.service_tcp;
            metadata.service_udp = reverse.service_udp;
        }

        {
            let mut state = self.state.write();
            state.metadata = Some(metadata);
            state.remote_address = node.address.clone();
            state.price = price;
            state.payment_receiver = receiver;
        }

        let remote_key = client_addr_public_key(&node.address)?;
        self.update_server_conn(&remote_key).await
    }

    /// Dial the selected exit and wrap TCP (and UDP when the service
    /// forwards UDP ports).
    pub async fn update_server_conn(&self, remote_key: &PublicKey) -> Result<()> {
        let metadata = self
            .metadata()
            .ok_or_else(|| Error::Config("no exit metadata selected".into()))?;
        let has_udp = !metadata.service_udp.is_empty()
            || self
                .reverse_metadata
                .read()
                .as_ref()
                .is_some_and(|m| !m.service_udp.is_empty());

        self.drop_conns().await;

        let tcp_addr = metadata.tcp_addr();
        let tcp = tokio::time::timeout(self.config.dial_timeout, TcpStream::connect(&tcp_addr))
            .await
            .map_err(|_| Error::ConnectionTimeout)?
            .map_err(Error::Io)?;
        let (conn, remote_meta) = self.wrapper.wrap(tcp, Some(remote_key), None).await?;
        self.state.write().tcp = Some(conn);
        info!(addr = %tcp_addr, "connected to TCP");

        if has_udp {
            let ip: IpAddr = metadata
                .ip
                .parse()
                .map_err(|_| Error::Config(format!("invalid exit IP: {}", metadata.ip)))?;
            let udp_addr = SocketAddr::new(ip, metadata.udp_port as u16);

            let bind: SocketAddr = if udp_addr.is_ipv6() {
                "[::]:0".parse().expect("bind addr")
            } else {
                "0.0.0.0:0".parse().expect("bind addr")
            };
            let socket = UdpSocket::bind(bind).await?;
            let mux = UdpMux::new(
                socket,
                Arc::clone(&self.wrapper),
                UdpMuxConfig {
                    is_server: false,
                    remote: Some(udp_addr),
                    counters: Some(Arc::clone(&self.counters)),
                    reverse: None,
                    buffer_size: self.service.udp_buffer_size,
                },
            );
            let read_rx = mux.start();
            mux.handshake(udp_addr, remote_key, &remote_meta.nonce).await?;

            let mut state = self.state.write();
            state.udp = Some(Arc::new(mux));
            state.udp_read = Some(read_rx);
            info!(addr = %udp_addr, "connected to UDP");
        }

        self.state.write().connected = true;
        self.on_connect.send_modify(|c| *c += 1);
        Ok(())
    }

    /// Exit side: run the accepting handshake on an inbound connection.
    ///
    /// Measurement connections are served in place and yield `None`; real
    /// tunnel connections are handed back for the stream multiplexer.
    pub async fn wrap_incoming(
        &self,
        conn: TcpStream,
    ) -> Result<Option<(TunnelConn<TcpStream>, ConnectionMetadata)>> {
        let (mut wrapped, meta) = self.wrapper.wrap(conn, None, None).await?;

        if meta.is_measurement {
            let bytes = meta.measurement_bytes_downlink.min(MAX_MEASUREMENT_BYTES);
            measure::serve_measurement(&mut wrapped, bytes).await?;
            let _ = wrapped.shutdown().await;
            return Ok(None);
        }

        Ok(Some((wrapped, meta)))
    }

    /// Ensure a live connection, then hand over the TCP stream.
    pub async fn server_tcp_conn(&self, force: bool) -> Result<TunnelConn<TcpStream>> {
        self.create_server_conn(force).await?;
        self.take_tcp_conn()
            .ok_or_else(|| Error::Config("tcp connection already taken".into()))
    }

    async fn sleep_or_close(&self, delay: Duration) -> Result<()> {
        tokio::select! {
            _ = self.close.cancelled() => Err(Error::Closed),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// Track one user session for linger accounting. Hold the guard for
    /// the session's lifetime.
    pub fn session_scope(&self) -> SessionGuard {
        self.active_sessions.send_modify(|c| *c += 1);
        SessionGuard {
            counter: self.active_sessions.clone(),
        }
    }

    pub fn active_sessions(&self) -> usize {
        *self.active_sessions.borrow()
    }

    pub fn set_linger(&self, linger: Linger) {
        *self.linger.write() = linger;
    }

    /// Wait for active sessions according to the linger mode.
    pub async fn wait_sessions(&self) {
        let linger = *self.linger.read();
        let wait = async {
            let mut rx = self.active_sessions.subscribe();
            loop {
                if *rx.borrow_and_update() == 0 {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        };
        match linger {
            Linger::Immediate => {}
            Linger::Forever => wait.await,
            Linger::Timeout(t) => {
                let _ = tokio::time::timeout(t, wait).await;
            }
        }
    }

    async fn drop_conns(&self) {
        let (tcp, udp) = {
            let mut state = self.state.write();
            state.connected = false;
            (state.tcp.take(), state.udp.take())
        };
        if let Some(mut tcp) = tcp {
            let _ = tcp.shutdown().await;
        }
        if let Some(udp) = udp {
            udp.close();
        }
    }

    /// Close the tunnel: wait out the linger policy, then cancel every
    /// loop and drop the connections. Idempotent.
    pub async fn close(&self) {
        if self.is_closed() {
            return;
        }
        self.wait_sessions().await;
        self.close.cancel();
        self.drop_conns().await;
    }
}

/// RAII guard for one active user session.
pub struct SessionGuard {
    counter: watch::Sender<usize>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.counter.send_modify(|c| *c = c.saturating_sub(1));
    }
}

struct DirectoryPaySource(Arc<dyn DirectoryClient>);

#[async_trait]
impl NanoPaySource for DirectoryPaySource {
    async fn new_nano_pay(
        &self,
        recipient: &str,
        fee: Amount,
        duration: u64,
    ) -> Result<Box<dyn NanoPayIssuer>> {
        self.0.new_nano_pay(recipient, fee, duration).await
    }
}

/// Copy bytes from `src` to `dst` through a fixed buffer, reporting every
/// written chunk to the byte counter hook.
pub async fn pipe<R, W>(mut src: R, mut dst: W, on_bytes: impl Fn(u64)) -> Result<()>
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    use tokio::io::AsyncReadExt;

    let mut buf = [0u8; PIPE_BUFFER_SIZE];
    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        dst.write_all(&buf[..n]).await?;
        on_bytes(n as u64);
    }
}

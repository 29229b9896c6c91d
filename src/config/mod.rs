//! Configuration for tollgate.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::crypto::EncryptionAlgo;
use crate::discovery::{AddressFilter, IpFilter};
use crate::error::{Error, Result};
use crate::types::Amount;

/// Default topic prefix services subscribe under.
pub const DEFAULT_SUBSCRIPTION_PREFIX: &str = "tollgate_v1.";

/// One forwarded service: a named bundle of TCP/UDP ports.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,

    /// TCP ports forwarded at the exit.
    #[serde(default)]
    pub tcp: Vec<u32>,

    /// UDP ports forwarded at the exit.
    #[serde(default)]
    pub udp: Vec<u32>,

    /// UDP socket buffer size; 0 uses the transport default.
    #[serde(default)]
    pub udp_buffer_size: usize,

    /// Symmetric algorithm for this service's tunnel.
    #[serde(default)]
    pub encryption: String,
}

impl ServiceConfig {
    pub fn encryption_algo(&self) -> Result<EncryptionAlgo> {
        if self.encryption.is_empty() {
            return Ok(EncryptionAlgo::default());
        }
        self.encryption
            .parse()
            .map_err(|e| Error::Config(format!("encryption: {e}")))
    }
}

/// Entry-side policy for choosing exits of one service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceOptions {
    /// `"entryToExit exitToEntry"` price ceiling in tokens per MiB.
    #[serde(default = "default_max_price")]
    pub max_price: String,

    /// Local IP the user-facing listeners bind to.
    #[serde(default = "default_listen_ip")]
    pub listen_ip: String,

    #[serde(default)]
    pub ip_filter: IpFilter,

    #[serde(default)]
    pub address_filter: AddressFilter,
}

fn default_max_price() -> String {
    "0 0".into()
}
fn default_listen_ip() -> String {
    "127.0.0.1".into()
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            max_price: default_max_price(),
            listen_ip: default_listen_ip(),
            ip_filter: IpFilter::default(),
            address_filter: AddressFilter::default(),
        }
    }
}

/// Tunnel-wide knobs shared by entry and exit roles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    #[serde(default = "default_subscription_prefix")]
    pub subscription_prefix: String,

    #[serde(default = "default_dial_timeout", with = "humantime_serde")]
    pub dial_timeout: Duration,

    /// Minimum wallet balance required before dialing (entry side);
    /// zero disables the pre-flight check.
    #[serde(default)]
    pub min_balance: Amount,

    #[serde(default = "default_batch_size")]
    pub get_subscribers_batch_size: usize,

    /// Probe candidate bandwidth before connecting.
    #[serde(default)]
    pub measure_bandwidth: bool,

    /// Per-probe download budget.
    #[serde(default = "default_measure_bandwidth_timeout", with = "humantime_serde")]
    pub measure_bandwidth_timeout: Duration,

    /// Overall budget for the bandwidth stage.
    #[serde(
        default = "default_measure_bandwidth_workers_timeout",
        with = "humantime_serde"
    )]
    pub measure_bandwidth_workers_timeout: Duration,

    /// Bytes downloaded per bandwidth probe.
    #[serde(default = "default_measurement_bytes")]
    pub measurement_bytes_downlink: u32,

    /// Directory for favorite/avoid persistence; unset disables it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub measure_storage_path: Option<PathBuf>,

    /// Upper bound on measurement worker pools (0 keeps defaults).
    #[serde(default)]
    pub max_pool_size: usize,

    /// Role inversion: the exit dials out to the entry (NATed exits).
    #[serde(default)]
    pub reverse: bool,

    /// Explicit nano-pay transaction fee.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nano_pay_fee: Option<Amount>,

    #[serde(default = "default_min_nano_pay_fee")]
    pub min_nano_pay_fee: Amount,

    #[serde(default = "default_nano_pay_fee_percentage")]
    pub nano_pay_fee_percentage: f64,

    /// Wallet address receiving payments (exit side); empty means own.
    #[serde(default)]
    pub beneficiary_addr: String,

    /// Subscription lease requested when publishing, in blocks.
    #[serde(default = "default_subscription_duration")]
    pub subscription_duration: u64,

    /// Fee attached to subscribe transactions, capped by balance.
    #[serde(default)]
    pub subscription_fee: Amount,

    /// Replace a queued subscribe transaction instead of queueing another.
    #[serde(default)]
    pub subscription_replace_tx_pool: bool,
}

fn default_subscription_prefix() -> String {
    DEFAULT_SUBSCRIPTION_PREFIX.into()
}
fn default_dial_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_batch_size() -> usize {
    32
}
fn default_measure_bandwidth_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_measure_bandwidth_workers_timeout() -> Duration {
    Duration::from_secs(32)
}
fn default_measurement_bytes() -> u32 {
    1 << 20
}
fn default_min_nano_pay_fee() -> Amount {
    Amount::from_raw(1000)
}
fn default_nano_pay_fee_percentage() -> f64 {
    0.1
}
fn default_subscription_duration() -> u64 {
    100
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            subscription_prefix: default_subscription_prefix(),
            dial_timeout: default_dial_timeout(),
            min_balance: Amount::ZERO,
            get_subscribers_batch_size: default_batch_size(),
            measure_bandwidth: false,
            measure_bandwidth_timeout: default_measure_bandwidth_timeout(),
            measure_bandwidth_workers_timeout: default_measure_bandwidth_workers_timeout(),
            measurement_bytes_downlink: default_measurement_bytes(),
            measure_storage_path: None,
            max_pool_size: 0,
            reverse: false,
            nano_pay_fee: None,
            min_nano_pay_fee: default_min_nano_pay_fee(),
            nano_pay_fee_percentage: default_nano_pay_fee_percentage(),
            beneficiary_addr: String::new(),
            subscription_duration: default_subscription_duration(),
            subscription_fee: Amount::ZERO,
            subscription_replace_tx_pool: false,
        }
    }
}

/// Top-level configuration file structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,

    #[serde(default)]
    pub options: ServiceOptions,

    #[serde(default)]
    pub tunnel: TunnelConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("failed to read config: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("failed to serialize config: {e}")))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| Error::Config(format!("failed to write config: {e}")))?;

        Ok(())
    }

    /// Validate the parts that must fail at startup, not mid-connection.
    pub fn validate(&self) -> Result<()> {
        if self.service.name.is_empty() {
            return Err(Error::Config("service name is empty".into()));
        }
        self.service.encryption_algo()?;
        self.options
            .max_price
            .parse::<crate::types::Price>()
            .map_err(|e| Error::Config(format!("maxPrice: {e}")))?;
        if !self.options.listen_ip.is_empty()
            && self.options.listen_ip.parse::<std::net::IpAddr>().is_err()
        {
            return Err(Error::Config(format!(
                "invalid listenIP: {}",
                self.options.listen_ip
            )));
        }
        Ok(())
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (text or json).
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Enable colored output.
    #[serde(default = "default_color")]
    pub color: bool,
}

fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "text".into()
}
fn default_color() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            color: default_color(),
        }
    }
}

/// Initialize logging.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Config(format!("failed to init logging: {e}")))?;
    } else {
        subscriber
            .with(fmt::layer().with_ansi(config.color))
            .try_init()
            .map_err(|e| Error::Config(format!("failed to init logging: {e}")))?;
    }

    Ok(())
}

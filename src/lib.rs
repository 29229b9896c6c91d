//! # tollgate
//!
//! Decentralized paid tunneling between an **entry** (client side) and an
//! **exit** (server side) discovered through a pub/sub topic on a
//! decentralized name/messaging network. Exits advertise a service (a
//! bundle of forwarded TCP/UDP ports plus a price); entries pick the best
//! advertiser, establish an authenticated encrypted transport and pay per
//! MiB via streaming micropayments.
//!
//! ## Architecture
//!
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                 Port proxy / stream multiplexer                 │
//! ├──────────────────────────────┬──────────────────────────────────┤
//! │   Session (connect, pay,     │   Payment (nano-pay issuer,      │
//! │   reconnect, linger)         │   claimer, enforcement)          │
//! ├──────────────────────────────┴──────────────────────────────────┤
//! │        Discovery → Measurement (latency, bandwidth)             │
//! ├─────────────────────────────────────────────────────────────────┤
//! │   ConnWrap (TCP handshake)   │   UDPMux (per-peer codecs)       │
//! ├──────────────────────────────┴──────────────────────────────────┤
//! │        Codec (X25519 shared keys, XChaCha / AES-GCM)            │
//! └─────────────────────────────────────────────────────────────────┘
//!
//! The chain/messaging client, the stream multiplexer and the port-proxy
//! glue are collaborators behind traits; see [`directory`] and
//! [`payment`].

pub mod config;
pub mod crypto;
pub mod directory;
pub mod discovery;
pub mod error;
pub mod measure;
pub mod payment;
pub mod protocol;
pub mod publish;
pub mod session;
pub mod transport;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use types::{Amount, Price, TrafficCounters, TRAFFIC_UNIT};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::{Config, ServiceConfig, ServiceOptions, TunnelConfig};
    pub use crate::crypto::{EncryptionAlgo, PublicKey, SigningKeyPair};
    pub use crate::directory::DirectoryClient;
    pub use crate::discovery::{AddressFilter, IpFilter, Node};
    pub use crate::error::{Error, Result};
    pub use crate::protocol::{ConnectionMetadata, ServiceMetadata, StreamMetadata};
    pub use crate::session::{Linger, Tunnel};
    pub use crate::transport::{ConnWrapper, TunnelConn, UdpMux};
    pub use crate::types::{Amount, Price};
}

//! Tunnel transport: the authenticated TCP channel and the UDP datagram
//! mux that share one session key.

mod conn;
mod udp;

pub use conn::{ConnWrapper, EncryptedStream, TunnelConn};
pub use udp::{ReverseAccounting, UdpMux, UdpMuxConfig};

use std::time::Duration;

/// Absolute deadline for the connection handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Largest UDP payload the mux will send or receive.
pub const MAX_UDP_BUFFER_SIZE: usize = 65507;

/// How many copies of the UDP conn-metadata datagram are sent, to tolerate
/// loss before any retransmission layer exists.
pub const UDP_METADATA_REDUNDANCY: usize = 3;

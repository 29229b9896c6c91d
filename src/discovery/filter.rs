//! Candidate filtering: client-address allow-lists and IP/geo rules.

use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// A CIDR block, v4 or v6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    addr: IpAddr,
    prefix: u8,
}

impl Cidr {
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let bits = u32::from(self.prefix.min(32));
                let mask = if bits == 0 { 0 } else { u32::MAX << (32 - bits) };
                (u32::from(net) & mask) == (u32::from(ip) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let bits = u32::from(self.prefix.min(128));
                let mask = if bits == 0 {
                    0
                } else {
                    u128::MAX << (128 - bits)
                };
                (u128::from(net) & mask) == (u128::from(ip) & mask)
            }
            _ => false,
        }
    }
}

impl FromStr for Cidr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (addr_part, prefix_part) = match s.split_once('/') {
            Some((a, p)) => (a, Some(p)),
            None => (s, None),
        };
        let addr: IpAddr = addr_part
            .parse()
            .map_err(|_| Error::Config(format!("invalid CIDR: {s}")))?;
        let max = if addr.is_ipv4() { 32 } else { 128 };
        let prefix = match prefix_part {
            Some(p) => p
                .parse::<u8>()
                .ok()
                .filter(|&p| p <= max)
                .ok_or_else(|| Error::Config(format!("invalid CIDR prefix: {s}")))?,
            None => max,
        };
        Ok(Self { addr, prefix })
    }
}

impl std::fmt::Display for Cidr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

impl Serialize for Cidr {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Cidr {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Country-code lookup backing the geo rules (MaxMind-style database).
pub trait GeoProvider: Send + Sync {
    /// ISO 3166-1 alpha-2 country code for an address, if known.
    fn country_code(&self, ip: IpAddr) -> Option<String>;
}

/// IP-level candidate filter: CIDR allow/block lists plus country rules.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct IpFilter {
    #[serde(default)]
    pub allow: Vec<Cidr>,
    #[serde(default)]
    pub block: Vec<Cidr>,
    /// Only these country codes pass (empty: all).
    #[serde(default)]
    pub geo_allow: Vec<String>,
    /// These country codes are rejected.
    #[serde(default)]
    pub geo_block: Vec<String>,
    #[serde(skip)]
    provider: Option<Arc<dyn GeoProvider>>,
}

impl std::fmt::Debug for IpFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpFilter")
            .field("allow", &self.allow)
            .field("block", &self.block)
            .field("geo_allow", &self.geo_allow)
            .field("geo_block", &self.geo_block)
            .field("has_provider", &self.provider.is_some())
            .finish()
    }
}

impl IpFilter {
    /// Whether the geo rules need a data provider to be meaningful.
    pub fn needs_geo(&self) -> bool {
        !self.geo_allow.is_empty() || !self.geo_block.is_empty()
    }

    pub fn set_provider(&mut self, provider: Arc<dyn GeoProvider>) {
        self.provider = Some(provider);
    }

    pub fn allow_ip(&self, ip: IpAddr) -> bool {
        if self.block.iter().any(|c| c.contains(ip)) {
            return false;
        }
        if !self.allow.is_empty() && !self.allow.iter().any(|c| c.contains(ip)) {
            return false;
        }
        if self.needs_geo() {
            if let Some(provider) = &self.provider {
                match provider.country_code(ip) {
                    Some(code) => {
                        let code = code.to_ascii_uppercase();
                        if self.geo_block.iter().any(|c| c.eq_ignore_ascii_case(&code)) {
                            return false;
                        }
                        if !self.geo_allow.is_empty()
                            && !self.geo_allow.iter().any(|c| c.eq_ignore_ascii_case(&code))
                        {
                            return false;
                        }
                    }
                    // Unknown location only fails a positive allow rule.
                    None => {
                        if !self.geo_allow.is_empty() {
                            return false;
                        }
                    }
                }
            }
        }
        true
    }
}

/// One allow-list entry: a client address, optionally with pinned metadata
/// standing in for a subscription lookup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AddressEntry {
    pub address: String,
    #[serde(default)]
    pub metadata: Option<String>,
}

/// Allow-list over client addresses on the messaging network.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AddressFilter {
    #[serde(default)]
    pub allow: Vec<AddressEntry>,
}

impl AddressFilter {
    pub fn is_empty(&self) -> bool {
        self.allow.is_empty()
    }

    pub fn is_allowed(&self, address: &str) -> bool {
        self.allow.is_empty() || self.allow.iter().any(|e| e.address == address)
    }
}

//! Exit discovery: enumerate topic subscribers and filter candidates.
//!
//! Subscribers advertise under `subscription_prefix + service_name`. For
//! large topics the subscriber list is sampled through 256 one-byte
//! address prefixes in random order, bounded by an RPC budget, so repeated
//! discovery rounds see the whole population without ever fetching it in
//! one go.

mod filter;
mod storage;

pub use filter::{AddressEntry, AddressFilter, Cidr, GeoProvider, IpFilter};
pub use storage::{path_lock, AvoidNode, FavoriteNode, MeasureStorage};

use std::collections::HashMap;
use std::net::IpAddr;

use rand::seq::SliceRandom;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::directory::DirectoryClient;
use crate::error::{Error, Result};
use crate::protocol::ServiceMetadata;
use crate::types::Price;

/// Hard ceiling on directory RPCs spent per enumeration round.
pub const MAX_RPC_REQUESTS: usize = 8;

/// A discovered exit candidate.
#[derive(Debug, Clone)]
pub struct Node {
    /// Client address on the messaging network.
    pub address: String,
    pub metadata: ServiceMetadata,
    /// Raw base64 form, kept for favorite caching.
    pub metadata_raw: String,
    /// Measured TCP connect time in milliseconds.
    pub delay: Option<f32>,
    /// Measured downlink bandwidth in bytes per second.
    pub bandwidth: Option<f64>,
}

impl Node {
    pub fn new(address: String, metadata: ServiceMetadata, metadata_raw: String) -> Self {
        Self {
            address,
            metadata,
            metadata_raw,
            delay: None,
            bandwidth: None,
        }
    }
}

/// Enumerate subscribers of `topic` with their published metadata.
///
/// An explicit address allow-list short-circuits the topic RPCs: its
/// entries are the candidate set, with missing metadata fetched per
/// address. Otherwise the topic is sampled prefix-by-prefix and cached
/// favorites are merged in.
pub async fn enumerate_subscribers(
    client: &dyn DirectoryClient,
    topic: &str,
    batch_size: usize,
    address_filter: &AddressFilter,
    storage: Option<&MeasureStorage>,
) -> Result<HashMap<String, String>> {
    if !address_filter.is_empty() {
        let mut subscribers = HashMap::with_capacity(address_filter.allow.len());
        for entry in &address_filter.allow {
            match &entry.metadata {
                Some(meta) => {
                    subscribers.insert(entry.address.clone(), meta.clone());
                }
                None => match client.subscription(topic, &entry.address).await {
                    Ok(sub) if !sub.meta.is_empty() => {
                        subscribers.insert(entry.address.clone(), sub.meta);
                    }
                    Ok(_) => debug!(address = %entry.address, "allow-list entry not subscribed"),
                    Err(e) => warn!(address = %entry.address, "subscription lookup failed: {e}"),
                },
            }
        }
        if subscribers.is_empty() {
            return Err(Error::Directory(
                "none of the allow-listed addresses provides the service".into(),
            ));
        }
        return Ok(subscribers);
    }

    let total = client.subscribers_count(topic, None).await?;
    if total == 0 {
        return Err(Error::NoProviders(topic.to_string()));
    }

    let mut subscribers = HashMap::new();

    if total < batch_size {
        subscribers = client.subscribers(topic, 0, batch_size, None).await?;
    } else {
        let mut prefixes: Vec<u8> = (0..=255).collect();
        prefixes.shuffle(&mut rand::thread_rng());

        for (i, prefix) in prefixes.iter().enumerate() {
            let prefix = [*prefix];
            let count = client.subscribers_count(topic, Some(&prefix)).await?;

            if count > 0 {
                let pages = (count - 1) / batch_size + 1;
                let offset = rand::thread_rng().gen_range(0..pages);
                let page = client
                    .subscribers(topic, offset * batch_size, batch_size, Some(&prefix))
                    .await?;
                for (address, meta) in page {
                    subscribers.entry(address).or_insert(meta);
                }
                if subscribers.len() >= batch_size {
                    break;
                }
            }

            // Project the cost of filling the batch at the observed yield;
            // give up on the tail rather than blow the RPC budget.
            if i + MAX_RPC_REQUESTS < prefixes.len() {
                let yield_rate = (subscribers.len() + 1) as f64 / (i + 1) as f64;
                let projected =
                    batch_size.saturating_sub(subscribers.len()) as f64 / yield_rate;
                if projected > MAX_RPC_REQUESTS as f64 {
                    debug!(
                        collected = subscribers.len(),
                        "stopping enumeration: projected {projected:.0} RPCs over budget"
                    );
                    break;
                }
            }
        }
    }

    if let Some(storage) = storage {
        for favorite in storage.favorites() {
            info!(ip = %favorite.ip, "using favorite node");
            subscribers.insert(favorite.address, favorite.metadata);
        }
    }

    // An unlucky sample can come back empty even on a live topic; the
    // caller's retry loop handles that, unlike a zero total count above.
    Ok(subscribers)
}

/// Decode and filter enumerated subscribers into candidate nodes.
///
/// Drops: undecodable metadata, prices above the caller's maximum,
/// addresses rejected by the allow-list, IPs rejected by the IP/geo
/// filter, and IPs contained in any avoid CIDR.
pub fn filter_nodes(
    subscribers: HashMap<String, String>,
    max_price: Price,
    address_filter: &AddressFilter,
    ip_filter: &IpFilter,
    storage: Option<&MeasureStorage>,
) -> Vec<Node> {
    let avoid_cidrs = storage.map(|s| s.avoid_cidrs()).unwrap_or_default();
    let mut nodes = Vec::with_capacity(subscribers.len());

    for (address, metadata_raw) in subscribers {
        let metadata = match ServiceMetadata::decode(&metadata_raw) {
            Ok(m) => m,
            Err(e) => {
                warn!(%address, "couldn't decode metadata: {e}");
                continue;
            }
        };
        let price = match metadata.parse_price() {
            Ok(p) => p,
            Err(e) => {
                warn!(%address, "couldn't parse price: {e}");
                continue;
            }
        };
        if price.entry_to_exit > max_price.entry_to_exit
            || price.exit_to_entry > max_price.exit_to_entry
        {
            continue;
        }

        if !address_filter.is_allowed(&address) {
            continue;
        }

        let ip: IpAddr = match metadata.ip.parse() {
            Ok(ip) => ip,
            Err(_) => {
                warn!(%address, ip = %metadata.ip, "invalid advertised IP");
                continue;
            }
        };
        if !ip_filter.allow_ip(ip) {
            continue;
        }

        if let Some(cidr) = avoid_cidrs.iter().find(|c| c.contains(ip)) {
            debug!(%ip, %cidr, "rejecting avoided node");
            continue;
        }

        nodes.push(Node::new(address, metadata, metadata_raw));
    }

    nodes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Amount;

    fn metadata(ip: &str, price: &str) -> ServiceMetadata {
        ServiceMetadata {
            ip: ip.into(),
            tcp_port: 30020,
            udp_port: 30021,
            service_id: 0,
            service_tcp: vec![8080],
            service_udp: vec![],
            price: price.into(),
            beneficiary_addr: String::new(),
        }
    }

    fn subscribers(entries: &[(&str, &str, &str)]) -> HashMap<String, String> {
        entries
            .iter()
            .map(|(addr, ip, price)| {
                (addr.to_string(), metadata(ip, price).encode().unwrap())
            })
            .collect()
    }

    fn any_price() -> Price {
        Price {
            entry_to_exit: Amount::from_raw(i64::MAX),
            exit_to_entry: Amount::from_raw(i64::MAX),
        }
    }

    #[test]
    fn test_filter_by_price() {
        let subs = subscribers(&[
            ("cheap", "1.1.1.1", "0.001 0.001"),
            ("pricey", "2.2.2.2", "5 5"),
        ]);
        let max: Price = "0.01 0.01".parse().unwrap();
        let nodes = filter_nodes(
            subs,
            max,
            &AddressFilter::default(),
            &IpFilter::default(),
            None,
        );
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].address, "cheap");
    }

    #[test]
    fn test_filter_drops_bad_metadata() {
        let mut subs = subscribers(&[("good", "1.1.1.1", "0.001")]);
        subs.insert("broken".into(), "%%%".into());
        subs.insert(
            "bad-ip".into(),
            metadata("not-an-ip", "0.001").encode().unwrap(),
        );
        let nodes = filter_nodes(
            subs,
            any_price(),
            &AddressFilter::default(),
            &IpFilter::default(),
            None,
        );
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].address, "good");
    }

    #[test]
    fn test_filter_avoid_cidr_rejects_node() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = MeasureStorage::new(tmp.path(), "t");
        storage.load().unwrap();
        storage.add_avoid_node(AvoidNode {
            ip: "3.3.3.3".into(),
            address: "avoided".into(),
        });

        let subs = subscribers(&[
            ("kept", "1.1.1.1", "0.001"),
            ("avoided", "3.3.3.3", "0.001"),
        ]);
        let nodes = filter_nodes(
            subs,
            any_price(),
            &AddressFilter::default(),
            &IpFilter::default(),
            Some(&storage),
        );
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].address, "kept");
    }

    #[test]
    fn test_filter_address_allowlist() {
        let subs = subscribers(&[
            ("trusted", "1.1.1.1", "0.001"),
            ("stranger", "2.2.2.2", "0.001"),
        ]);
        let filter = AddressFilter {
            allow: vec![AddressEntry {
                address: "trusted".into(),
                metadata: None,
            }],
        };
        let nodes = filter_nodes(
            subs,
            any_price(),
            &filter,
            &IpFilter::default(),
            None,
        );
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].address, "trusted");
    }
}

//! Persisted measurement verdicts.
//!
//! Each subscription topic gets its own directory holding `favorite.json`
//! (nodes with a successful bandwidth measurement), `avoid.json` (nodes
//! whose probe failed) and an optional human-edited `avoid-cidr` list.
//! Favorite and avoid sets are exclusive by IP.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::filter::Cidr;
use crate::error::{Error, Result};

const FAVORITE_FILE: &str = "favorite.json";
const AVOID_FILE: &str = "avoid.json";
const AVOID_CIDR_FILE: &str = "avoid-cidr";

/// A node that passed a bandwidth measurement, with its cached metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FavoriteNode {
    pub ip: String,
    pub address: String,
    /// Base64 service metadata, reusable without a fresh RPC.
    pub metadata: String,
    /// Measured delay in milliseconds.
    pub delay: f32,
    /// Measured bandwidth window bounds in KB/s.
    pub min_bandwidth: f64,
    pub max_bandwidth: f64,
}

/// A node whose measurement failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvoidNode {
    pub ip: String,
    pub address: String,
}

/// Disk-backed favorite/avoid storage for one topic.
pub struct MeasureStorage {
    dir: PathBuf,
    favorites: RwLock<HashMap<String, FavoriteNode>>,
    avoid: RwLock<HashMap<String, AvoidNode>>,
    avoid_cidr: RwLock<Vec<Cidr>>,
}

impl MeasureStorage {
    /// Storage rooted at `<root>/<topic>/`.
    pub fn new(root: impl AsRef<Path>, topic: &str) -> Self {
        Self {
            dir: root.as_ref().join(topic),
            favorites: RwLock::new(HashMap::new()),
            avoid: RwLock::new(HashMap::new()),
            avoid_cidr: RwLock::new(Vec::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// (Re)load all three files, creating the directory on first use.
    pub fn load(&self) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| Error::Config(format!("create measure storage dir: {e}")))?;

        *self.favorites.write() = read_json_map(&self.dir.join(FAVORITE_FILE), |n: &FavoriteNode| {
            n.ip.clone()
        })?;
        *self.avoid.write() =
            read_json_map(&self.dir.join(AVOID_FILE), |n: &AvoidNode| n.ip.clone())?;

        let mut cidrs = Vec::new();
        match std::fs::read_to_string(self.dir.join(AVOID_CIDR_FILE)) {
            Ok(content) => {
                for line in content.lines() {
                    let line = line.trim();
                    if line.is_empty() || line.starts_with('#') {
                        continue;
                    }
                    match line.parse::<Cidr>() {
                        Ok(c) => cidrs.push(c),
                        Err(e) => warn!("skipping avoid-cidr line {line:?}: {e}"),
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::Config(format!("read avoid-cidr: {e}"))),
        }
        *self.avoid_cidr.write() = cidrs;
        Ok(())
    }

    /// Insert or refresh a favorite. Returns whether anything changed.
    /// The IP leaves the avoid set if it was there.
    pub fn add_favorite_node(&self, node: FavoriteNode) -> bool {
        self.avoid.write().remove(&node.ip);
        let mut favorites = self.favorites.write();
        match favorites.get(&node.ip) {
            Some(existing) if *existing == node => false,
            _ => {
                favorites.insert(node.ip.clone(), node);
                true
            }
        }
    }

    /// Insert a failed node. The IP leaves the favorite set if it was
    /// there.
    pub fn add_avoid_node(&self, node: AvoidNode) -> bool {
        self.favorites.write().remove(&node.ip);
        self.avoid
            .write()
            .insert(node.ip.clone(), node)
            .is_none()
    }

    pub fn favorites(&self) -> Vec<FavoriteNode> {
        self.favorites.read().values().cloned().collect()
    }

    pub fn is_avoided(&self, ip: &str) -> bool {
        self.avoid.read().contains_key(ip)
    }

    /// Avoid-CIDR blocks plus /32-equivalents of the avoid nodes.
    pub fn avoid_cidrs(&self) -> Vec<Cidr> {
        let mut cidrs = self.avoid_cidr.read().clone();
        for node in self.avoid.read().values() {
            if let Ok(ip) = node.ip.parse::<IpAddr>() {
                cidrs.push(format!("{ip}").parse().expect("host CIDR"));
            }
        }
        cidrs
    }

    pub fn save_favorites(&self) -> Result<()> {
        let nodes: Vec<FavoriteNode> = self.favorites.read().values().cloned().collect();
        write_json(&self.dir.join(FAVORITE_FILE), &nodes)
    }

    pub fn save_avoid_nodes(&self) -> Result<()> {
        let nodes: Vec<AvoidNode> = self.avoid.read().values().cloned().collect();
        write_json(&self.dir.join(AVOID_FILE), &nodes)
    }
}

fn read_json_map<T, K>(path: &Path, key: K) -> Result<HashMap<String, T>>
where
    T: serde::de::DeserializeOwned,
    K: Fn(&T) -> String,
{
    match std::fs::read(path) {
        Ok(raw) => {
            let items: Vec<T> = serde_json::from_slice(&raw)
                .map_err(|e| Error::Config(format!("parse {}: {e}", path.display())))?;
            Ok(items.into_iter().map(|n| (key(&n), n)).collect())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
        Err(e) => Err(Error::Config(format!("read {}: {e}", path.display()))),
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let raw = serde_json::to_vec_pretty(value)
        .map_err(|e| Error::Config(format!("serialize {}: {e}", path.display())))?;
    std::fs::write(path, raw)
        .map_err(|e| Error::Config(format!("write {}: {e}", path.display())))
}

/// One async lock per storage path.
///
/// Measurement runs sharing a storage directory serialize on this lock so
/// concurrent runs do not interleave their disk writes. Independent
/// directories measure concurrently.
pub fn path_lock(path: &Path) -> Arc<tokio::sync::Mutex<()>> {
    static LOCKS: OnceLock<parking_lot::Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>> =
        OnceLock::new();
    let locks = LOCKS.get_or_init(|| parking_lot::Mutex::new(HashMap::new()));
    locks
        .lock()
        .entry(path.to_path_buf())
        .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
        .clone()
}

//! Static peer directory loaded from a JSON file.
//!
//! File format:
//!
//! ```json
//! {
//!   "peers": [
//!     { "public_key": "<64 hex chars>", "address": "192.0.2.1:7654", "role": "darknet" }
//!   ]
//! }
//! ```
//!
//! Connect/disconnect notifications are logged; a real deployment would
//! feed them into its peer-management layer instead.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{info, warn};

use wr_link::{FailureReason, PeerDirectory, PeerInfo, PeerRole};

#[derive(Debug, Deserialize)]
struct PeersFile {
    peers: Vec<PeerEntry>,
}

#[derive(Debug, Deserialize)]
struct PeerEntry {
    public_key: String,
    address: SocketAddr,
    #[serde(default = "default_role")]
    role: String,
}

fn default_role() -> String {
    "darknet".to_string()
}

fn parse_role(role: &str) -> Result<PeerRole> {
    match role {
        "darknet" => Ok(PeerRole::Darknet),
        "opennet" => Ok(PeerRole::Opennet),
        "seed" => Ok(PeerRole::Seed),
        other => bail!("unknown peer role {other:?}"),
    }
}

pub struct StaticDirectory {
    peers: Mutex<HashMap<SocketAddr, PeerInfo>>,
}

impl StaticDirectory {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading peers file {}", path.display()))?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let file: PeersFile = serde_json::from_str(raw).context("parsing peers file")?;
        let mut peers = HashMap::new();
        for entry in file.peers {
            let key_bytes = hex::decode(&entry.public_key)
                .with_context(|| format!("peer {} public key", entry.address))?;
            let public_key: [u8; 32] = key_bytes
                .as_slice()
                .try_into()
                .map_err(|_| anyhow::anyhow!("peer {} public key must be 32 bytes", entry.address))?;
            peers.insert(
                entry.address,
                PeerInfo {
                    public_key,
                    address: entry.address,
                    role: parse_role(&entry.role)?,
                },
            );
        }
        Ok(Self {
            peers: Mutex::new(peers),
        })
    }

    pub fn all(&self) -> Vec<PeerInfo> {
        self.peers.lock().values().cloned().collect()
    }
}

impl PeerDirectory for StaticDirectory {
    fn lookup_by_address(&self, addr: &SocketAddr) -> Option<PeerInfo> {
        self.peers.lock().get(addr).cloned()
    }

    fn on_connected(&self, info: &PeerInfo, reference: &[u8]) {
        info!(
            peer = %info.address,
            reference_len = reference.len(),
            "peer connected"
        );
    }

    fn on_disconnected(&self, info: &PeerInfo, reason: &FailureReason) {
        warn!(peer = %info.address, %reason, "peer disconnected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_peers_with_roles() {
        let json = r#"{
            "peers": [
                { "public_key": "1111111111111111111111111111111111111111111111111111111111111111",
                  "address": "192.0.2.1:7654", "role": "opennet" },
                { "public_key": "2222222222222222222222222222222222222222222222222222222222222222",
                  "address": "192.0.2.2:7654" }
            ]
        }"#;
        let dir = StaticDirectory::from_json(json).unwrap();
        let addr: SocketAddr = "192.0.2.1:7654".parse().unwrap();
        let info = dir.lookup_by_address(&addr).unwrap();
        assert_eq!(info.role, PeerRole::Opennet);
        assert_eq!(info.public_key, [0x11; 32]);

        let addr2: SocketAddr = "192.0.2.2:7654".parse().unwrap();
        assert_eq!(dir.lookup_by_address(&addr2).unwrap().role, PeerRole::Darknet);
        assert_eq!(dir.all().len(), 2);
    }

    #[test]
    fn rejects_bad_key_and_role() {
        let short_key = r#"{ "peers": [
            { "public_key": "abcd", "address": "192.0.2.1:1" } ] }"#;
        assert!(StaticDirectory::from_json(short_key).is_err());

        let bad_role = r#"{ "peers": [
            { "public_key": "1111111111111111111111111111111111111111111111111111111111111111",
              "address": "192.0.2.1:1", "role": "friend" } ] }"#;
        assert!(StaticDirectory::from_json(bad_role).is_err());
    }
}

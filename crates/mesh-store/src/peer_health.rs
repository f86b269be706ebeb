use crate::fsutil::{atomic_write_json, load_json_or};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Probe result for one peer.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PeerHealth {
    pub ip: String,
    pub port: u16,
    pub last_probe: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    pub reachable: bool,
    pub consecutive_failures: u32,
}

/// Probe results per peer, persisted to `state/peer-health.json`.
pub struct PeerHealthStore {
    path: PathBuf,
    peers: BTreeMap<String, PeerHealth>,
}

impl PeerHealthStore {
    pub fn load(path: &Path) -> Result<Self> {
        let peers = load_json_or(path, BTreeMap::new)?;
        Ok(Self {
            path: path.to_path_buf(),
            peers,
        })
    }

    /// Record a successful probe.
    pub fn record_up(
        &mut self,
        name: &str,
        ip: &str,
        port: u16,
        http_code: Option<u16>,
        latency_ms: u64,
        now_ms: u64,
    ) -> Result<()> {
        self.peers.insert(
            name.to_string(),
            PeerHealth {
                ip: ip.to_string(),
                port,
                last_probe: now_ms,
                http_code,
                latency_ms: Some(latency_ms),
                reachable: true,
                consecutive_failures: 0,
            },
        );
        self.save()
    }

    /// Record a failed probe, preserving the failure streak.
    pub fn record_down(&mut self, name: &str, ip: &str, port: u16, now_ms: u64) -> Result<()> {
        let entry = self.peers.entry(name.to_string()).or_default();
        entry.ip = ip.to_string();
        entry.port = port;
        entry.last_probe = now_ms;
        entry.http_code = None;
        entry.latency_ms = None;
        entry.reachable = false;
        entry.consecutive_failures += 1;
        self.save()
    }

    pub fn get(&self, name: &str) -> Option<&PeerHealth> {
        self.peers.get(name)
    }

    pub fn is_reachable(&self, name: &str) -> bool {
        self.peers.get(name).map(|p| p.reachable).unwrap_or(false)
    }

    pub fn snapshot(&self) -> &BTreeMap<String, PeerHealth> {
        &self.peers
    }

    /// `(up, down, total)` across every probed peer.
    pub fn counts(&self) -> (usize, usize, usize) {
        let up = self.peers.values().filter(|p| p.reachable).count();
        let total = self.peers.len();
        (up, total - up, total)
    }

    fn save(&self) -> Result<()> {
        atomic_write_json(&self.path, &self.peers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn up_resets_failure_streak() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peer-health.json");
        let mut store = PeerHealthStore::load(&path).unwrap();

        store.record_down("bravo", "10.0.0.2", 8900, 1000).unwrap();
        store.record_down("bravo", "10.0.0.2", 8900, 2000).unwrap();
        assert_eq!(store.get("bravo").unwrap().consecutive_failures, 2);
        assert!(!store.is_reachable("bravo"));

        store
            .record_up("bravo", "10.0.0.2", 8900, Some(200), 12, 3000)
            .unwrap();
        let health = store.get("bravo").unwrap();
        assert_eq!(health.consecutive_failures, 0);
        assert_eq!(health.latency_ms, Some(12));
        assert!(store.is_reachable("bravo"));
    }

    #[test]
    fn counts_split_up_down() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peer-health.json");
        let mut store = PeerHealthStore::load(&path).unwrap();
        store
            .record_up("bravo", "10.0.0.2", 8900, Some(200), 5, 1000)
            .unwrap();
        store.record_down("charlie", "10.0.0.3", 8900, 1000).unwrap();
        assert_eq!(store.counts(), (1, 1, 2));
    }

    #[test]
    fn persistence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peer-health.json");
        {
            let mut store = PeerHealthStore::load(&path).unwrap();
            store
                .record_up("bravo", "10.0.0.2", 8900, Some(200), 8, 1000)
                .unwrap();
        }
        let store = PeerHealthStore::load(&path).unwrap();
        assert!(store.is_reachable("bravo"));
    }
}

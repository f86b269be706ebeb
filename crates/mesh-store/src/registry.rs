use crate::fsutil::{atomic_write_json, load_json_or};
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Role a peer plays in the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    Hub,
    Relay,
    /// Operations peer, preferred relay candidate during election.
    Sre,
    #[default]
    Peer,
}

/// One entry in the peer directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Peer {
    pub ip: String,
    pub port: u16,
    pub token: String,
    #[serde(default)]
    pub role: PeerRole,
    #[serde(default = "default_hook_path")]
    pub hook_path: String,
    #[serde(default)]
    pub signing: bool,
}

fn default_hook_path() -> String {
    "/hooks".to_string()
}

impl Peer {
    /// Base URL for this peer's webhook server.
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.ip, self.port)
    }

    /// Hook URL a given sender posts to on this peer.
    pub fn hook_url(&self, sender: &str) -> String {
        format!("{}{}/{}", self.base_url(), self.hook_path, sender)
    }

    /// The generic session-routing endpoint on this peer.
    pub fn agent_hook_url(&self) -> String {
        self.hook_url("agent")
    }

    /// Liveness endpoint probed by discovery.
    pub fn status_url(&self) -> String {
        format!("{}/api/status", self.base_url())
    }
}

/// On-disk registry shape: `{"agents": {name: peer}}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    agents: BTreeMap<String, Peer>,
}

/// Peer directory plus self identity, loaded from `config/`.
pub struct Registry {
    identity_path: PathBuf,
    registry_path: PathBuf,
    self_name: String,
    agents: BTreeMap<String, Peer>,
}

impl Registry {
    /// Load identity and peer directory from their config files.
    pub fn load(identity_path: &Path, registry_path: &Path) -> Result<Self> {
        let self_name = std::fs::read_to_string(identity_path)
            .with_context(|| format!("failed to read identity {}", identity_path.display()))?
            .trim()
            .to_string();
        if self_name.is_empty() {
            bail!("identity file {} is empty", identity_path.display());
        }
        let file: RegistryFile = load_json_or(registry_path, RegistryFile::default)?;
        Ok(Self {
            identity_path: identity_path.to_path_buf(),
            registry_path: registry_path.to_path_buf(),
            self_name,
            agents: file.agents,
        })
    }

    /// Create the identity and registry files for a fresh node.
    pub fn init(identity_path: &Path, registry_path: &Path, self_name: &str) -> Result<Self> {
        crate::fsutil::atomic_write_bytes(identity_path, format!("{self_name}\n").as_bytes())?;
        let file = RegistryFile::default();
        atomic_write_json(registry_path, &file)?;
        Self::load(identity_path, registry_path)
    }

    pub fn self_name(&self) -> &str {
        &self.self_name
    }

    /// This node's own registry entry, when the operator has listed it.
    pub fn self_peer(&self) -> Option<&Peer> {
        self.agents.get(&self.self_name)
    }

    pub fn peer(&self, name: &str) -> Option<&Peer> {
        self.agents.get(name)
    }

    /// All peers, self included, in name order.
    pub fn peers(&self) -> impl Iterator<Item = (&String, &Peer)> {
        self.agents.iter()
    }

    /// Names of every peer other than self.
    pub fn other_names(&self) -> Vec<String> {
        self.agents
            .keys()
            .filter(|name| **name != self.self_name)
            .cloned()
            .collect()
    }

    /// Whether the send pipeline must sign envelopes for this target.
    pub fn is_signing(&self, name: &str) -> bool {
        self.agents.get(name).map(|p| p.signing).unwrap_or(false)
    }

    /// The hub: the entry with role `hub`, else the lexically first non-self
    /// peer.
    pub fn hub(&self) -> Option<(&String, &Peer)> {
        self.agents
            .iter()
            .find(|(_, p)| p.role == PeerRole::Hub)
            .or_else(|| {
                self.agents
                    .iter()
                    .find(|(name, _)| **name != self.self_name)
            })
    }

    /// Add or update a peer entry and persist. Used by `discover join`.
    pub fn upsert(&mut self, name: &str, peer: Peer) -> Result<()> {
        self.agents.insert(name.to_string(), peer);
        self.save()
    }

    pub fn remove(&mut self, name: &str) -> Result<()> {
        if self.agents.remove(name).is_none() {
            bail!("unknown peer: {name}");
        }
        self.save()
    }

    fn save(&self) -> Result<()> {
        let file = RegistryFile {
            agents: self.agents.clone(),
        };
        atomic_write_json(&self.registry_path, &file)
    }

    pub fn identity_path(&self) -> &Path {
        &self.identity_path
    }
}

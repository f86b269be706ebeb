use crate::fsutil::{atomic_write_json, load_json_or};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Mesh-wide reachability summary as seen from this node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshHealth {
    pub up: usize,
    pub down: usize,
    pub total: usize,
}

/// This node's local view of message routing. Purely local: every node
/// reaches its own view, no consensus is attempted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingTable {
    #[serde(rename = "self")]
    pub self_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hub: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relay: Option<String>,
    #[serde(default)]
    pub mesh_health: MeshHealth,
    pub last_updated: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_election: Option<u64>,
}

/// Routing table accessor over `state/routing-table.json`.
pub struct RoutingStore {
    path: PathBuf,
    table: RoutingTable,
}

impl RoutingStore {
    pub fn load(path: &Path, self_name: &str) -> Result<Self> {
        let mut table: RoutingTable = load_json_or(path, RoutingTable::default)?;
        table.self_name = self_name.to_string();
        Ok(Self {
            path: path.to_path_buf(),
            table,
        })
    }

    pub fn get(&self) -> &RoutingTable {
        &self.table
    }

    /// The elected relay, if any and not the given name. Used by the send
    /// pipeline to skip relaying to the unreachable target itself.
    pub fn relay_for(&self, target: &str) -> Option<&str> {
        self.table
            .relay
            .as_deref()
            .filter(|relay| *relay != target && *relay != self.table.self_name)
    }

    pub fn update(
        &mut self,
        hub: Option<String>,
        relay: Option<String>,
        health: MeshHealth,
        now_ms: u64,
        elected: bool,
    ) -> Result<()> {
        self.table.hub = hub;
        self.table.relay = relay;
        self.table.mesh_health = health;
        self.table.last_updated = now_ms;
        if elected {
            self.table.last_election = Some(now_ms);
        }
        self.save()
    }

    fn save(&self) -> Result<()> {
        atomic_write_json(&self.path, &self.table)
    }
}

use crate::fsutil::{atomic_write_json, load_json_or};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Lifetime drain counters, persisted to `state/queue-state.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub total_replayed: u64,
    pub total_purged: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_drain: Option<u64>,
}

pub struct QueueStatsStore {
    path: PathBuf,
    stats: QueueStats,
}

impl QueueStatsStore {
    pub fn load(path: &Path) -> Result<Self> {
        let stats = load_json_or(path, QueueStats::default)?;
        Ok(Self {
            path: path.to_path_buf(),
            stats,
        })
    }

    pub fn get(&self) -> &QueueStats {
        &self.stats
    }

    pub fn record_drain(&mut self, replayed: u64, purged: u64, now_ms: u64) -> Result<()> {
        self.stats.total_replayed += replayed;
        self.stats.total_purged += purged;
        self.stats.last_drain = Some(now_ms);
        atomic_write_json(&self.path, &self.stats)
    }
}

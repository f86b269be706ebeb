use crate::fsutil::{atomic_write_json, load_json_or};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Consecutive failures that trip a circuit open.
pub const TRIP_THRESHOLD: u32 = 3;

/// How long an open circuit stays open before allowing a probe.
pub const COOLDOWN_MS: u64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

/// Per-peer breaker record, persisted as-is.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CircuitRecord {
    pub state: CircuitState,
    pub failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_until: Option<u64>,
}

/// What the send pipeline is allowed to do right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitDecision {
    /// Circuit closed, send normally.
    Allow,
    /// Cooldown elapsed; circuit moved to half-open, one probe allowed.
    AllowProbe,
    /// Circuit open, short-circuit to the dead-letter queue.
    Block,
}

/// Per-peer circuit breakers backed by `state/circuit-breakers.json`.
pub struct CircuitStore {
    path: PathBuf,
    circuits: BTreeMap<String, CircuitRecord>,
}

impl CircuitStore {
    pub fn load(path: &Path) -> Result<Self> {
        let circuits = load_json_or(path, BTreeMap::new)?;
        Ok(Self {
            path: path.to_path_buf(),
            circuits,
        })
    }

    /// Consult the breaker before a send. An open circuit whose cooldown has
    /// elapsed transitions to half-open and admits a single probe.
    pub fn check(&mut self, peer: &str, now_ms: u64) -> Result<CircuitDecision> {
        let record = self.circuits.entry(peer.to_string()).or_default();
        match record.state {
            CircuitState::Closed => Ok(CircuitDecision::Allow),
            CircuitState::HalfOpen => Ok(CircuitDecision::AllowProbe),
            CircuitState::Open => {
                if record.open_until.map(|t| t <= now_ms).unwrap_or(true) {
                    record.state = CircuitState::HalfOpen;
                    self.save()?;
                    Ok(CircuitDecision::AllowProbe)
                } else {
                    Ok(CircuitDecision::Block)
                }
            }
        }
    }

    /// A delivery succeeded: reset to closed with zero failures.
    pub fn record_success(&mut self, peer: &str) -> Result<()> {
        let record = self.circuits.entry(peer.to_string()).or_default();
        record.state = CircuitState::Closed;
        record.failures = 0;
        record.open_until = None;
        self.save()
    }

    /// A delivery failed: count it, trip open past the threshold. A failed
    /// half-open probe re-opens immediately with a fresh cooldown.
    pub fn record_failure(&mut self, peer: &str, now_ms: u64) -> Result<CircuitState> {
        let record = self.circuits.entry(peer.to_string()).or_default();
        record.failures += 1;
        record.last_failure = Some(now_ms);
        if record.state == CircuitState::HalfOpen || record.failures >= TRIP_THRESHOLD {
            record.state = CircuitState::Open;
            record.open_until = Some(now_ms + COOLDOWN_MS);
        }
        let state = record.state;
        self.save()?;
        Ok(state)
    }

    pub fn get(&self, peer: &str) -> Option<&CircuitRecord> {
        self.circuits.get(peer)
    }

    pub fn snapshot(&self) -> &BTreeMap<String, CircuitRecord> {
        &self.circuits
    }

    fn save(&self) -> Result<()> {
        atomic_write_json(&self.path, &self.circuits)
    }
}

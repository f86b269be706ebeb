use crate::fsutil::{atomic_write_json, load_json_or};
use anyhow::Result;
use mesh_proto::envelope::Envelope;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default bound on the dead-letter queue.
pub const DEFAULT_MAX_QUEUE: usize = 100;

/// One undeliverable envelope awaiting replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub id: String,
    pub timestamp: String,
    pub to: String,
    pub fail_reason: String,
    pub attempts: u32,
    pub envelope: Envelope,
}

/// On-disk shape kept dashboard-compatible: `{"messages": [...]}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct DeadLetterFile {
    #[serde(default)]
    messages: Vec<DeadLetter>,
    #[serde(default)]
    dropped_overflow: u64,
}

/// Bounded FIFO of failed deliveries, oldest dropped on overflow.
pub struct DeadLetterStore {
    path: PathBuf,
    messages: Vec<DeadLetter>,
    dropped_overflow: u64,
    max_queue: usize,
}

impl DeadLetterStore {
    pub fn load(path: &Path) -> Result<Self> {
        Self::load_with_capacity(path, DEFAULT_MAX_QUEUE)
    }

    pub fn load_with_capacity(path: &Path, max_queue: usize) -> Result<Self> {
        let file: DeadLetterFile = load_json_or(path, DeadLetterFile::default)?;
        let mut store = Self {
            path: path.to_path_buf(),
            messages: file.messages,
            dropped_overflow: file.dropped_overflow,
            max_queue,
        };
        if store.messages.len() > max_queue {
            let excess = store.messages.len() - max_queue;
            store.messages.drain(..excess);
            store.dropped_overflow += excess as u64;
            store.save()?;
        }
        Ok(store)
    }

    /// Queue an envelope for later replay. Drops the oldest entry first when
    /// at capacity; the drop is logged, never silent.
    pub fn push(&mut self, envelope: Envelope, fail_reason: &str, attempts: u32) -> Result<()> {
        while self.messages.len() >= self.max_queue {
            let dropped = self.messages.remove(0);
            self.dropped_overflow += 1;
            tracing::warn!(
                id = %dropped.id,
                to = %dropped.to,
                "dead-letter queue full, dropping oldest"
            );
        }
        self.messages.push(DeadLetter {
            id: envelope.id.clone(),
            timestamp: envelope.timestamp.clone(),
            to: envelope.to.clone(),
            fail_reason: fail_reason.to_string(),
            attempts,
            envelope,
        });
        self.save()
    }

    /// Remove a replayed entry by message id. Returns whether it was present.
    pub fn remove(&mut self, id: &str) -> Result<bool> {
        let before = self.messages.len();
        self.messages.retain(|m| m.id != id);
        let removed = self.messages.len() != before;
        if removed {
            self.save()?;
        }
        Ok(removed)
    }

    /// Drop every entry whose envelope has outlived its TTL. Returns the ids
    /// purged.
    pub fn purge_expired(&mut self, now_ms: u64) -> Result<Vec<String>> {
        let purged: Vec<String> = self
            .messages
            .iter()
            .filter(|m| m.envelope.is_expired(now_ms))
            .map(|m| m.id.clone())
            .collect();
        if !purged.is_empty() {
            self.messages.retain(|m| !m.envelope.is_expired(now_ms));
            self.save()?;
        }
        Ok(purged)
    }

    /// Clear the queue entirely (`queue purge`). Returns how many were
    /// dropped.
    pub fn purge_all(&mut self) -> Result<usize> {
        let count = self.messages.len();
        self.messages.clear();
        self.save()?;
        Ok(count)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn snapshot(&self) -> &[DeadLetter] {
        &self.messages
    }

    /// Total entries ever dropped to make room.
    pub fn dropped_overflow(&self) -> u64 {
        self.dropped_overflow
    }

    fn save(&self) -> Result<()> {
        let file = DeadLetterFile {
            messages: self.messages.clone(),
            dropped_overflow: self.dropped_overflow,
        };
        atomic_write_json(&self.path, &file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_proto::envelope::MessageType;

    fn envelope(to: &str) -> Envelope {
        Envelope::new("alpha", to, MessageType::Notification, "subj", "body")
    }

    fn store(dir: &Path, cap: usize) -> DeadLetterStore {
        DeadLetterStore::load_with_capacity(&dir.join("dead-letters.json"), cap).unwrap()
    }

    #[test]
    fn push_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let mut dl = store(dir.path(), 10);
        let env = envelope("bravo");
        let id = env.id.clone();
        dl.push(env, "connect_refused", 4).unwrap();
        assert_eq!(dl.len(), 1);
        assert_eq!(dl.snapshot()[0].fail_reason, "connect_refused");

        assert!(dl.remove(&id).unwrap());
        assert!(!dl.remove(&id).unwrap());
        assert!(dl.is_empty());
    }

    #[test]
    fn fifo_bound_drops_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let mut dl = store(dir.path(), 3);
        let first = envelope("bravo");
        let first_id = first.id.clone();
        dl.push(first, "x", 1).unwrap();
        for _ in 0..3 {
            dl.push(envelope("bravo"), "x", 1).unwrap();
        }
        assert_eq!(dl.len(), 3);
        assert!(dl.snapshot().iter().all(|m| m.id != first_id));
        assert_eq!(dl.dropped_overflow(), 1);
    }

    #[test]
    fn purge_expired_removes_only_stale() {
        let dir = tempfile::tempdir().unwrap();
        let mut dl = store(dir.path(), 10);

        let mut stale = envelope("bravo");
        stale.ttl = 1;
        let stale_id = stale.id.clone();
        let stale_ts = mesh_proto::time::parse_iso(&stale.timestamp).unwrap();
        dl.push(stale, "x", 1).unwrap();
        dl.push(envelope("bravo"), "x", 1).unwrap();

        let purged = dl.purge_expired(stale_ts + 2000).unwrap();
        assert_eq!(purged, vec![stale_id]);
        assert_eq!(dl.len(), 1);
        // Invariant: nothing expired remains after a purge pass.
        assert!(
            dl.snapshot()
                .iter()
                .all(|m| !m.envelope.is_expired(stale_ts + 2000))
        );
    }

    #[test]
    fn persistence() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut dl = store(dir.path(), 10);
            dl.push(envelope("bravo"), "circuit_open", 0).unwrap();
        }
        let dl = store(dir.path(), 10);
        assert_eq!(dl.len(), 1);
        assert_eq!(dl.snapshot()[0].to, "bravo");
    }

    #[test]
    fn file_shape_has_messages_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut dl = store(dir.path(), 10);
        dl.push(envelope("bravo"), "x", 1).unwrap();
        let raw = std::fs::read_to_string(dir.path().join("dead-letters.json")).unwrap();
        let v: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert!(v["messages"].is_array());
    }
}

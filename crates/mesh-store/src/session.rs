use crate::fsutil::{atomic_write_json, load_json_or};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Ring bound on messages kept per session.
pub const DEFAULT_MAX_MESSAGES: usize = 50;

/// Sessions older than this with no activity are closed by cleanup.
pub const DEFAULT_IDLE_TTL_MS: u64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Closed,
}

/// Direction of a message relative to this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionDirection {
    Inbound,
    Outbound,
}

/// One message retained in a session's ring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMessage {
    pub from: String,
    pub to: String,
    pub body: String,
    pub ts: String,
    pub direction: SessionDirection,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

/// Durable shared-context channel across two or more agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_key: String,
    pub created: String,
    pub last_activity: u64,
    pub status: SessionStatus,
    #[serde(default)]
    pub participants: Vec<String>,
    #[serde(default)]
    pub messages: Vec<SessionMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

impl SessionRecord {
    pub fn new(session_key: &str, now_ms: u64) -> Self {
        Self {
            session_key: session_key.to_string(),
            created: mesh_proto::time::iso_ms(now_ms),
            last_activity: now_ms,
            status: SessionStatus::Active,
            participants: Vec::new(),
            messages: Vec::new(),
            label: None,
            user: None,
        }
    }

    /// Track a participant, keeping the list duplicate-free.
    pub fn add_participant(&mut self, name: &str) {
        if !self.participants.iter().any(|p| p == name) {
            self.participants.push(name.to_string());
        }
    }

    /// The most recent `n` messages.
    pub fn tail(&self, n: usize) -> &[SessionMessage] {
        let start = self.messages.len().saturating_sub(n);
        &self.messages[start..]
    }
}

/// Session files under `sessions/{sanitizedKey}.json`, each a ring of the
/// most recent messages.
pub struct SessionStore {
    dir: PathBuf,
    max_messages: usize,
}

impl SessionStore {
    pub fn new(dir: PathBuf) -> Self {
        Self::with_capacity(dir, DEFAULT_MAX_MESSAGES)
    }

    pub fn with_capacity(dir: PathBuf, max_messages: usize) -> Self {
        Self { dir, max_messages }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize_key(key)))
    }

    /// Load a session, creating a fresh record on first sight of the key.
    pub fn get_or_create(&self, key: &str, now_ms: u64) -> Result<SessionRecord> {
        let path = self.path_for(key);
        if path.exists() {
            return load_json_or(&path, || unreachable!());
        }
        Ok(SessionRecord::new(key, now_ms))
    }

    pub fn get(&self, key: &str) -> Result<Option<SessionRecord>> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(load_json_or(&path, || unreachable!())?))
    }

    /// Append one message to a session's ring and persist, evicting the
    /// oldest entries past the bound.
    pub fn append(
        &self,
        key: &str,
        message: SessionMessage,
        participants: &[&str],
        now_ms: u64,
    ) -> Result<SessionRecord> {
        let mut record = self.get_or_create(key, now_ms)?;
        for p in participants {
            record.add_participant(p);
        }
        record.messages.push(message);
        if record.messages.len() > self.max_messages {
            let excess = record.messages.len() - self.max_messages;
            record.messages.drain(..excess);
        }
        record.last_activity = now_ms;
        record.status = SessionStatus::Active;
        self.save(&record)?;
        Ok(record)
    }

    pub fn save(&self, record: &SessionRecord) -> Result<()> {
        atomic_write_json(&self.path_for(&record.session_key), record)
    }

    pub fn list(&self) -> Result<Vec<SessionRecord>> {
        let mut records = Vec::new();
        if !self.dir.exists() {
            return Ok(records);
        }
        for entry in std::fs::read_dir(&self.dir)
            .with_context(|| format!("failed to read {}", self.dir.display()))?
        {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match load_json_or(&path, || unreachable!()) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!(path = %path.display(), err = %e, "skipping unreadable session file");
                }
            }
        }
        records.sort_by(|a, b| a.session_key.cmp(&b.session_key));
        Ok(records)
    }

    /// Close sessions idle past the TTL. Returns the keys closed.
    pub fn close_idle(&self, idle_ttl_ms: u64, now_ms: u64) -> Result<Vec<String>> {
        let mut closed = Vec::new();
        for mut record in self.list()? {
            if record.status == SessionStatus::Active
                && record.last_activity + idle_ttl_ms < now_ms
            {
                record.status = SessionStatus::Closed;
                self.save(&record)?;
                closed.push(record.session_key.clone());
            }
        }
        Ok(closed)
    }
}

/// Session keys come from the wire; keep only filesystem-safe characters.
pub fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(from: &str, body: &str) -> SessionMessage {
        SessionMessage {
            from: from.to_string(),
            to: "alpha".to_string(),
            body: body.to_string(),
            ts: mesh_proto::time::iso_ms(1_000_000),
            direction: SessionDirection::Inbound,
            message_id: None,
        }
    }

    #[test]
    fn append_creates_and_tracks_participants() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().to_path_buf());
        let rec = store
            .append("ops-room", msg("bravo", "hi"), &["alpha", "bravo"], 1_000_000)
            .unwrap();
        assert_eq!(rec.participants, vec!["alpha", "bravo"]);
        assert_eq!(rec.messages.len(), 1);
        assert_eq!(rec.status, SessionStatus::Active);

        // Participants stay deduplicated.
        let rec = store
            .append("ops-room", msg("bravo", "again"), &["bravo"], 1_001_000)
            .unwrap();
        assert_eq!(rec.participants, vec!["alpha", "bravo"]);
    }

    #[test]
    fn ring_bound_evicts_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::with_capacity(dir.path().to_path_buf(), 3);
        for i in 0..5 {
            store
                .append("k", msg("bravo", &format!("m{i}")), &[], 1_000_000 + i)
                .unwrap();
        }
        let rec = store.get("k").unwrap().unwrap();
        assert_eq!(rec.messages.len(), 3);
        assert_eq!(rec.messages[0].body, "m2");
        assert_eq!(rec.tail(2)[0].body, "m3");
    }

    #[test]
    fn keys_are_sanitized_for_paths() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().to_path_buf());
        store
            .append("../sneaky/key", msg("bravo", "hi"), &[], 1_000_000)
            .unwrap();
        assert!(dir.path().join(".._sneaky_key.json").exists());
        // Round-trips through the same sanitization.
        assert!(store.get("../sneaky/key").unwrap().is_some());
    }

    #[test]
    fn idle_sessions_close() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().to_path_buf());
        store.append("old", msg("bravo", "hi"), &[], 1_000).unwrap();
        store
            .append("fresh", msg("bravo", "hi"), &[], 10_000_000)
            .unwrap();

        let closed = store
            .close_idle(DEFAULT_IDLE_TTL_MS, 1_000 + DEFAULT_IDLE_TTL_MS + 1)
            .unwrap();
        assert_eq!(closed, vec!["old".to_string()]);
        assert_eq!(
            store.get("fresh").unwrap().unwrap().status,
            SessionStatus::Active
        );
    }
}

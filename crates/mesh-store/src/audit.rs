use crate::fsutil::append_jsonl;
use anyhow::{Context, Result};
use mesh_proto::envelope::Envelope;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

/// One audit line: the authoritative record of what happened to a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub ts: String,
    pub from: String,
    pub to: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    pub subject: String,
    pub body: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_context: Option<Value>,
    pub signed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
}

impl AuditEntry {
    /// Build an entry from an envelope and outcome status. Bodies are
    /// truncated so the log line stays a line.
    pub fn from_envelope(envelope: &Envelope, status: &str) -> Self {
        Self {
            ts: mesh_proto::time::now_iso(),
            from: envelope.from.clone(),
            to: envelope.to.clone(),
            kind: envelope.kind.as_str().to_string(),
            id: envelope.id.clone(),
            subject: envelope.payload.subject.clone(),
            body: truncate(&envelope.payload.body, 500),
            status: status.to_string(),
            correlation_id: envelope.correlation_id.clone(),
            conversation_id: envelope.conversation_id.clone(),
            reply_context: envelope.reply_context.clone(),
            signed: envelope.signature.is_some(),
            session: envelope.session.as_ref().map(|s| s.key.clone()),
        }
    }
}

/// Append-only JSONL audit log. Rotation is an operator concern.
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn append(&self, entry: &AuditEntry) -> Result<()> {
        append_jsonl(&self.path, entry)
    }

    /// Convenience: build from envelope + status and append.
    pub fn record(&self, envelope: &Envelope, status: &str) -> Result<()> {
        self.append(&AuditEntry::from_envelope(envelope, status))
    }

    /// The most recent `n` entries, oldest first. Unparseable lines are
    /// skipped, not fatal.
    pub fn tail(&self, n: usize) -> Result<Vec<AuditEntry>> {
        read_tail(&self.path, n)
    }
}

/// Generic JSONL log for operational records (queue replays, discovery).
pub struct OpsLog {
    path: PathBuf,
}

impl OpsLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn append<T: Serialize>(&self, entry: &T) -> Result<()> {
        append_jsonl(&self.path, entry)
    }

    pub fn tail(&self, n: usize) -> Result<Vec<Value>> {
        read_tail(&self.path, n)
    }
}

fn read_tail<T: serde::de::DeserializeOwned>(path: &Path, n: usize) -> Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let entries: Vec<T> = data
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect();
    let start = entries.len().saturating_sub(n);
    Ok(entries.into_iter().skip(start).collect())
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_proto::envelope::MessageType;

    #[test]
    fn record_and_tail() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path().join("mesh-audit.jsonl"));
        let env = Envelope::new("alpha", "bravo", MessageType::Notification, "s1", "b1");
        log.record(&env, "sent").unwrap();
        let env2 = Envelope::new("bravo", "alpha", MessageType::Notification, "s2", "b2");
        log.record(&env2, "received").unwrap();

        let entries = log.tail(10).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].status, "sent");
        assert_eq!(entries[1].status, "received");
        assert!(!entries[0].signed);

        let last = log.tail(1).unwrap();
        assert_eq!(last[0].id, env2.id);
    }

    #[test]
    fn entry_mirrors_envelope_fields() {
        let mut env = Envelope::new("alpha", "bravo", MessageType::Response, "re", "47");
        env.correlation_id = Some("msg_orig".into());
        env.conversation_id = Some("conv_1".into());
        env.signature = Some("sha256:abcd".into());
        let entry = AuditEntry::from_envelope(&env, "sent");
        assert_eq!(entry.kind, "response");
        assert_eq!(entry.correlation_id.as_deref(), Some("msg_orig"));
        assert_eq!(entry.conversation_id.as_deref(), Some("conv_1"));
        assert!(entry.signed);
    }

    #[test]
    fn long_bodies_are_truncated() {
        let mut env = Envelope::new("a", "b", MessageType::Notification, "s", "x");
        env.payload.body = "y".repeat(2000);
        let entry = AuditEntry::from_envelope(&env, "sent");
        assert_eq!(entry.body.len(), 500);
    }

    #[test]
    fn tail_skips_garbage_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mesh-audit.jsonl");
        std::fs::write(&path, "not json\n").unwrap();
        let log = AuditLog::new(path);
        let env = Envelope::new("a", "b", MessageType::Notification, "s", "x");
        log.record(&env, "sent").unwrap();
        assert_eq!(log.tail(10).unwrap().len(), 1);
    }
}

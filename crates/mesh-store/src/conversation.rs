use crate::fsutil::{atomic_write_json, load_json_or};
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Conversation flavor. Types differ only in defaults and preamble; the
/// round machinery is shared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationType {
    Rally,
    Collab,
    Escalation,
    Broadcast,
    Opinion,
    Brainstorm,
}

impl ConversationType {
    /// Default TTL in seconds for a conversation of this type.
    pub fn default_ttl_secs(&self) -> u64 {
        match self {
            ConversationType::Rally | ConversationType::Opinion => 300,
            ConversationType::Collab | ConversationType::Escalation => 600,
            ConversationType::Broadcast => 120,
            ConversationType::Brainstorm => 1800,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Pending,
    Active,
    Partial,
    Complete,
    Timeout,
    Closed,
    Cancelled,
}

impl ConversationStatus {
    /// Terminal conversations take no further responses and are eligible
    /// for archival.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConversationStatus::Complete
                | ConversationStatus::Timeout
                | ConversationStatus::Closed
                | ConversationStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoundStatus {
    Open,
    Complete,
    /// Closed without completing because a follow-up round replaced it.
    Superseded,
}

/// One participant's answer within a round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationResponse {
    pub from: String,
    pub body: String,
    pub ts: String,
}

/// One fan-out + response-collection cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Round {
    pub round: u32,
    pub question: String,
    pub ts: String,
    #[serde(default)]
    pub responses: Vec<ConversationResponse>,
    pub status: RoundStatus,
    pub expected_responses: usize,
    pub received_responses: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consensus: Option<serde_json::Value>,
}

/// Persistent record of one conversation, owned by its initiator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRecord {
    pub conversation_id: String,
    #[serde(rename = "type")]
    pub conv_type: ConversationType,
    pub from: String,
    pub question: String,
    pub participants: Vec<String>,
    pub expected_responses: usize,
    pub received_responses: usize,
    #[serde(default)]
    pub responses: Vec<ConversationResponse>,
    #[serde(default)]
    pub rounds: Vec<Round>,
    pub current_round: u32,
    pub status: ConversationStatus,
    pub created_at: String,
    pub updated_at: String,
    pub expires_at: u64,
    pub ttl: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consensus: Option<serde_json::Value>,
}

impl ConversationRecord {
    pub fn new(
        conversation_id: String,
        conv_type: ConversationType,
        from: &str,
        question: &str,
        participants: Vec<String>,
        expected_responses: usize,
        ttl_secs: u64,
        now_ms: u64,
    ) -> Self {
        let now_iso = mesh_proto::time::iso_ms(now_ms);
        Self {
            conversation_id,
            conv_type,
            from: from.to_string(),
            question: question.to_string(),
            participants,
            expected_responses,
            received_responses: 0,
            responses: Vec::new(),
            rounds: Vec::new(),
            current_round: 0,
            status: ConversationStatus::Pending,
            created_at: now_iso.clone(),
            updated_at: now_iso,
            expires_at: now_ms + ttl_secs * 1000,
            ttl: ttl_secs,
            summary: None,
            consensus: None,
        }
    }

    /// Append a new round, superseding any still-open one.
    pub fn push_round(&mut self, question: &str, expected: usize, now_ms: u64) -> u32 {
        if let Some(last) = self.rounds.last_mut()
            && last.status == RoundStatus::Open
        {
            last.status = RoundStatus::Superseded;
        }
        let number = self.rounds.len() as u32 + 1;
        self.rounds.push(Round {
            round: number,
            question: question.to_string(),
            ts: mesh_proto::time::iso_ms(now_ms),
            responses: Vec::new(),
            status: RoundStatus::Open,
            expected_responses: expected,
            received_responses: 0,
            consensus: None,
        });
        self.current_round = number;
        self.touch(now_ms);
        number
    }

    pub fn current_round(&self) -> Option<&Round> {
        self.rounds.last()
    }

    pub fn current_round_mut(&mut self) -> Option<&mut Round> {
        self.rounds.last_mut()
    }

    /// Record a participant's response in the current round, deduplicating
    /// by sender. Returns whether the round just completed.
    pub fn record_response(&mut self, from: &str, body: &str, now_ms: u64) -> bool {
        let ts = mesh_proto::time::iso_ms(now_ms);
        let response = ConversationResponse {
            from: from.to_string(),
            body: body.to_string(),
            ts,
        };
        self.responses.push(response.clone());
        self.received_responses += 1;

        let Some(round) = self.rounds.last_mut() else {
            self.touch(now_ms);
            return false;
        };
        if round.responses.iter().any(|r| r.from == from) {
            self.touch(now_ms);
            return false;
        }
        round.responses.push(response);
        round.received_responses = round.responses.len();
        let complete =
            round.expected_responses > 0 && round.received_responses >= round.expected_responses;
        if complete {
            round.status = RoundStatus::Complete;
        }
        if self.status == ConversationStatus::Pending {
            self.status = ConversationStatus::Active;
        }
        self.touch(now_ms);
        complete
    }

    /// Whether every round has collected its expected responses.
    pub fn all_rounds_complete(&self) -> bool {
        !self.rounds.is_empty()
            && self
                .rounds
                .iter()
                .all(|r| matches!(r.status, RoundStatus::Complete | RoundStatus::Superseded))
            && self
                .rounds
                .last()
                .map(|r| r.status == RoundStatus::Complete)
                .unwrap_or(false)
    }

    pub fn touch(&mut self, now_ms: u64) {
        self.updated_at = mesh_proto::time::iso_ms(now_ms);
    }
}

/// Conversation records as one JSON file per conversation, terminal records
/// moved to an archive directory.
pub struct ConversationStore {
    dir: PathBuf,
    archive_dir: PathBuf,
}

impl ConversationStore {
    pub fn new(dir: PathBuf, archive_dir: PathBuf) -> Self {
        Self { dir, archive_dir }
    }

    fn path_for(&self, conv_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize(conv_id)))
    }

    pub fn save(&self, record: &ConversationRecord) -> Result<()> {
        atomic_write_json(&self.path_for(&record.conversation_id), record)
    }

    pub fn get(&self, conv_id: &str) -> Result<Option<ConversationRecord>> {
        let path = self.path_for(conv_id);
        if !path.exists() {
            return Ok(None);
        }
        let record = load_json_or(&path, || unreachable!())?;
        Ok(Some(record))
    }

    /// Load a conversation, looking in the archive when it has left the
    /// active directory.
    pub fn get_anywhere(&self, conv_id: &str) -> Result<Option<ConversationRecord>> {
        if let Some(record) = self.get(conv_id)? {
            return Ok(Some(record));
        }
        let archived = self.archive_dir.join(format!("{}.json", sanitize(conv_id)));
        if !archived.exists() {
            return Ok(None);
        }
        let record = load_json_or(&archived, || unreachable!())?;
        Ok(Some(record))
    }

    /// All active (non-archived) conversations.
    pub fn list(&self) -> Result<Vec<ConversationRecord>> {
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
                    tracing::warn!(path = %path.display(), err = %e, "skipping unreadable conversation file");
                }
            }
        }
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    /// Move a terminal conversation into the archive directory.
    pub fn archive(&self, conv_id: &str) -> Result<()> {
        let src = self.path_for(conv_id);
        if !src.exists() {
            bail!("unknown conversation: {conv_id}");
        }
        if !self.archive_dir.exists() {
            std::fs::create_dir_all(&self.archive_dir)
                .with_context(|| format!("failed to create {}", self.archive_dir.display()))?;
        }
        let dst = self.archive_dir.join(format!("{}.json", sanitize(conv_id)));
        std::fs::rename(&src, &dst)
            .with_context(|| format!("failed to archive {}", src.display()))?;
        Ok(())
    }
}

/// Conversation ids become file names; strip anything path-hostile.
fn sanitize(id: &str) -> String {
    id.chars()
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

    fn store(dir: &Path) -> ConversationStore {
        ConversationStore::new(dir.join("conversations"), dir.join("conversations-archive"))
    }

    fn record(id: &str) -> ConversationRecord {
        ConversationRecord::new(
            id.to_string(),
            ConversationType::Rally,
            "alpha",
            "count tanks",
            vec!["bravo".into(), "charlie".into()],
            2,
            300,
            1_000_000,
        )
    }

    #[test]
    fn save_get_list() {
        let dir = tempfile::tempdir().unwrap();
        let cs = store(dir.path());
        let rec = record("conv_1");
        cs.save(&rec).unwrap();
        let loaded = cs.get("conv_1").unwrap().unwrap();
        assert_eq!(loaded.question, "count tanks");
        assert_eq!(cs.list().unwrap().len(), 1);
        assert!(cs.get("conv_2").unwrap().is_none());
    }

    #[test]
    fn rounds_complete_when_expected_met() {
        let mut rec = record("conv_1");
        rec.push_round("count tanks", 2, 1_000_000);
        assert!(!rec.record_response("bravo", "1,250", 1_001_000));
        assert_eq!(rec.status, ConversationStatus::Active);
        // Duplicate from the same sender is ignored for round accounting.
        assert!(!rec.record_response("bravo", "1,250 again", 1_001_500));
        assert_eq!(rec.current_round().unwrap().received_responses, 1);

        assert!(rec.record_response("charlie", "1,250", 1_002_000));
        assert_eq!(rec.current_round().unwrap().status, RoundStatus::Complete);
        assert!(rec.all_rounds_complete());
    }

    #[test]
    fn follow_up_supersedes_open_round() {
        let mut rec = record("conv_1");
        rec.push_round("count tanks", 2, 1_000_000);
        rec.record_response("bravo", "1,250", 1_001_000);
        let n = rec.push_round("now count wells", 2, 1_010_000);
        assert_eq!(n, 2);
        assert_eq!(rec.rounds[0].status, RoundStatus::Superseded);
        assert_eq!(rec.current_round, 2);
        assert!(!rec.all_rounds_complete());
    }

    #[test]
    fn archive_moves_record() {
        let dir = tempfile::tempdir().unwrap();
        let cs = store(dir.path());
        cs.save(&record("conv_1")).unwrap();
        cs.archive("conv_1").unwrap();
        assert!(cs.get("conv_1").unwrap().is_none());
        assert!(cs.get_anywhere("conv_1").unwrap().is_some());
        assert!(cs.list().unwrap().is_empty());
        assert!(cs.archive("conv_1").is_err());
    }

    #[test]
    fn sanitize_strips_path_separators() {
        assert_eq!(sanitize("../../etc/passwd"), ".._.._etc_passwd");
        assert_eq!(sanitize("conv_abc123"), "conv_abc123");
    }
}

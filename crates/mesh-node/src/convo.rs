use crate::send::{self, SendOptions};
use crate::state::NodeState;
use anyhow::{Context, Result, bail};
use mesh_proto::envelope::{MessageType, Priority};
use mesh_proto::{ids, time};
use mesh_store::audit::AuditEntry;
use mesh_store::conversation::{
    ConversationRecord, ConversationStatus, ConversationType, Round,
};
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;

/// How much of a question/answer survives into the shared-context digest.
const CONTEXT_QUESTION_CHARS: usize = 200;
const CONTEXT_ANSWER_CHARS: usize = 300;

/// Open a conversation: create the record and fan round 1 to every
/// participant.
pub async fn open(
    state: &Arc<NodeState>,
    conv_type: ConversationType,
    question: &str,
    participants: Vec<String>,
    ttl: Option<u64>,
    ack: bool,
) -> Result<ConversationRecord> {
    if participants.is_empty() {
        bail!("conversation needs at least one participant");
    }
    let ttl = ttl.unwrap_or_else(|| conv_type.default_ttl_secs());
    // Plain broadcasts are fire-and-forget; ack=true turns them rally-like.
    let fire_and_forget = conv_type == ConversationType::Broadcast && !ack;
    let expected = if fire_and_forget { 0 } else { participants.len() };

    let now = time::now_ms();
    let self_name = state.self_name().await;
    let mut record = ConversationRecord::new(
        ids::conversation_id(),
        conv_type,
        &self_name,
        question,
        participants,
        expected,
        ttl,
        now,
    );
    record.push_round(question, expected, now);
    // Persist before fanning out: a fast participant can answer before the
    // last send returns.
    state.conversations.lock().await.save(&record)?;

    let body = format!("{}{}", preamble(conv_type, &record.participants), question);
    let failures = fan_out(state, &record, &body, fire_and_forget).await;
    let record =
        merge_fanout_failures(state, &record.conversation_id, failures, fire_and_forget).await?;
    audit_transition(state, &record, "opened").await;
    Ok(record)
}

/// Ask a follow-up question: supersede the open round, append a new one and
/// re-fan with the shared context of everything so far.
pub async fn follow_up(
    state: &Arc<NodeState>,
    conv_id: &str,
    question: &str,
) -> Result<ConversationRecord> {
    let mut record = load_active(state, conv_id).await?;
    // A conversation whose rounds all completed is still open to follow-ups;
    // only explicit closure and timeout shut the door.
    if record.status.is_terminal() && record.status != ConversationStatus::Complete {
        bail!("conversation {conv_id} is {:?}", record.status);
    }
    let now = time::now_ms();
    let context = build_context(&record);
    record.push_round(question, record.participants.len(), now);
    record.status = ConversationStatus::Active;
    // A follow-up restarts the clock; the old expiry was for the old round.
    record.expires_at = now + record.ttl * 1000;
    state.conversations.lock().await.save(&record)?;

    let body = if context.is_empty() {
        question.to_string()
    } else {
        format!("{context}\n{question}")
    };
    let failures = fan_out(state, &record, &body, false).await;
    let record = merge_fanout_failures(state, &record.conversation_id, failures, false).await?;
    audit_transition(state, &record, "follow_up").await;
    Ok(record)
}

/// Record a participant's response. Completes the round (and possibly the
/// conversation) when the expected count is reached.
pub async fn on_response(state: &Arc<NodeState>, conv_id: &str, from: &str, body: &str) {
    let result = apply_response(state, conv_id, from, body).await;
    if let Err(e) = result {
        tracing::debug!(conversation = %conv_id, from = %from, err = %e, "response not applied");
    }
}

async fn apply_response(
    state: &Arc<NodeState>,
    conv_id: &str,
    from: &str,
    body: &str,
) -> Result<()> {
    let conversations = state.conversations.lock().await;
    let Some(mut record) = conversations.get(conv_id)? else {
        // Not ours (or already archived); the audit log still has the raw
        // response.
        return Ok(());
    };
    if record.status.is_terminal() {
        return Ok(());
    }
    let now = time::now_ms();
    record.record_response(from, body, now);
    let completed = settle(&mut record)?;
    conversations.save(&record)?;
    drop(conversations);
    // Completed conversations stay in the active directory so follow-up
    // rounds can reopen them; archival happens on explicit closure.
    if completed {
        audit_transition(state, &record, "complete").await;
    }
    Ok(())
}

/// Mark the current round complete once its expectation is met, stamp its
/// consensus, and complete the conversation when every round is done.
/// Returns whether the conversation just completed.
fn settle(record: &mut ConversationRecord) -> Result<bool> {
    if let Some(round) = record.current_round_mut() {
        if round.status == mesh_store::conversation::RoundStatus::Open
            && round.expected_responses > 0
            && round.received_responses >= round.expected_responses
        {
            round.status = mesh_store::conversation::RoundStatus::Complete;
        }
        if round.status == mesh_store::conversation::RoundStatus::Complete
            && round.consensus.is_none()
        {
            let report = consensus_for_round(round);
            round.consensus = Some(serde_json::to_value(&report)?);
        }
    }
    if !record.status.is_terminal() && record.all_rounds_complete() {
        record.status = ConversationStatus::Complete;
        let report = consensus(record, None);
        record.consensus = Some(serde_json::to_value(&report)?);
        return Ok(true);
    }
    Ok(false)
}

/// Explicit terminal transitions.
pub async fn complete(
    state: &Arc<NodeState>,
    conv_id: &str,
    summary: Option<String>,
) -> Result<ConversationRecord> {
    finish(state, conv_id, ConversationStatus::Complete, summary, "complete").await
}

pub async fn close(
    state: &Arc<NodeState>,
    conv_id: &str,
    reason: Option<String>,
) -> Result<ConversationRecord> {
    finish(state, conv_id, ConversationStatus::Closed, reason, "closed").await
}

pub async fn cancel(
    state: &Arc<NodeState>,
    conv_id: &str,
    reason: Option<String>,
) -> Result<ConversationRecord> {
    finish(state, conv_id, ConversationStatus::Cancelled, reason, "cancelled").await
}

async fn finish(
    state: &Arc<NodeState>,
    conv_id: &str,
    status: ConversationStatus,
    summary: Option<String>,
    audit_status: &str,
) -> Result<ConversationRecord> {
    let conversations = state.conversations.lock().await;
    let mut record = conversations
        .get(conv_id)?
        .with_context(|| format!("unknown conversation: {conv_id}"))?;
    record.status = status;
    if summary.is_some() {
        record.summary = summary;
    }
    record.touch(time::now_ms());
    conversations.save(&record)?;
    conversations.archive(conv_id)?;
    drop(conversations);
    audit_transition(state, &record, audit_status).await;
    Ok(record)
}

/// Periodic timeout sweeper.
pub async fn run_sweep_loop(state: Arc<NodeState>) {
    let mut interval = tokio::time::interval(state.config.sweep_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        match sweep_once(&state, time::now_ms()).await {
            Ok(timed_out) if !timed_out.is_empty() => {
                tracing::info!(count = timed_out.len(), "conversations timed out");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(err = %e, "timeout sweep failed"),
        }
    }
}

/// Every non-terminal conversation past its expiry becomes `timeout`.
pub async fn sweep_once(state: &Arc<NodeState>, now_ms: u64) -> Result<Vec<String>> {
    let conversations = state.conversations.lock().await;
    let mut timed_out = Vec::new();
    for mut record in conversations.list()? {
        if !record.status.is_terminal() && record.expires_at < now_ms {
            record.status = ConversationStatus::Timeout;
            record.touch(now_ms);
            conversations.save(&record)?;
            conversations.archive(&record.conversation_id)?;
            timed_out.push(record.conversation_id.clone());
        }
    }
    drop(conversations);
    for conv_id in &timed_out {
        if let Ok(Some(record)) = state.conversations.lock().await.get_anywhere(conv_id) {
            audit_transition(state, &record, "timeout").await;
        }
    }
    Ok(timed_out)
}

/// Case-insensitive substring search over active conversation records.
pub async fn search(state: &Arc<NodeState>, query: &str) -> Result<Vec<ConversationRecord>> {
    let query = query.to_lowercase();
    let conversations = state.conversations.lock().await;
    let matches = conversations
        .list()?
        .into_iter()
        .filter(|record| {
            record.question.to_lowercase().contains(&query)
                || record.conversation_id.to_lowercase().contains(&query)
                || record.rounds.iter().any(|r| {
                    r.question.to_lowercase().contains(&query)
                        || r.responses
                            .iter()
                            .any(|resp| resp.body.to_lowercase().contains(&query))
                })
        })
        .collect();
    Ok(matches)
}

async fn load_active(state: &Arc<NodeState>, conv_id: &str) -> Result<ConversationRecord> {
    state
        .conversations
        .lock()
        .await
        .get(conv_id)?
        .with_context(|| format!("unknown conversation: {conv_id}"))
}

/// Fan the current round's question to every participant. Returns how many
/// sends failed; failures never fail the conversation itself.
async fn fan_out(
    state: &Arc<NodeState>,
    record: &ConversationRecord,
    body: &str,
    fire_and_forget: bool,
) -> usize {
    let self_name = state.self_name().await;
    let round = record.current_round;
    let prior = prior_rounds_value(record);
    let mut failures = 0usize;

    for participant in record.participants.clone() {
        if participant == self_name {
            continue;
        }
        let mut reply_context = json!({
            "conversationId": &record.conversation_id,
            "participants": &record.participants,
            "round": round,
        });
        if let Some(prior) = &prior {
            reply_context["priorRounds"] = prior.clone();
        }
        let opts = SendOptions {
            kind: if fire_and_forget {
                MessageType::Notification
            } else {
                MessageType::Request
            },
            priority: if record.conv_type == ConversationType::Escalation {
                Priority::High
            } else {
                Priority::Normal
            },
            ttl: Some(record.ttl),
            reply_context: Some(reply_context),
            conversation_id: Some(record.conversation_id.clone()),
            conversation_seq: Some(round as u64),
            ..Default::default()
        };
        if let Err(e) = send::send(state, &participant, &record.question, body, opts).await {
            tracing::warn!(
                conversation = %record.conversation_id,
                peer = %participant,
                err = %e,
                "participant fan-out failed"
            );
            failures += 1;
        }
    }
    failures
}

/// Fold fan-out failures back into the stored record: unreachable
/// participants shrink the round's expectation and mark the conversation
/// partial. Re-reads under the lock so concurrent responses are kept.
async fn merge_fanout_failures(
    state: &Arc<NodeState>,
    conv_id: &str,
    failures: usize,
    fire_and_forget: bool,
) -> Result<ConversationRecord> {
    let conversations = state.conversations.lock().await;
    let mut record = conversations
        .get(conv_id)?
        .with_context(|| format!("unknown conversation: {conv_id}"))?;
    if failures > 0 && !fire_and_forget {
        if let Some(round) = record.current_round_mut() {
            round.expected_responses = round.expected_responses.saturating_sub(failures);
        }
        record.expected_responses = record.expected_responses.saturating_sub(failures);
        if !record.status.is_terminal() {
            record.status = ConversationStatus::Partial;
        }
        // Responses that already arrived may now satisfy the reduced
        // expectation.
        let completed = settle(&mut record)?;
        conversations.save(&record)?;
        drop(conversations);
        if completed {
            audit_transition(state, &record, "complete").await;
        }
    }
    Ok(record)
}

fn preamble(conv_type: ConversationType, participants: &[String]) -> String {
    match conv_type {
        ConversationType::Rally | ConversationType::Broadcast => String::new(),
        ConversationType::Collab => {
            "This is a multi-turn collaboration; expect follow-up rounds.\n\n".to_string()
        }
        ConversationType::Escalation => format!(
            "Escalation chain: {}. Respond in order of severity.\n\n",
            participants.join(" -> ")
        ),
        ConversationType::Opinion => {
            "Independent opinion requested; answer from your own context.\n\n".to_string()
        }
        ConversationType::Brainstorm => {
            "Brainstorm: propose ideas freely, multiple rounds expected.\n\n".to_string()
        }
    }
}

// ---------------------------------------------------------------------------
// Shared context
// ---------------------------------------------------------------------------

/// Human-readable digest of prior rounds, prefixed to follow-up bodies.
pub fn build_context(record: &ConversationRecord) -> String {
    if record.rounds.is_empty() {
        return String::new();
    }
    let mut lines = vec![
        "CONVERSATION CONTEXT (prior rounds):".to_string(),
        format!("Conversation: {}", record.conversation_id),
        format!("Participants: {}", record.participants.join(", ")),
        String::new(),
    ];
    for round in &record.rounds {
        lines.push(format!(
            "── Round {} ({}) ──",
            round.round,
            round_status_label(round)
        ));
        lines.push(format!("Q: {}", clip(&round.question, CONTEXT_QUESTION_CHARS)));
        if round.responses.is_empty() {
            lines.push("  (no responses yet)".to_string());
        } else {
            for resp in &round.responses {
                lines.push(format!(
                    "  {}: {}",
                    resp.from,
                    clip(&resp.body, CONTEXT_ANSWER_CHARS)
                ));
            }
        }
        lines.push(String::new());
    }
    lines.join("\n")
}

/// Machine-readable form of prior rounds for `replyContext.priorRounds`.
fn prior_rounds_value(record: &ConversationRecord) -> Option<Value> {
    // The current (just-pushed) round is not prior context.
    let prior: Vec<&Round> = record
        .rounds
        .iter()
        .filter(|r| r.round < record.current_round)
        .collect();
    if prior.is_empty() {
        return None;
    }
    Some(json!(
        prior
            .iter()
            .map(|r| {
                json!({
                    "round": r.round,
                    "question": &r.question,
                    "status": round_status_label(r),
                    "responses": r.responses.iter().map(|resp| json!({
                        "from": &resp.from,
                        "body": &resp.body,
                    })).collect::<Vec<_>>(),
                })
            })
            .collect::<Vec<_>>()
    ))
}

fn round_status_label(round: &Round) -> &'static str {
    match round.status {
        mesh_store::conversation::RoundStatus::Open => "open",
        mesh_store::conversation::RoundStatus::Complete => "complete",
        mesh_store::conversation::RoundStatus::Superseded => "superseded",
    }
}

fn clip(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &s[..end])
}

// ---------------------------------------------------------------------------
// Consensus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusVerdict {
    Match,
    NearMatch,
    Close,
    Disagree,
    Insufficient,
    NoData,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsensusReport {
    pub verdict: ConsensusVerdict,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discrepancy: Option<f64>,
    pub values: Vec<Value>,
}

/// Compare responses in one round (default: the latest round that has any).
pub fn consensus(record: &ConversationRecord, round: Option<u32>) -> ConsensusReport {
    let round = match round {
        Some(n) => record.rounds.iter().find(|r| r.round == n),
        None => record.rounds.iter().rev().find(|r| !r.responses.is_empty()),
    };
    match round {
        Some(round) => consensus_for_round(round),
        None => ConsensusReport {
            verdict: ConsensusVerdict::NoData,
            discrepancy: None,
            values: Vec::new(),
        },
    }
}

pub fn consensus_for_round(round: &Round) -> ConsensusReport {
    let bodies: Vec<&str> = round.responses.iter().map(|r| r.body.as_str()).collect();
    match bodies.len() {
        0 => {
            return ConsensusReport {
                verdict: ConsensusVerdict::NoData,
                discrepancy: None,
                values: Vec::new(),
            };
        }
        1 => {
            return ConsensusReport {
                verdict: ConsensusVerdict::Insufficient,
                discrepancy: None,
                values: vec![json!(bodies[0])],
            };
        }
        _ => {}
    }

    let numeric: Vec<Option<f64>> = bodies.iter().map(|b| parse_numeric(b)).collect();
    if numeric.iter().all(|n| n.is_some()) {
        let values: Vec<f64> = numeric.into_iter().flatten().collect();
        let json_values = values.iter().map(|v| json!(v)).collect();
        if values.windows(2).all(|w| w[0] == w[1]) {
            return ConsensusReport {
                verdict: ConsensusVerdict::Match,
                discrepancy: None,
                values: json_values,
            };
        }
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        let max_dev_pct = values
            .iter()
            .map(|v| ((v - mean).abs() / mean.abs()) * 100.0)
            .fold(0.0_f64, f64::max);
        let verdict = if max_dev_pct <= 1.0 {
            ConsensusVerdict::NearMatch
        } else if max_dev_pct <= 5.0 {
            ConsensusVerdict::Close
        } else {
            ConsensusVerdict::Disagree
        };
        return ConsensusReport {
            verdict,
            discrepancy: Some((max_dev_pct * 100.0).round() / 100.0),
            values: json_values,
        };
    }

    // Non-numeric: normalized string equality.
    let normalized: Vec<String> = bodies.iter().map(|b| normalize(b)).collect();
    let all_equal = normalized.windows(2).all(|w| w[0] == w[1]);
    ConsensusReport {
        verdict: if all_equal {
            ConsensusVerdict::Match
        } else {
            ConsensusVerdict::Disagree
        },
        discrepancy: None,
        values: normalized.into_iter().map(|v| json!(v)).collect(),
    }
}

/// Parse `"1,250"`, `"$1,250.50"`, `" 1250 "` and friends into a float.
/// Anything with trailing prose is not numeric.
fn parse_numeric(s: &str) -> Option<f64> {
    let trimmed = s.trim();
    let stripped = trimmed
        .trim_start_matches(['$', '€', '£', '¥'])
        .replace(',', "");
    let stripped = stripped.trim();
    if stripped.is_empty() {
        return None;
    }
    stripped.parse::<f64>().ok()
}

fn normalize(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

async fn audit_transition(state: &Arc<NodeState>, record: &ConversationRecord, status: &str) {
    let entry = AuditEntry {
        ts: time::now_iso(),
        from: record.from.clone(),
        to: record.participants.join(","),
        kind: "conversation".to_string(),
        id: record.conversation_id.clone(),
        subject: record.question.clone(),
        body: record.summary.clone().unwrap_or_default(),
        status: status.to_string(),
        correlation_id: None,
        conversation_id: Some(record.conversation_id.clone()),
        reply_context: None,
        signed: false,
        session: None,
    };
    if let Err(e) = state.audit.lock().await.append(&entry) {
        tracing::error!(err = %e, "failed to audit conversation transition");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_store::conversation::{ConversationResponse, RoundStatus};

    fn round_with(bodies: &[&str]) -> Round {
        Round {
            round: 1,
            question: "count tanks".to_string(),
            ts: time::iso_ms(1_000_000),
            responses: bodies
                .iter()
                .enumerate()
                .map(|(i, b)| ConversationResponse {
                    from: format!("agent{i}"),
                    body: b.to_string(),
                    ts: time::iso_ms(1_000_000),
                })
                .collect(),
            status: RoundStatus::Complete,
            expected_responses: bodies.len(),
            received_responses: bodies.len(),
            consensus: None,
        }
    }

    #[test]
    fn numeric_parsing_is_tolerant() {
        assert_eq!(parse_numeric("1,250"), Some(1250.0));
        assert_eq!(parse_numeric("$1,250.50"), Some(1250.5));
        assert_eq!(parse_numeric("  42 "), Some(42.0));
        assert_eq!(parse_numeric("1250 tanks"), None);
        assert_eq!(parse_numeric("plenty"), None);
    }

    #[test]
    fn consensus_bands() {
        assert_eq!(
            consensus_for_round(&round_with(&["1,250", "1,250"])).verdict,
            ConsensusVerdict::Match
        );
        assert_eq!(
            consensus_for_round(&round_with(&["1250", "1260"])).verdict,
            ConsensusVerdict::NearMatch
        );
        assert_eq!(
            consensus_for_round(&round_with(&["1000", "1040"])).verdict,
            ConsensusVerdict::Close
        );
        assert_eq!(
            consensus_for_round(&round_with(&["1000", "1250"])).verdict,
            ConsensusVerdict::Disagree
        );
    }

    #[test]
    fn consensus_edge_counts() {
        assert_eq!(
            consensus_for_round(&round_with(&[])).verdict,
            ConsensusVerdict::NoData
        );
        assert_eq!(
            consensus_for_round(&round_with(&["1250"])).verdict,
            ConsensusVerdict::Insufficient
        );
    }

    #[test]
    fn string_consensus_normalizes() {
        assert_eq!(
            consensus_for_round(&round_with(&["All  Clear", "all clear"])).verdict,
            ConsensusVerdict::Match
        );
        assert_eq!(
            consensus_for_round(&round_with(&["all clear", "under attack"])).verdict,
            ConsensusVerdict::Disagree
        );
    }

    #[test]
    fn context_digest_shape() {
        let mut record = ConversationRecord::new(
            "conv_x".to_string(),
            ConversationType::Rally,
            "alpha",
            "count tanks",
            vec!["bravo".to_string(), "charlie".to_string()],
            2,
            300,
            1_000_000,
        );
        record.push_round("count tanks", 2, 1_000_000);
        record.record_response("bravo", "1,250", 1_001_000);
        record.record_response("charlie", "1,250", 1_002_000);

        let digest = build_context(&record);
        assert!(digest.starts_with("CONVERSATION CONTEXT"));
        assert!(digest.contains("Conversation: conv_x"));
        assert!(digest.contains("Participants: bravo, charlie"));
        assert!(digest.contains("── Round 1 (complete) ──"));
        assert!(digest.contains("Q: count tanks"));
        assert!(digest.contains("  bravo: 1,250"));
    }

    #[test]
    fn context_clips_long_bodies() {
        let mut record = ConversationRecord::new(
            "conv_x".to_string(),
            ConversationType::Rally,
            "alpha",
            "q",
            vec!["bravo".to_string()],
            1,
            300,
            1_000_000,
        );
        record.push_round("q", 1, 1_000_000);
        record.record_response("bravo", &"x".repeat(1000), 1_001_000);
        let digest = build_context(&record);
        let answer_line = digest
            .lines()
            .find(|l| l.starts_with("  bravo:"))
            .unwrap()
            .to_string();
        assert!(answer_line.len() < 400);
        assert!(answer_line.ends_with('…'));
    }
}

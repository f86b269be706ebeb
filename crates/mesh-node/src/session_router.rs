use crate::send::{self, SendOptions};
use crate::state::NodeState;
use anyhow::{Context, Result};
use mesh_proto::envelope::{Envelope, MessageType, SessionTag};
use mesh_proto::time;
use mesh_store::session::{SessionDirection, SessionMessage, SessionRecord};
use serde_json::json;
use std::sync::Arc;

/// How many trailing messages ride along as structured context on a session
/// fan-out.
const CONTEXT_MESSAGES: usize = 10;

/// How much of each message body survives into the embedded context.
const CONTEXT_BODY_CHARS: usize = 240;

/// Record an inbound envelope that carries a session key.
pub async fn record_inbound(state: &Arc<NodeState>, key: &str, envelope: &Envelope) {
    let message = SessionMessage {
        from: envelope.from.clone(),
        to: envelope.to.clone(),
        body: envelope.payload.body.clone(),
        ts: envelope.timestamp.clone(),
        direction: SessionDirection::Inbound,
        message_id: Some(envelope.id.clone()),
    };
    let participants = [envelope.from.as_str(), envelope.to.as_str()];
    if let Err(e) = state
        .sessions
        .lock()
        .await
        .append(key, message, &participants, time::now_ms())
    {
        tracing::warn!(session = %key, err = %e, "failed to record inbound session message");
    }
}

/// Record an outbound envelope under its session tag.
pub async fn record_outbound(state: &Arc<NodeState>, envelope: &Envelope) {
    let Some(key) = envelope.session.as_ref().map(|s| s.key.clone()) else {
        return;
    };
    let message = SessionMessage {
        from: envelope.from.clone(),
        to: envelope.to.clone(),
        body: envelope.payload.body.clone(),
        ts: envelope.timestamp.clone(),
        direction: SessionDirection::Outbound,
        message_id: Some(envelope.id.clone()),
    };
    let participants = [envelope.from.as_str(), envelope.to.as_str()];
    if let Err(e) = state
        .sessions
        .lock()
        .await
        .append(&key, message, &participants, time::now_ms())
    {
        tracing::warn!(session = %key, err = %e, "failed to record outbound session message");
    }
}

/// Formatted context block the host agent consumes before answering inside
/// a session.
pub fn context_block(record: &SessionRecord, n: usize) -> String {
    if record.messages.is_empty() {
        return String::new();
    }
    let mut lines = vec![
        format!("SESSION CONTEXT ({}):", record.session_key),
        format!("Participants: {}", record.participants.join(", ")),
        String::new(),
    ];
    for msg in record.tail(n) {
        lines.push(format!("  {}: {}", msg.from, clip(&msg.body, CONTEXT_BODY_CHARS)));
    }
    lines.join("\n")
}

/// Fan a message to every other participant of a session, embedding the
/// human-readable context block plus structured `metadata.sessionContext`.
pub async fn send_to_session(
    state: &Arc<NodeState>,
    key: &str,
    body: &str,
) -> Result<send::BroadcastReport> {
    let self_name = state.self_name().await;
    let record = state
        .sessions
        .lock()
        .await
        .get(key)?
        .with_context(|| format!("unknown session: {key}"))?;

    let targets: Vec<String> = record
        .participants
        .iter()
        .filter(|p| **p != self_name)
        .cloned()
        .collect();
    if targets.is_empty() {
        anyhow::bail!("session {key} has no other participants");
    }

    let context = context_block(&record, CONTEXT_MESSAGES);
    let full_body = if context.is_empty() {
        body.to_string()
    } else {
        format!("{context}\n\n{body}")
    };
    let session_context: Vec<_> = record
        .tail(CONTEXT_MESSAGES)
        .iter()
        .map(|m| {
            json!({
                "from": &m.from,
                "body": clip(&m.body, CONTEXT_BODY_CHARS),
                "ts": &m.ts,
            })
        })
        .collect();

    let opts = SendOptions {
        kind: MessageType::Request,
        session: Some(SessionTag {
            key: key.to_string(),
            label: record.label.clone(),
            user: record.user.clone(),
        }),
        reply_context: Some(json!({ "sessionKey": key })),
        metadata: Some(json!({ "sessionContext": session_context })),
        ..Default::default()
    };

    let subject = format!("session:{key}");
    Ok(send::broadcast(state, &targets, &subject, &full_body, &opts).await)
}

/// Periodic cleanup: close sessions idle past the TTL.
pub async fn run_cleanup_loop(state: Arc<NodeState>) {
    let mut interval = tokio::time::interval(state.config.session_cleanup_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let idle_ttl = state.config.session_idle_ttl.as_millis() as u64;
        match state
            .sessions
            .lock()
            .await
            .close_idle(idle_ttl, time::now_ms())
        {
            Ok(closed) if !closed.is_empty() => {
                tracing::info!(count = closed.len(), "idle sessions closed");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(err = %e, "session cleanup failed"),
        }
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_block_lists_tail() {
        let mut record = SessionRecord::new("ops-room", 1_000_000);
        record.add_participant("alpha");
        record.add_participant("bravo");
        for i in 0..3 {
            record.messages.push(SessionMessage {
                from: "bravo".to_string(),
                to: "alpha".to_string(),
                body: format!("message {i}"),
                ts: time::iso_ms(1_000_000 + i),
                direction: SessionDirection::Inbound,
                message_id: None,
            });
        }
        let block = context_block(&record, 2);
        assert!(block.starts_with("SESSION CONTEXT (ops-room):"));
        assert!(block.contains("Participants: alpha, bravo"));
        assert!(!block.contains("message 0"));
        assert!(block.contains("message 1"));
        assert!(block.contains("message 2"));
    }

    #[test]
    fn empty_session_has_no_context() {
        let record = SessionRecord::new("ops-room", 1_000_000);
        assert_eq!(context_block(&record, 10), "");
    }
}

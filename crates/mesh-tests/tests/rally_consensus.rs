//! E2E: rally with consensus, then a follow-up round with shared context.

use anyhow::Result;
use mesh_node::convo::{self, ConsensusVerdict};
use mesh_store::conversation::{ConversationStatus, ConversationType};
use mesh_tests::{NodeSpec, spawn_mesh, wait_until};
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rally_reaches_match_consensus() -> Result<()> {
    let nodes = spawn_mesh(vec![
        NodeSpec::new("alpha"),
        NodeSpec::new("bravo").handler("printf '1,250'"),
        NodeSpec::new("charlie").handler("printf '1,250'"),
    ])
    .await?;
    let alpha = &nodes[0];

    let record = convo::open(
        alpha.state(),
        ConversationType::Rally,
        "count tanks",
        vec!["bravo".to_string(), "charlie".to_string()],
        Some(300),
        false,
    )
    .await?;
    let conv_id = record.conversation_id.clone();
    assert_eq!(record.expected_responses, 2);
    assert_eq!(record.current_round, 1);

    // Both participants answer; the conversation completes.
    let completed = wait_until(Duration::from_secs(5), || {
        alpha
            .state()
            .conversations
            .try_lock()
            .ok()
            .and_then(|c| c.get(&conv_id).ok().flatten())
            .map(|r| r.status == ConversationStatus::Complete)
            .unwrap_or(false)
    })
    .await;
    assert!(completed, "rally never completed");

    let record = alpha
        .state()
        .conversations
        .lock()
        .await
        .get(&conv_id)?
        .unwrap();
    assert_eq!(record.received_responses, 2);

    let report = convo::consensus(&record, None);
    assert_eq!(report.verdict, ConsensusVerdict::Match);
    assert_eq!(report.values, vec![serde_json::json!(1250.0); 2]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn follow_up_carries_shared_context() -> Result<()> {
    let nodes = spawn_mesh(vec![
        NodeSpec::new("alpha"),
        NodeSpec::new("bravo").handler("printf '1,250'"),
        NodeSpec::new("charlie").handler("printf '1,250'"),
    ])
    .await?;
    let alpha = &nodes[0];
    let bravo = &nodes[1];

    let record = convo::open(
        alpha.state(),
        ConversationType::Rally,
        "count tanks",
        vec!["bravo".to_string(), "charlie".to_string()],
        Some(300),
        false,
    )
    .await?;
    let conv_id = record.conversation_id.clone();

    let round1_done = wait_until(Duration::from_secs(5), || {
        alpha
            .state()
            .conversations
            .try_lock()
            .ok()
            .and_then(|c| c.get(&conv_id).ok().flatten())
            .map(|r| r.status == ConversationStatus::Complete)
            .unwrap_or(false)
    })
    .await;
    assert!(round1_done, "round 1 never completed");

    let record = convo::follow_up(alpha.state(), &conv_id, "now count wells").await?;
    assert_eq!(record.current_round, 2);

    // Bravo's inbound round-2 request carries the digest of round 1 plus
    // the new question, and replyContext.round == 2.
    let got_round2 = wait_until(Duration::from_secs(5), || {
        bravo.audit_entries().iter().any(|e| {
            e.kind == "request"
                && e.status == "received"
                && e.reply_context
                    .as_ref()
                    .and_then(|ctx| ctx.get("round"))
                    .and_then(|v| v.as_u64())
                    == Some(2)
        })
    })
    .await;
    assert!(got_round2, "bravo never received round 2");

    let bravo_audit = bravo.audit_entries();
    let round2 = bravo_audit
        .iter()
        .find(|e| {
            e.reply_context
                .as_ref()
                .and_then(|ctx| ctx.get("round"))
                .and_then(|v| v.as_u64())
                == Some(2)
        })
        .unwrap();
    assert!(round2.body.contains("CONVERSATION CONTEXT"));
    assert!(round2.body.contains("count tanks"));
    assert!(round2.body.contains("now count wells"));
    let prior = round2
        .reply_context
        .as_ref()
        .and_then(|ctx| ctx.get("priorRounds"))
        .expect("priorRounds missing");
    assert_eq!(prior[0]["round"], 1);

    // Round 2 completes like round 1 did.
    let round2_done = wait_until(Duration::from_secs(5), || {
        alpha
            .state()
            .conversations
            .try_lock()
            .ok()
            .and_then(|c| c.get(&conv_id).ok().flatten())
            .map(|r| r.status == ConversationStatus::Complete && r.rounds.len() == 2)
            .unwrap_or(false)
    })
    .await;
    assert!(round2_done, "round 2 never completed");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn timeout_sweep_closes_expired_conversations() -> Result<()> {
    let nodes = spawn_mesh(vec![
        NodeSpec::new("alpha").retries(&[0]),
        NodeSpec::new("bravo").down(),
    ])
    .await?;
    let alpha = &nodes[0];

    // Participant is down: fan-out fails, conversation sits partial with
    // no possible responses until the sweep times it out.
    let record = convo::open(
        alpha.state(),
        ConversationType::Rally,
        "anyone there?",
        vec!["bravo".to_string()],
        Some(1),
        false,
    )
    .await?;
    let conv_id = record.conversation_id.clone();

    tokio::time::sleep(Duration::from_millis(1100)).await;
    let timed_out = convo::sweep_once(alpha.state(), mesh_proto::time::now_ms()).await?;
    assert_eq!(timed_out, vec![conv_id.clone()]);

    let record = alpha
        .state()
        .conversations
        .lock()
        .await
        .get_anywhere(&conv_id)?
        .unwrap();
    assert_eq!(record.status, ConversationStatus::Timeout);
    Ok(())
}

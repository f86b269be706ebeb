use crate::outcome::DeliveryError;
use crate::send;
use crate::state::NodeState;
use mesh_proto::time;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// TCP liveness probe budget per target during a drain pass.
const LIVENESS_TIMEOUT: Duration = Duration::from_secs(2);

/// Outcome of one drain pass.
#[derive(Debug, Default, serde::Serialize)]
pub struct DrainReport {
    pub purged: usize,
    pub replayed: usize,
    pub failed: usize,
    pub skipped_dead: usize,
    pub remaining: usize,
}

/// Periodic drainer: retries dead-lettered envelopes against live peers.
pub async fn run_loop(state: Arc<NodeState>) {
    let mut interval = tokio::time::interval(state.config.drain_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        match drain_once(&state).await {
            Ok(report) if report.replayed > 0 || report.purged > 0 => {
                tracing::info!(
                    replayed = report.replayed,
                    purged = report.purged,
                    remaining = report.remaining,
                    "queue drain pass"
                );
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(err = %e, "queue drain pass failed"),
        }
    }
}

/// One drain pass: TTL-purge, then per live target replay queued envelopes
/// in order, spaced out to avoid hammering a recovering peer.
pub async fn drain_once(state: &Arc<NodeState>) -> anyhow::Result<DrainReport> {
    let mut report = DrainReport::default();
    let now = time::now_ms();

    // Piggyback nonce-log compaction on the drain cadence.
    if let Ok(trimmed) = state.nonces.lock().await.trim(now)
        && trimmed > 0
    {
        tracing::debug!(trimmed, "nonce log compacted");
    }

    // 1. TTL purge.
    let purged = state.dead_letters.lock().await.purge_expired(now)?;
    report.purged = purged.len();
    for id in &purged {
        state
            .replay_log
            .append(&json!({
                "ts": time::now_iso(),
                "action": "purged_expired",
                "id": id,
            }))
            .ok();
    }

    // 2. Group by target. Work from a snapshot; the store shifts under us as
    // replays succeed.
    let mut by_target: BTreeMap<String, Vec<mesh_store::dead_letter::DeadLetter>> = BTreeMap::new();
    for letter in state.dead_letters.lock().await.snapshot() {
        by_target
            .entry(letter.to.clone())
            .or_default()
            .push(letter.clone());
    }

    for (target, letters) in by_target {
        // 3. Cheap liveness probe; skip dead targets entirely.
        let Some(peer) = state.peer(&target).await else {
            report.skipped_dead += letters.len();
            continue;
        };
        if !tcp_alive(&peer.ip, peer.port).await {
            report.skipped_dead += letters.len();
            continue;
        }

        for letter in letters {
            match send::replay(state, letter.envelope.clone()).await {
                Ok(_) => {
                    state.dead_letters.lock().await.remove(&letter.id)?;
                    report.replayed += 1;
                    state
                        .replay_log
                        .append(&json!({
                            "ts": time::now_iso(),
                            "action": "replayed",
                            "id": &letter.id,
                            "to": &target,
                            "attempts": letter.attempts + 1,
                        }))
                        .ok();
                }
                Err(DeliveryError::Expired) => {
                    // Outlived its TTL while queued; next purge removes it.
                    report.failed += 1;
                }
                Err(e) => {
                    report.failed += 1;
                    state
                        .replay_log
                        .append(&json!({
                            "ts": time::now_iso(),
                            "action": "replay_failed",
                            "id": &letter.id,
                            "to": &target,
                            "reason": e.fail_reason(),
                        }))
                        .ok();
                }
            }
            tokio::time::sleep(state.config.replay_spacing).await;
        }
    }

    report.remaining = state.dead_letters.lock().await.len();
    state
        .queue_stats
        .lock()
        .await
        .record_drain(report.replayed as u64, report.purged as u64, time::now_ms())?;
    Ok(report)
}

async fn tcp_alive(ip: &str, port: u16) -> bool {
    matches!(
        tokio::time::timeout(
            LIVENESS_TIMEOUT,
            tokio::net::TcpStream::connect((ip.to_string(), port)),
        )
        .await,
        Ok(Ok(_))
    )
}

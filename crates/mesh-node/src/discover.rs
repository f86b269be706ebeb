use crate::send::{self, SendOptions};
use crate::state::NodeState;
use mesh_proto::envelope::MessageType;
use mesh_proto::time;
use mesh_store::registry::{Peer, PeerRole};
use mesh_store::routing::MeshHealth;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Budget for one status probe, HTTP or TCP fallback.
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, serde::Serialize)]
pub struct ProbeResult {
    pub peer: String,
    pub reachable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_code: Option<u16>,
}

/// Periodic prober + elector.
pub async fn run_loop(state: Arc<NodeState>) {
    let mut interval = tokio::time::interval(state.config.probe_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        if let Err(e) = probe_and_elect(&state).await {
            tracing::warn!(err = %e, "discovery pass failed");
        }
    }
}

pub async fn probe_and_elect(state: &Arc<NodeState>) -> anyhow::Result<Vec<ProbeResult>> {
    let results = probe_peers(state).await?;
    elect(state).await?;
    Ok(results)
}

/// Probe every non-self peer with the lightweight status endpoint, falling
/// back to a TCP connect. Never posts to `/hooks/*`: that would wake the
/// agent and burn tokens.
pub async fn probe_peers(state: &Arc<NodeState>) -> anyhow::Result<Vec<ProbeResult>> {
    let peers: Vec<(String, Peer)> = {
        let registry = state.registry.lock().await;
        let self_name = registry.self_name().to_string();
        registry
            .peers()
            .filter(|(name, _)| **name != self_name)
            .map(|(name, peer)| (name.clone(), peer.clone()))
            .collect()
    };

    let now = time::now_ms();
    let mut results = Vec::with_capacity(peers.len());
    for (name, peer) in peers {
        let result = probe_one(state, &name, &peer).await;
        let mut health = state.peer_health.lock().await;
        if result.reachable {
            health.record_up(
                &name,
                &peer.ip,
                peer.port,
                result.http_code,
                result.latency_ms.unwrap_or(0),
                now,
            )?;
        } else {
            health.record_down(&name, &peer.ip, peer.port, now)?;
        }
        state
            .discover_log
            .append(&json!({
                "ts": time::now_iso(),
                "event": "probe",
                "peer": &result.peer,
                "reachable": result.reachable,
                "latencyMs": result.latency_ms,
            }))
            .ok();
        results.push(result);
    }
    Ok(results)
}

async fn probe_one(state: &Arc<NodeState>, name: &str, peer: &Peer) -> ProbeResult {
    let started = Instant::now();
    let status = tokio::time::timeout(
        PROBE_TIMEOUT,
        state.http.get(peer.status_url()).send(),
    )
    .await;
    match status {
        Ok(Ok(resp)) if resp.status().is_success() => ProbeResult {
            peer: name.to_string(),
            reachable: true,
            latency_ms: Some(started.elapsed().as_millis() as u64),
            http_code: Some(resp.status().as_u16()),
        },
        _ => {
            // Status endpoint missing or slow; a raw TCP connect still
            // tells us the node is up.
            let started = Instant::now();
            let alive = matches!(
                tokio::time::timeout(
                    PROBE_TIMEOUT,
                    tokio::net::TcpStream::connect((peer.ip.clone(), peer.port)),
                )
                .await,
                Ok(Ok(_))
            );
            ProbeResult {
                peer: name.to_string(),
                reachable: alive,
                latency_ms: alive.then(|| started.elapsed().as_millis() as u64),
                http_code: None,
            }
        }
    }
}

/// Local relay election: when the hub is unreachable from here, pick an
/// explicit relay/sre role first, else the lowest-latency reachable peer.
/// Purely local; no consensus across nodes is attempted.
pub async fn elect(state: &Arc<NodeState>) -> anyhow::Result<Option<String>> {
    let (hub_name, candidates) = {
        let registry = state.registry.lock().await;
        let self_name = registry.self_name().to_string();
        let hub = registry.hub().map(|(name, _)| name.clone());
        let candidates: Vec<(String, PeerRole)> = registry
            .peers()
            .filter(|(name, _)| **name != self_name)
            .map(|(name, peer)| (name.clone(), peer.role))
            .collect();
        (hub, candidates)
    };

    let health = state.peer_health.lock().await;
    let counts = health.counts();
    let mesh_health = MeshHealth {
        up: counts.0,
        down: counts.1,
        total: counts.2,
    };

    let hub_reachable = hub_name
        .as_deref()
        .map(|hub| health.is_reachable(hub))
        .unwrap_or(false);

    let relay = if hub_reachable {
        None
    } else {
        // Priority: explicit relay/sre role, then lowest latency.
        candidates
            .iter()
            .filter(|(name, role)| {
                matches!(role, PeerRole::Relay | PeerRole::Sre) && health.is_reachable(name)
            })
            .map(|(name, _)| name.clone())
            .next()
            .or_else(|| {
                candidates
                    .iter()
                    .filter(|(name, _)| health.is_reachable(name))
                    .min_by_key(|(name, _)| {
                        health
                            .get(name)
                            .and_then(|h| h.latency_ms)
                            .unwrap_or(u64::MAX)
                    })
                    .map(|(name, _)| name.clone())
            })
    };
    drop(health);

    let elected = relay.is_some();
    if !hub_reachable && relay.is_none() {
        tracing::warn!("mesh partitioned: hub unreachable and no relay candidate");
    }

    state.routing.lock().await.update(
        hub_name.clone(),
        relay.clone(),
        mesh_health,
        time::now_ms(),
        elected,
    )?;

    state
        .discover_log
        .append(&json!({
            "ts": time::now_iso(),
            "event": "election",
            "hub": hub_name,
            "hubReachable": hub_reachable,
            "relay": relay,
            "meshHealth": mesh_health,
        }))
        .ok();

    Ok(relay)
}

/// Broadcast this node's routing table and peer-health snapshot to every
/// reachable peer as a hint. Receivers never override their own direct
/// observations with it.
pub async fn gossip(state: &Arc<NodeState>) -> anyhow::Result<send::BroadcastReport> {
    let routing = state.routing.lock().await.get().clone();
    let reachable: Vec<String> = {
        let health = state.peer_health.lock().await;
        state
            .registry
            .lock()
            .await
            .other_names()
            .into_iter()
            .filter(|name| health.is_reachable(name))
            .collect()
    };
    // The gossip marker rides in payload.metadata, so receivers file it as
    // hints without waking the host runtime.
    let metadata = json!({
        "gossip": true,
        "routing": routing,
        "peerHealth": state.peer_health.lock().await.snapshot(),
    });

    let opts = SendOptions {
        kind: MessageType::Notification,
        metadata: Some(metadata),
        ..Default::default()
    };
    let report = send::broadcast(
        state,
        &reachable,
        "mesh-gossip",
        "routing table and peer health snapshot",
        &opts,
    )
    .await;
    state
        .discover_log
        .append(&json!({
            "ts": time::now_iso(),
            "event": "gossip_sent",
            "sent": &report.sent,
            "failed": &report.failed,
        }))
        .ok();
    Ok(report)
}

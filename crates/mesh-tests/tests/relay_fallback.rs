//! E2E: retries exhaust against a dead peer, then the elected relay carries
//! the envelope.

use anyhow::Result;
use mesh_node::send::{self, SendOptions};
use mesh_node::discover;
use mesh_tests::{NodeSpec, spawn_mesh, wait_until};
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn retry_then_relay() -> Result<()> {
    let nodes = spawn_mesh(vec![
        NodeSpec::new("alpha"),
        NodeSpec::new("bravo").down(),
        NodeSpec::new("charlie").role(mesh_store::registry::PeerRole::Relay),
    ])
    .await?;
    let alpha = &nodes[0];
    let charlie = &nodes[2];

    // Probe sees bravo (the default hub) down and elects charlie.
    discover::probe_and_elect(alpha.state()).await?;
    let routing = alpha.state().routing.lock().await.get().clone();
    assert_eq!(routing.relay.as_deref(), Some("charlie"));
    assert!(routing.last_election.is_some());

    let report = send::send(
        alpha.state(),
        "bravo",
        "count",
        "count tanks",
        SendOptions::default(),
    )
    .await
    .expect("relay fallback should succeed");
    assert_eq!(report.status, "relayed_via_charlie");

    // Alpha's audit records the relayed delivery.
    assert!(
        alpha
            .audit_entries()
            .iter()
            .any(|e| e.status == "relayed_via_charlie" && e.id == report.id)
    );

    // Charlie saw the relay envelope and tried to forward it to bravo.
    let relayed = wait_until(Duration::from_secs(5), || {
        charlie
            .audit_entries()
            .iter()
            .any(|e| e.status == "relaying" && e.id == report.id)
    })
    .await;
    assert!(relayed, "charlie never saw the relay envelope");

    // Bravo is down, so charlie dead-letters the forward for its own drain.
    let forwarded_failed = wait_until(Duration::from_secs(5), || {
        charlie
            .state()
            .dead_letters
            .try_lock()
            .map(|dl| dl.snapshot().iter().any(|m| m.to == "bravo"))
            .unwrap_or(false)
    })
    .await;
    assert!(forwarded_failed, "charlie should hold the failed forward");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn no_relay_candidate_dead_letters() -> Result<()> {
    // Two nodes, no elected relay: exhausted retries go straight to the
    // dead-letter queue.
    let nodes = spawn_mesh(vec![
        NodeSpec::new("alpha"),
        NodeSpec::new("bravo").down(),
    ])
    .await?;
    let alpha = &nodes[0];

    let err = send::send(
        alpha.state(),
        "bravo",
        "s",
        "b",
        SendOptions {
            kind: mesh_proto::envelope::MessageType::Notification,
            ..Default::default()
        },
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind(), "transport");

    // The failed envelope is queued, not silently gone.
    assert_eq!(alpha.state().dead_letters.lock().await.len(), 1);
    Ok(())
}

//! E2E: three failures trip the circuit, the fourth send short-circuits,
//! and the drainer replays the queue once the peer comes back.

use anyhow::Result;
use mesh_node::drain;
use mesh_node::send::{self, SendOptions};
use mesh_proto::envelope::MessageType;
use mesh_store::circuit::CircuitState;
use mesh_tests::{NodeSpec, spawn_mesh, wait_until};
use std::time::Duration;

fn notification() -> SendOptions {
    SendOptions {
        kind: MessageType::Notification,
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn circuit_trips_then_queue_drains() -> Result<()> {
    let mut nodes = spawn_mesh(vec![
        // Single-attempt retries so each send is exactly one failure.
        NodeSpec::new("alpha").retries(&[0]),
        NodeSpec::new("bravo").down(),
    ])
    .await?;

    for i in 0..3 {
        let err = send::send(
            nodes[0].state(),
            "bravo",
            "s",
            &format!("m{i}"),
            notification(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), "transport");
    }

    {
        let circuits = nodes[0].state().circuits.lock().await;
        let record = circuits.get("bravo").unwrap();
        assert_eq!(record.state, CircuitState::Open);
        assert!(record.open_until.is_some());
    }

    // Fourth send short-circuits without touching the network.
    let err = send::send(nodes[0].state(), "bravo", "s", "m3", notification())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "circuit_open");

    {
        let dead_letters = nodes[0].state().dead_letters.lock().await;
        assert_eq!(dead_letters.len(), 4);
        assert!(
            dead_letters
                .snapshot()
                .iter()
                .any(|m| m.fail_reason == "circuit_open")
        );
    }

    // Bring bravo up on its reserved port; the next drain pass replays
    // everything and empties the queue.
    nodes[1].start().await?;
    let report = drain::drain_once(nodes[0].state()).await?;
    assert_eq!(report.replayed, 4);
    assert_eq!(report.remaining, 0);

    let received_all = wait_until(Duration::from_secs(5), || {
        nodes[1]
            .audit_entries()
            .iter()
            .filter(|e| e.status == "received")
            .count()
            == 4
    })
    .await;
    assert!(received_all, "bravo did not receive the replayed envelopes");

    // Replay success closes the circuit again.
    let circuits = nodes[0].state().circuits.lock().await;
    assert_eq!(circuits.get("bravo").unwrap().state, CircuitState::Closed);

    let stats = nodes[0].state().queue_stats.lock().await;
    assert_eq!(stats.get().total_replayed, 4);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn drain_skips_dead_targets() -> Result<()> {
    let nodes = spawn_mesh(vec![
        NodeSpec::new("alpha").retries(&[0]),
        NodeSpec::new("bravo").down(),
    ])
    .await?;

    send::send(nodes[0].state(), "bravo", "s", "m", notification())
        .await
        .unwrap_err();

    let report = drain::drain_once(nodes[0].state()).await?;
    assert_eq!(report.replayed, 0);
    assert_eq!(report.skipped_dead, 1);
    assert_eq!(report.remaining, 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn drain_purges_expired_envelopes() -> Result<()> {
    let nodes = spawn_mesh(vec![
        NodeSpec::new("alpha").retries(&[0]),
        NodeSpec::new("bravo").down(),
    ])
    .await?;

    let opts = SendOptions {
        kind: MessageType::Notification,
        ttl: Some(1),
        ..Default::default()
    };
    send::send(nodes[0].state(), "bravo", "s", "m", opts)
        .await
        .unwrap_err();
    assert_eq!(nodes[0].state().dead_letters.lock().await.len(), 1);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    let report = drain::drain_once(nodes[0].state()).await?;
    assert_eq!(report.purged, 1);
    assert_eq!(report.remaining, 0);
    Ok(())
}

//! E2E: happy request/response between two nodes.

use anyhow::Result;
use mesh_node::send::{self, SendOptions};
use mesh_store::circuit::CircuitState;
use mesh_tests::{NodeSpec, spawn_mesh, wait_until};
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn request_gets_correlated_response() -> Result<()> {
    let nodes = spawn_mesh(vec![
        NodeSpec::new("alpha"),
        NodeSpec::new("bravo").handler("printf '47'"),
    ])
    .await?;
    let alpha = &nodes[0];
    let bravo = &nodes[1];

    let report = send::send(
        alpha.state(),
        "bravo",
        "count",
        "count",
        SendOptions::default(),
    )
    .await
    .expect("send failed");
    assert_eq!(report.status, "sent");
    let request_id = report.id.clone();

    // Alpha's audit shows the send, then the correlated response arriving.
    let got_response = wait_until(Duration::from_secs(5), || {
        alpha.audit_entries().iter().any(|e| {
            e.status == "received"
                && e.kind == "response"
                && e.correlation_id.as_deref() == Some(request_id.as_str())
        })
    })
    .await;
    assert!(got_response, "no correlated response in alpha's audit");

    let alpha_audit = alpha.audit_entries();
    assert!(
        alpha_audit
            .iter()
            .any(|e| e.status == "sent" && e.id == request_id)
    );
    let response = alpha_audit
        .iter()
        .find(|e| e.kind == "response" && e.status == "received")
        .unwrap();
    assert_eq!(response.body, "47");
    assert_eq!(response.from, "bravo");

    // Bravo's audit mirrors: one received request, one sent response.
    let bravo_audit = bravo.audit_entries();
    assert!(
        bravo_audit
            .iter()
            .any(|e| e.status == "received" && e.kind == "request" && e.id == request_id)
    );
    assert!(
        bravo_audit
            .iter()
            .any(|e| e.status == "sent"
                && e.kind == "response"
                && e.correlation_id.as_deref() == Some(request_id.as_str()))
    );

    // Circuit alpha -> bravo ends closed with zero failures.
    let circuits = alpha.state().circuits.lock().await;
    let record = circuits.get("bravo").expect("no circuit record");
    assert_eq!(record.state, CircuitState::Closed);
    assert_eq!(record.failures, 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unknown_peer_is_permanent() -> Result<()> {
    let nodes = spawn_mesh(vec![NodeSpec::new("alpha")]).await?;
    let err = send::send(
        nodes[0].state(),
        "nobody",
        "s",
        "b",
        SendOptions::default(),
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind(), "unknown_peer");
    assert!(err.is_permanent());
    Ok(())
}

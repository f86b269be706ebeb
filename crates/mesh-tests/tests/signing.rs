//! E2E: HMAC envelope signatures between peers with shared keys.

use anyhow::Result;
use mesh_node::send::{self, SendOptions};
use mesh_proto::envelope::{Envelope, MessageType};
use mesh_tests::{NodeSpec, post_hook, spawn_mesh, wait_until};
use serde_json::json;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn signed_delivery_verifies_end_to_end() -> Result<()> {
    let nodes = spawn_mesh(vec![
        NodeSpec::new("alpha"),
        NodeSpec::new("bravo").signing().handler("printf 'ok'"),
    ])
    .await?;
    let alpha = &nodes[0];
    let bravo = &nodes[1];

    let report = send::send(
        alpha.state(),
        "bravo",
        "secure",
        "signed hello",
        SendOptions::default(),
    )
    .await
    .expect("signed send failed");

    let received = wait_until(Duration::from_secs(5), || {
        bravo
            .audit_entries()
            .iter()
            .any(|e| e.status == "received" && e.id == report.id && e.signed)
    })
    .await;
    assert!(received, "signed envelope was not accepted");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn tampered_signature_is_rejected() -> Result<()> {
    let nodes = spawn_mesh(vec![
        NodeSpec::new("alpha").signing(),
        NodeSpec::new("bravo").signing(),
    ])
    .await?;
    let bravo = &nodes[1];

    // Sign with the shared alpha<->bravo key, then tamper with the body.
    let key = nodes[0].state().signing_keys.load("bravo")?.unwrap();
    let mut envelope = Envelope::new("alpha", "bravo", MessageType::Notification, "s", "original");
    mesh_proto::sign::sign_envelope(&mut envelope, key.as_slice())?;
    envelope.payload.body = "tampered".to_string();

    let body = json!({ "message": envelope.to_wire()? });
    let (code, _) = post_hook(&bravo.hook_url("alpha"), &bravo.token, &body).await?;
    assert_eq!(code, 403);
    assert!(
        bravo
            .audit_entries()
            .iter()
            .any(|e| e.status == "rejected_bad_sig" && e.id == envelope.id)
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unsigned_envelope_rejected_in_strict_mode() -> Result<()> {
    let nodes = spawn_mesh(vec![
        NodeSpec::new("alpha").signing(),
        NodeSpec::new("bravo").signing().require_signed(),
    ])
    .await?;
    let bravo = &nodes[1];

    let envelope = Envelope::new("alpha", "bravo", MessageType::Notification, "s", "b");
    let body = json!({ "message": envelope.to_wire()? });
    let (code, _) = post_hook(&bravo.hook_url("alpha"), &bravo.token, &body).await?;
    assert_eq!(code, 403);
    assert!(
        bravo
            .audit_entries()
            .iter()
            .any(|e| e.status == "rejected_unsigned" && e.id == envelope.id)
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unsigned_envelope_accepted_in_loose_mode() -> Result<()> {
    // Same registry flags, but without --require-signed the source-compatible
    // loose policy accepts unsigned traffic.
    let nodes = spawn_mesh(vec![
        NodeSpec::new("alpha").signing(),
        NodeSpec::new("bravo").signing(),
    ])
    .await?;
    let bravo = &nodes[1];

    let envelope = Envelope::new("alpha", "bravo", MessageType::Notification, "s", "b");
    let body = json!({ "message": envelope.to_wire()? });
    let (code, _) = post_hook(&bravo.hook_url("alpha"), &bravo.token, &body).await?;
    assert_eq!(code, 202);
    Ok(())
}

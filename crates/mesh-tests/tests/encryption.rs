//! E2E: opt-in AES-256-CBC body encryption with the fleet key.

use anyhow::Result;
use mesh_node::send::{self, SendOptions};
use mesh_proto::envelope::MessageType;
use mesh_tests::{NodeSpec, spawn_mesh, wait_until};
use std::time::Duration;

fn write_fleet_key(node: &mesh_tests::TestNode, key: &[u8; 32]) -> Result<()> {
    std::fs::write(
        node.paths.encryption_keys_dir().join("fleet.key"),
        mesh_proto::ids::to_hex(key),
    )?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn encrypted_body_is_sealed_on_the_wire() -> Result<()> {
    let nodes = spawn_mesh(vec![
        NodeSpec::new("alpha"),
        NodeSpec::new("bravo"),
    ])
    .await?;
    let alpha = &nodes[0];
    let bravo = &nodes[1];

    let key = [0x5a; 32];
    write_fleet_key(alpha, &key)?;
    write_fleet_key(bravo, &key)?;

    let opts = SendOptions {
        kind: MessageType::Notification,
        encrypt: true,
        ..Default::default()
    };
    let report = send::send(alpha.state(), "bravo", "secret", "the wells are dry", opts)
        .await
        .expect("encrypted send failed");

    // Sender's audit shows ciphertext, receiver's shows plaintext.
    let alpha_entry = alpha
        .audit_entries()
        .into_iter()
        .find(|e| e.id == report.id && e.status == "sent")
        .unwrap();
    assert!(alpha_entry.body.contains("aes-256-cbc"));
    assert!(!alpha_entry.body.contains("the wells are dry"));

    let decrypted = wait_until(Duration::from_secs(5), || {
        bravo
            .audit_entries()
            .iter()
            .any(|e| e.id == report.id && e.status == "received" && e.body == "the wells are dry")
    })
    .await;
    assert!(decrypted, "receiver did not decrypt the body");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn missing_key_fails_open_to_plaintext() -> Result<()> {
    let nodes = spawn_mesh(vec![NodeSpec::new("alpha"), NodeSpec::new("bravo")]).await?;
    let alpha = &nodes[0];

    // No key anywhere: the send still goes out, in plaintext, with a warning.
    let opts = SendOptions {
        kind: MessageType::Notification,
        encrypt: true,
        ..Default::default()
    };
    let report = send::send(alpha.state(), "bravo", "s", "plain after all", opts)
        .await
        .expect("fail-open send failed");

    let entry = alpha
        .audit_entries()
        .into_iter()
        .find(|e| e.id == report.id)
        .unwrap();
    assert_eq!(entry.body, "plain after all");
    Ok(())
}

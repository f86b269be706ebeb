use crate::send;
use crate::state::NodeState;
use anyhow::{Context, Result, bail};
use mesh_proto::envelope::{Envelope, MessageType};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

/// How long the host handler gets to produce a response body.
const HANDLER_TIMEOUT: Duration = Duration::from_secs(30);

/// Hand an inbound envelope to the host runtime. For requests, the handler's
/// stdout becomes the response body, delivered back through `replyTo` with
/// `replyContext` echoed verbatim.
pub async fn dispatch(state: Arc<NodeState>, envelope: Envelope) {
    let response_body = match run_handler(&state, &envelope.to_wire().unwrap_or_default()).await {
        Ok(body) => body,
        Err(e) => {
            tracing::warn!(id = %envelope.id, err = %e, "host handler failed");
            None
        }
    };

    if envelope.kind != MessageType::Request {
        return;
    }
    let Some(body) = response_body else {
        // Inbox mode: nothing to reply with. The request stays audited.
        return;
    };
    let Some(reply_to) = envelope.reply_to.clone() else {
        tracing::warn!(id = %envelope.id, "request without replyTo, dropping response");
        return;
    };

    let self_name = state.self_name().await;
    let subject = format!("Re: {}", envelope.payload.subject);
    let response = envelope.response_to(&self_name, &subject, &body);
    match send::deliver_response(&state, response, &reply_to).await {
        Ok(report) => {
            tracing::debug!(id = %report.id, to = %envelope.from, "response delivered");
        }
        Err(e) => {
            tracing::warn!(to = %envelope.from, err = %e, "response delivery failed");
        }
    }
}

/// Hand a non-MESH body through to the host runtime unchanged.
pub async fn dispatch_bare(state: Arc<NodeState>, raw: String) {
    if let Err(e) = run_handler(&state, &raw).await {
        tracing::warn!(err = %e, "host handler failed on bare message");
    }
}

/// Run the configured handler command with the payload on stdin and return
/// its trimmed stdout, or `None` when no handler is configured or it had
/// nothing to say.
async fn run_handler(state: &NodeState, input: &str) -> Result<Option<String>> {
    let Some(command) = state.config.handler.clone() else {
        return Ok(None);
    };
    let mut child = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(&command)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("failed to spawn handler: {command}"))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(input.as_bytes())
            .await
            .context("failed to write envelope to handler stdin")?;
        drop(stdin);
    }

    let output = tokio::time::timeout(HANDLER_TIMEOUT, child.wait_with_output())
        .await
        .context("handler timed out")?
        .context("handler did not run")?;

    if !output.status.success() {
        bail!(
            "handler exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    Ok((!stdout.is_empty()).then_some(stdout))
}

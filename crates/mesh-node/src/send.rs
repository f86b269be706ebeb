use crate::attach::build_attachments;
use crate::outcome::DeliveryError;
use crate::retry::{AttemptOutcome, RetryPolicy};
use crate::session_router;
use crate::state::NodeState;
use mesh_proto::envelope::{Envelope, MessageType, Priority, RelayHint, ReplyTo, SessionTag};
use mesh_proto::{crypt, sign, time};
use mesh_store::circuit::CircuitDecision;
use mesh_store::registry::Peer;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

/// Budget for the best-effort dashboard sink POST.
const DASHBOARD_TIMEOUT: Duration = Duration::from_secs(3);

/// Caller-facing knobs for one send.
#[derive(Debug, Clone)]
pub struct SendOptions {
    pub kind: MessageType,
    pub priority: Priority,
    pub ttl: Option<u64>,
    pub encrypt: bool,
    pub attach: Vec<String>,
    pub session: Option<SessionTag>,
    pub reply_context: Option<Value>,
    pub conversation_id: Option<String>,
    pub conversation_seq: Option<u64>,
    pub correlation_id: Option<String>,
    pub parent_message_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub metadata: Option<Value>,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            kind: MessageType::Request,
            priority: Priority::Normal,
            ttl: None,
            encrypt: false,
            attach: Vec::new(),
            session: None,
            reply_context: None,
            conversation_id: None,
            conversation_seq: None,
            correlation_id: None,
            parent_message_id: None,
            idempotency_key: None,
            metadata: None,
        }
    }
}

/// What a successful send reports back.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SendReport {
    pub id: String,
    pub status: String,
}

/// Per-target fan-out result.
#[derive(Debug, Default, serde::Serialize)]
pub struct BroadcastReport {
    pub sent: Vec<String>,
    pub failed: Vec<String>,
}

/// Send one message to a named peer through the full pipeline.
pub async fn send(
    state: &Arc<NodeState>,
    to: &str,
    subject: &str,
    body: &str,
    opts: SendOptions,
) -> Result<SendReport, DeliveryError> {
    let peer = state
        .peer(to)
        .await
        .ok_or_else(|| DeliveryError::UnknownPeer(to.to_string()))?;
    let envelope = build_envelope(state, to, subject, body, opts).await?;
    let self_name = state.self_name().await;
    let (url, session_key) = delivery_target(&peer, &self_name, &envelope);
    deliver(state, to, &peer, &url, &peer.token, session_key, envelope).await
}

/// Fan one message to several peers; individual failures do not stop the
/// rest.
pub async fn broadcast(
    state: &Arc<NodeState>,
    targets: &[String],
    subject: &str,
    body: &str,
    opts: &SendOptions,
) -> BroadcastReport {
    let mut report = BroadcastReport::default();
    for target in targets {
        match send(state, target, subject, body, opts.clone()).await {
            Ok(_) => report.sent.push(target.clone()),
            Err(e) => {
                tracing::warn!(peer = %target, err = %e, "broadcast target failed");
                report.failed.push(target.clone());
            }
        }
    }
    report
}

/// Deliver a response envelope to the `replyTo` URL the request named,
/// honoring the session-routing rewrite.
pub async fn deliver_response(
    state: &Arc<NodeState>,
    mut envelope: Envelope,
    reply_to: &ReplyTo,
) -> Result<SendReport, DeliveryError> {
    let target = envelope.to.clone();
    sign_for(state, &target, &mut envelope).await?;
    let session_key = reply_context_session_key(&envelope);
    let url = match session_key {
        Some(_) => rewrite_session_url(&reply_to.url),
        None => reply_to.url.clone(),
    };
    // Peer entry is optional here: replyTo is self-contained. Without one we
    // still deliver, we just have no relay fallback.
    let peer = state.peer(&target).await;
    deliver_at(
        state,
        &target,
        peer.as_ref(),
        &url,
        &reply_to.token,
        session_key,
        envelope,
    )
    .await
}

/// Forward a relay-wrapped envelope to its original target: single attempt,
/// dead-letter here on failure. Called when this node is `relay.via`.
pub async fn forward_relay(state: &Arc<NodeState>, envelope: Envelope) -> Result<(), DeliveryError> {
    let Some(relay) = envelope.relay.clone() else {
        return Err(DeliveryError::Internal("not a relay envelope".to_string()));
    };
    let target = relay.original_to.clone();
    let peer = state
        .peer(&target)
        .await
        .ok_or_else(|| DeliveryError::UnknownPeer(target.clone()))?;
    let (url, session_key) = delivery_target(&peer, &relay.from, &envelope);
    let wire = envelope
        .to_wire()
        .map_err(|e| DeliveryError::Internal(e.to_string()))?;
    let sig = envelope.signature.clone();
    match post_wire(
        state,
        &url,
        &peer.token,
        &wire,
        sig.as_deref(),
        session_key.as_deref(),
    )
    .await
    {
        AttemptOutcome::Delivered(_) => {
            audit(state, &envelope, &format!("forwarded_to_{target}")).await;
            Ok(())
        }
        outcome => {
            let err = match outcome {
                AttemptOutcome::Permanent(code) => DeliveryError::ClientError(code),
                AttemptOutcome::Retryable(detail) => DeliveryError::Transport(detail),
                AttemptOutcome::Delivered(_) => unreachable!(),
            };
            let reason = err.fail_reason();
            audit(state, &envelope, &format!("relay_forward_failed_{}", err.kind())).await;
            state
                .dead_letters
                .lock()
                .await
                .push(envelope, &reason, 1)
                .ok();
            Err(err)
        }
    }
}

/// Replay one dead-lettered envelope along the normal delivery path, single
/// attempt. Used by the queue drainer.
pub async fn replay(state: &Arc<NodeState>, envelope: Envelope) -> Result<SendReport, DeliveryError> {
    let target = envelope.to.clone();
    let peer = state
        .peer(&target)
        .await
        .ok_or_else(|| DeliveryError::UnknownPeer(target.clone()))?;
    let self_name = state.self_name().await;
    let (url, session_key) = delivery_target(&peer, &self_name, &envelope);
    if envelope.is_expired(time::now_ms()) {
        return Err(DeliveryError::Expired);
    }
    let wire = envelope
        .to_wire()
        .map_err(|e| DeliveryError::Internal(e.to_string()))?;
    let sig = envelope.signature.clone();
    match post_wire(
        state,
        &url,
        &peer.token,
        &wire,
        sig.as_deref(),
        session_key.as_deref(),
    )
    .await
    {
        AttemptOutcome::Delivered(_) => {
            state.circuits.lock().await.record_success(&target).ok();
            Ok(SendReport {
                id: envelope.id.clone(),
                status: "replayed".to_string(),
            })
        }
        AttemptOutcome::Permanent(code) => Err(DeliveryError::ClientError(code)),
        AttemptOutcome::Retryable(detail) => Err(DeliveryError::Transport(detail)),
    }
}

// ---------------------------------------------------------------------------
// Pipeline internals
// ---------------------------------------------------------------------------

async fn build_envelope(
    state: &Arc<NodeState>,
    to: &str,
    subject: &str,
    body: &str,
    opts: SendOptions,
) -> Result<Envelope, DeliveryError> {
    let self_name = state.self_name().await;
    let mut envelope = Envelope::new(&self_name, to, opts.kind, subject, body);
    envelope.priority = opts.priority;
    if let Some(ttl) = opts.ttl {
        envelope.ttl = ttl;
    }
    envelope.reply_context = opts.reply_context;
    envelope.conversation_id = opts.conversation_id;
    envelope.conversation_seq = opts.conversation_seq;
    envelope.correlation_id = opts.correlation_id;
    envelope.parent_message_id = opts.parent_message_id;
    envelope.idempotency_key = opts.idempotency_key;
    envelope.session = opts.session;
    envelope.payload.metadata = opts.metadata;

    if opts.kind == MessageType::Request {
        let self_peer = state.self_peer().await.ok_or_else(|| {
            DeliveryError::Internal(format!(
                "agent {self_name} has no registry entry, cannot build replyTo"
            ))
        })?;
        envelope.reply_to = Some(ReplyTo {
            url: self_peer.hook_url(to),
            token: self_peer.token.clone(),
        });
    }

    if !opts.attach.is_empty() {
        envelope.payload.attachments = build_attachments(state, &opts.attach)
            .await
            .map_err(|e| DeliveryError::Internal(e.to_string()))?;
    }

    if opts.encrypt {
        encrypt_payload(state, to, &mut envelope)?;
    }

    sign_for(state, to, &mut envelope).await?;

    envelope
        .validate()
        .map_err(|e| DeliveryError::Internal(e.to_string()))?;
    Ok(envelope)
}

/// Replace the body with its AES-256-CBC wrapper. Fail-open to plaintext
/// with a warning unless strict mode is configured.
fn encrypt_payload(
    state: &Arc<NodeState>,
    to: &str,
    envelope: &mut Envelope,
) -> Result<(), DeliveryError> {
    fn try_encrypt(
        state: &NodeState,
        to: &str,
        body: &str,
    ) -> anyhow::Result<crypt::EncryptedBody> {
        let key = state
            .encryption_keys
            .load_or_fleet(to)?
            .ok_or_else(|| anyhow::anyhow!("no encryption key for {to}"))?;
        crypt::encrypt_body(&key, body)
    }
    match try_encrypt(state, to, &envelope.payload.body) {
        Ok(wrapped) => {
            envelope.payload.body =
                serde_json::to_string(&wrapped).map_err(|e| DeliveryError::Internal(e.to_string()))?;
            envelope.payload.encrypted = true;
            Ok(())
        }
        Err(e) if state.config.strict_crypto => Err(DeliveryError::Encryption(e.to_string())),
        Err(e) => {
            tracing::warn!(peer = %to, err = %e, "encryption failed, sending plaintext");
            Ok(())
        }
    }
}

/// Attach a signature when the registry marks the target `signing`.
async fn sign_for(
    state: &Arc<NodeState>,
    to: &str,
    envelope: &mut Envelope,
) -> Result<(), DeliveryError> {
    let signing = state.registry.lock().await.is_signing(to);
    if !signing {
        return Ok(());
    }
    let key = state
        .signing_keys
        .load(to)
        .map_err(|e| DeliveryError::Internal(e.to_string()))?
        .ok_or_else(|| DeliveryError::Internal(format!("signing enabled for {to} but no key file")))?;
    sign::sign_envelope(envelope, key.as_slice()).map_err(|e| DeliveryError::Internal(e.to_string()))
}

async fn deliver(
    state: &Arc<NodeState>,
    target: &str,
    peer: &Peer,
    url: &str,
    token: &str,
    session_key: Option<String>,
    envelope: Envelope,
) -> Result<SendReport, DeliveryError> {
    deliver_at(state, target, Some(peer), url, token, session_key, envelope).await
}

/// Circuit consult, retry loop, relay fallback, then bookkeeping. The one
/// delivery path everything routes through.
async fn deliver_at(
    state: &Arc<NodeState>,
    target: &str,
    peer: Option<&Peer>,
    url: &str,
    token: &str,
    session_key: Option<String>,
    envelope: Envelope,
) -> Result<SendReport, DeliveryError> {
    let decision = state
        .circuits
        .lock()
        .await
        .check(target, time::now_ms())
        .map_err(|e| DeliveryError::Internal(e.to_string()))?;
    if decision == CircuitDecision::Block {
        let err = DeliveryError::CircuitOpen(target.to_string());
        audit(state, &envelope, "failed_circuit_open").await;
        dead_letter(state, envelope, &err, 0).await;
        return Err(err);
    }
    // A half-open probe gets exactly one attempt.
    let policy = match decision {
        CircuitDecision::AllowProbe => RetryPolicy::single(),
        _ => state.config.retry.clone(),
    };

    match attempt_with_retries(state, url, token, session_key.as_deref(), &envelope, &policy).await {
        Ok(_) => {
            let report = SendReport {
                id: envelope.id.clone(),
                status: "sent".to_string(),
            };
            on_success(state, target, peer, &envelope, &report.status).await;
            Ok(report)
        }
        Err(DeliveryError::Expired) => {
            audit(state, &envelope, "failed_expired").await;
            Err(DeliveryError::Expired)
        }
        Err(err) => {
            // Exhausted retries: try the elected relay before giving up.
            if envelope.relay.is_none()
                && !err.is_permanent()
                && let Some(report) = relay_fallback(state, target, &envelope).await
            {
                on_success(state, target, peer, &envelope, &report.status).await;
                return Ok(report);
            }
            state
                .circuits
                .lock()
                .await
                .record_failure(target, time::now_ms())
                .ok();
            audit(state, &envelope, &format!("failed_{}", err.kind())).await;
            dead_letter(state, envelope, &err, policy.attempts() as u32).await;
            Err(err)
        }
    }
}

async fn attempt_with_retries(
    state: &Arc<NodeState>,
    url: &str,
    token: &str,
    session_key: Option<&str>,
    envelope: &Envelope,
    policy: &RetryPolicy,
) -> Result<u16, DeliveryError> {
    let wire = envelope
        .to_wire()
        .map_err(|e| DeliveryError::Internal(e.to_string()))?;
    let sig = envelope.signature.as_deref();
    let mut last_detail = String::new();
    for attempt in 0..policy.attempts() {
        let delay = policy.delay_before(attempt);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        // TTL is the cancellation clock: no attempt starts past expiry.
        if envelope.is_expired(time::now_ms()) {
            return Err(DeliveryError::Expired);
        }
        match post_wire(state, url, token, &wire, sig, session_key).await {
            AttemptOutcome::Delivered(code) => return Ok(code),
            AttemptOutcome::Permanent(code) => return Err(DeliveryError::ClientError(code)),
            AttemptOutcome::Retryable(detail) => {
                tracing::debug!(url, attempt, detail = %detail, "delivery attempt failed");
                last_detail = detail;
            }
        }
    }
    Err(DeliveryError::Transport(last_detail))
}

/// One webhook POST: `{"message": <envelope string>, "sessionKey"?}` with
/// bearer auth and the signature header when signed.
async fn post_wire(
    state: &Arc<NodeState>,
    url: &str,
    token: &str,
    wire: &str,
    signature: Option<&str>,
    session_key: Option<&str>,
) -> AttemptOutcome {
    let mut body = json!({ "message": wire });
    if let Some(key) = session_key {
        body["sessionKey"] = json!(key);
    }
    let mut req = state
        .http
        .post(url)
        .header("Authorization", format!("Bearer {token}"))
        .json(&body);
    if let Some(sig) = signature {
        req = req.header("X-MESH-Signature", sig);
    }
    match req.send().await {
        Ok(resp) => {
            let code = resp.status().as_u16();
            if resp.status().is_success() {
                AttemptOutcome::Delivered(code)
            } else if resp.status().is_client_error() {
                AttemptOutcome::Permanent(code)
            } else {
                AttemptOutcome::Retryable(format!("http_{code}"))
            }
        }
        Err(e) if e.is_timeout() => AttemptOutcome::Retryable("timeout".to_string()),
        Err(e) if e.is_connect() => AttemptOutcome::Retryable("connect_refused".to_string()),
        Err(e) => AttemptOutcome::Retryable(e.to_string()),
    }
}

/// Wrap the envelope for the elected relay and post it there once. Success
/// counts as ultimate delivery success.
async fn relay_fallback(
    state: &Arc<NodeState>,
    target: &str,
    envelope: &Envelope,
) -> Option<SendReport> {
    let relay_name = state
        .routing
        .lock()
        .await
        .relay_for(target)
        .map(str::to_string)?;
    let relay_peer = state.peer(&relay_name).await?;
    let self_name = state.self_name().await;

    let mut wrapped = envelope.clone();
    wrapped.relay = Some(RelayHint {
        from: self_name.clone(),
        via: relay_name.clone(),
        original_to: target.to_string(),
    });
    // The relay hint is part of the signed bytes, so a signed envelope must
    // be re-signed after wrapping.
    if wrapped.signature.is_some()
        && let Err(e) = sign_for(state, target, &mut wrapped).await
    {
        tracing::warn!(relay = %relay_name, err = %e, "failed to re-sign relay envelope");
        return None;
    }

    let (url, session_key) = delivery_target(&relay_peer, &self_name, &wrapped);
    let wire = wrapped.to_wire().ok()?;
    let sig = wrapped.signature.clone();
    match post_wire(
        state,
        &url,
        &relay_peer.token,
        &wire,
        sig.as_deref(),
        session_key.as_deref(),
    )
    .await
    {
        AttemptOutcome::Delivered(_) => Some(SendReport {
            id: envelope.id.clone(),
            status: format!("relayed_via_{relay_name}"),
        }),
        outcome => {
            tracing::warn!(relay = %relay_name, ?outcome, "relay fallback failed");
            None
        }
    }
}

async fn on_success(
    state: &Arc<NodeState>,
    target: &str,
    peer: Option<&Peer>,
    envelope: &Envelope,
    status: &str,
) {
    state.circuits.lock().await.record_success(target).ok();
    audit(state, envelope, status).await;
    if envelope.session.is_some() {
        session_router::record_outbound(state, envelope).await;
    }
    if envelope.kind == MessageType::Response
        && envelope.conversation_id.is_some()
        && let (Some(port), Some(peer)) = (state.config.dashboard_port, peer)
    {
        notify_dashboard(state, &peer.ip, port, envelope);
    }
}

async fn dead_letter(state: &Arc<NodeState>, envelope: Envelope, err: &DeliveryError, attempts: u32) {
    let reason = err.fail_reason();
    if let Err(e) = state
        .dead_letters
        .lock()
        .await
        .push(envelope, &reason, attempts)
    {
        tracing::error!(err = %e, "failed to persist dead letter");
    }
}

async fn audit(state: &Arc<NodeState>, envelope: &Envelope, status: &str) {
    if let Err(e) = state.audit.lock().await.record(envelope, status) {
        tracing::error!(err = %e, "failed to append audit log");
    }
}

/// Best-effort real-time notification for the peer's dashboard. Fire and
/// forget, bounded, silent on failure.
fn notify_dashboard(state: &Arc<NodeState>, peer_ip: &str, port: u16, envelope: &Envelope) {
    let url = format!("http://{peer_ip}:{port}/api/mesh/response");
    let body = json!({
        "conversationId": &envelope.conversation_id,
        "from": &envelope.from,
        "body": &envelope.payload.body,
        "ts": &envelope.timestamp,
    });
    let client = state.http.clone();
    tokio::spawn(async move {
        let _ = client
            .post(&url)
            .timeout(DASHBOARD_TIMEOUT)
            .json(&body)
            .send()
            .await;
    });
}

/// Pick the delivery URL and POST-body session key for an envelope. A
/// caller-supplied `replyContext.sessionKey` redirects delivery to the
/// peer's generic session-routing endpoint.
pub fn delivery_target(peer: &Peer, sender: &str, envelope: &Envelope) -> (String, Option<String>) {
    match reply_context_session_key(envelope) {
        Some(key) => (peer.agent_hook_url(), Some(key)),
        None => (peer.hook_url(sender), None),
    }
}

fn reply_context_session_key(envelope: &Envelope) -> Option<String> {
    envelope
        .reply_context
        .as_ref()
        .and_then(|ctx| ctx.get("sessionKey"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

/// Rewrite a reply URL onto the generic `/hooks/agent` endpoint, keeping
/// scheme, host and port.
pub fn rewrite_session_url(url: &str) -> String {
    let base = match url.find("://") {
        Some(scheme_end) => match url[scheme_end + 3..].find('/') {
            Some(path_start) => &url[..scheme_end + 3 + path_start],
            None => url,
        },
        None => url,
    };
    format!("{base}/hooks/agent")
}

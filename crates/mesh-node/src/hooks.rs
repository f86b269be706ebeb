use crate::state::NodeState;
use crate::{convo, dispatch, send, session_router};
use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Json;
use axum::routing::{get, post};
use mesh_proto::envelope::{Envelope, MessageType};
use mesh_proto::{is_mesh_protocol, sign, time};
use mesh_store::nonce::ReplayVerdict;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;

/// Webhook POST body: the envelope travels as a JSON string, optionally with
/// a caller-supplied session key for the generic router.
#[derive(Debug, Deserialize)]
pub struct HookBody {
    pub message: Value,
    #[serde(rename = "sessionKey")]
    pub session_key: Option<String>,
}

/// Build the webhook router: per-sender hooks, the generic session-routing
/// hook, and the unauthenticated liveness endpoint.
pub fn router(state: Arc<NodeState>) -> Router {
    Router::new()
        .route("/hooks/agent", post(handle_agent_hook))
        .route("/hooks/{sender}", post(handle_sender_hook))
        .route("/api/status", get(handle_status))
        .with_state(state)
}

async fn handle_sender_hook(
    State(state): State<Arc<NodeState>>,
    axum::extract::Path(_sender): axum::extract::Path<String>,
    headers: HeaderMap,
    Json(body): Json<HookBody>,
) -> (StatusCode, Json<Value>) {
    receive(state, headers, body).await
}

async fn handle_agent_hook(
    State(state): State<Arc<NodeState>>,
    headers: HeaderMap,
    Json(body): Json<HookBody>,
) -> (StatusCode, Json<Value>) {
    receive(state, headers, body).await
}

/// Lightweight liveness for discovery probes. No auth, touches no agent
/// session.
async fn handle_status(State(state): State<Arc<NodeState>>) -> Json<Value> {
    let agent = state.self_name().await;
    let queue = state.dead_letters.lock().await.len();
    Json(json!({
        "status": "ok",
        "agent": agent,
        "protocol": mesh_proto::MESH_PROTOCOL,
        "queue": queue,
        "ts": time::now_iso(),
    }))
}

/// The receive pipeline: auth, parse, TTL, relay transit, signature, replay,
/// decrypt, then dispatch + state updates.
async fn receive(
    state: Arc<NodeState>,
    headers: HeaderMap,
    body: HookBody,
) -> (StatusCode, Json<Value>) {
    if !authorized(&state, &headers).await {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"ok": false, "error": "bad token"})),
        );
    }

    // The envelope is normally a JSON string inside the body; tolerate a
    // bare object for hand-rolled senders.
    let raw = match &body.message {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };

    let mut envelope = match Envelope::parse(&raw) {
        Ok(env) if is_mesh_protocol(&env.protocol) => env,
        _ => {
            // Bare-message compatibility: hand the body through unchanged.
            tokio::spawn(dispatch::dispatch_bare(state.clone(), raw));
            return (StatusCode::ACCEPTED, Json(json!({"ok": true, "bare": true})));
        }
    };

    if envelope.validate().is_err() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"ok": false, "error": "invalid envelope"})),
        );
    }

    let now = time::now_ms();
    if envelope.is_expired(now) {
        audit(&state, &envelope, "rejected_expired").await;
        return drop_response("expired");
    }

    let self_name = state.self_name().await;

    // Relay handling before signature checks: a transit envelope is signed
    // between origin and final target, not for us.
    if let Some(relay) = envelope.relay.clone()
        && relay.original_to != self_name
    {
        if relay.via == self_name {
            audit(&state, &envelope, "relaying").await;
            let state_clone = state.clone();
            tokio::spawn(async move {
                if let Err(e) = send::forward_relay(&state_clone, envelope).await {
                    tracing::warn!(err = %e, "relay forward failed");
                }
            });
            return (StatusCode::ACCEPTED, Json(json!({"ok": true, "relayed": true})));
        }
        // Misrouted or looping relay envelope. One hop only.
        audit(&state, &envelope, "rejected_relay_loop").await;
        return drop_response("relay_loop");
    }

    match check_signature(&state, &envelope).await {
        SignatureCheck::Ok | SignatureCheck::Unchecked => {}
        SignatureCheck::Invalid => {
            audit(&state, &envelope, "rejected_bad_sig").await;
            return (
                StatusCode::FORBIDDEN,
                Json(json!({"ok": false, "error": "bad signature"})),
            );
        }
        SignatureCheck::MissingRequired => {
            audit(&state, &envelope, "rejected_unsigned").await;
            return (
                StatusCode::FORBIDDEN,
                Json(json!({"ok": false, "error": "signature required"})),
            );
        }
    }

    if let Some(nonce) = envelope.nonce.clone() {
        let ts = time::parse_iso(&envelope.timestamp).unwrap_or(0);
        let verdict = state
            .nonces
            .lock()
            .await
            .check_and_record(&nonce, ts, now)
            .unwrap_or(ReplayVerdict::Fresh);
        match verdict {
            ReplayVerdict::Fresh => {}
            ReplayVerdict::Seen => {
                // Duplicate delivery (a drain replay, most likely). Already
                // processed; 2xx tells the sender it owes nothing.
                audit(&state, &envelope, "rejected_replay").await;
                return (
                    StatusCode::OK,
                    Json(json!({"ok": true, "duplicate": true, "id": envelope.id})),
                );
            }
            ReplayVerdict::TooOld => {
                audit(&state, &envelope, "rejected_replay_window").await;
                return drop_response("replay_window");
            }
            ReplayVerdict::FutureSkew => {
                audit(&state, &envelope, "rejected_clock_skew").await;
                return drop_response("clock_skew");
            }
        }
    }

    decrypt_in_place(&state, &mut envelope);

    // Session updates come from the envelope's own key or the POST body.
    let session_key = envelope
        .session_key()
        .map(str::to_string)
        .or(body.session_key.clone());
    if let Some(key) = &session_key {
        session_router::record_inbound(&state, key, &envelope).await;
    }

    // Gossip notifications are routing hints, not agent traffic.
    if is_gossip(&envelope) {
        state
            .discover_log
            .append(&json!({
                "ts": time::now_iso(),
                "event": "gossip_received",
                "from": &envelope.from,
                "hints": &envelope.payload.metadata,
            }))
            .ok();
        audit(&state, &envelope, "received_gossip").await;
        return (StatusCode::ACCEPTED, Json(json!({"ok": true, "id": envelope.id})));
    }

    match envelope.kind {
        MessageType::Response => {
            if let Some(conv_id) = envelope.conversation_id.clone() {
                convo::on_response(&state, &conv_id, &envelope.from, &envelope.payload.body).await;
            }
            tokio::spawn(dispatch::dispatch(state.clone(), envelope.clone()));
        }
        MessageType::Request => {
            tokio::spawn(dispatch::dispatch(state.clone(), envelope.clone()));
        }
        MessageType::Notification | MessageType::Alert => {
            tokio::spawn(dispatch::dispatch(state.clone(), envelope.clone()));
        }
        MessageType::Ack => {}
    }

    audit(&state, &envelope, "received").await;
    (StatusCode::ACCEPTED, Json(json!({"ok": true, "id": envelope.id})))
}

async fn authorized(state: &Arc<NodeState>, headers: &HeaderMap) -> bool {
    let Some(expected) = state.self_token().await.filter(|t| !t.is_empty()) else {
        // No registry entry for self yet; nothing to check against.
        return true;
    };
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|token| token == expected)
        .unwrap_or(false)
}

enum SignatureCheck {
    Ok,
    /// No signature and none required, or no key to verify with.
    Unchecked,
    Invalid,
    MissingRequired,
}

async fn check_signature(state: &Arc<NodeState>, envelope: &Envelope) -> SignatureCheck {
    let sender = envelope.from.as_str();
    let key = match state.signing_keys.load(sender) {
        Ok(key) => key,
        Err(e) => {
            tracing::warn!(peer = %sender, err = %e, "unreadable signing key");
            None
        }
    };
    let sender_requires = state.registry.lock().await.is_signing(sender);
    let strict = state.config.require_signed && sender_requires;

    match (&envelope.signature, key) {
        (Some(_), Some(key)) => {
            if sign::verify(envelope, key.as_slice()) {
                SignatureCheck::Ok
            } else {
                SignatureCheck::Invalid
            }
        }
        (Some(_), None) if strict => SignatureCheck::MissingRequired,
        (Some(_), None) => SignatureCheck::Unchecked,
        (None, _) if strict => SignatureCheck::MissingRequired,
        (None, _) => SignatureCheck::Unchecked,
    }
}

/// Decrypt an encrypted body in place when we hold the key. Failure leaves
/// the wrapper for the host to deal with; the message is not dropped.
fn decrypt_in_place(state: &Arc<NodeState>, envelope: &mut Envelope) {
    if !envelope.payload.encrypted {
        return;
    }
    let Some(wrapped) = mesh_proto::crypt::parse_encrypted(&envelope.payload.body) else {
        tracing::warn!(id = %envelope.id, "encrypted flag set but body is not a cipher wrapper");
        return;
    };
    let key = match state.encryption_keys.load_or_fleet(&envelope.from) {
        Ok(Some(key)) => key,
        Ok(None) => {
            tracing::warn!(peer = %envelope.from, "no encryption key, leaving body sealed");
            return;
        }
        Err(e) => {
            tracing::warn!(peer = %envelope.from, err = %e, "unreadable encryption key");
            return;
        }
    };
    match mesh_proto::crypt::decrypt_body(&key, &wrapped) {
        Ok(plaintext) => {
            envelope.payload.body = plaintext;
            envelope.payload.encrypted = false;
        }
        Err(e) => {
            tracing::warn!(id = %envelope.id, err = %e, "decryption failed, leaving body sealed");
        }
    }
}

fn is_gossip(envelope: &Envelope) -> bool {
    envelope.kind == MessageType::Notification
        && envelope
            .payload
            .metadata
            .as_ref()
            .and_then(|m| m.get("gossip"))
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
}

fn drop_response(reason: &str) -> (StatusCode, Json<Value>) {
    (
        StatusCode::OK,
        Json(json!({"ok": false, "dropped": reason})),
    )
}

async fn audit(state: &Arc<NodeState>, envelope: &Envelope, status: &str) {
    if let Err(e) = state.audit.lock().await.record(envelope, status) {
        tracing::error!(err = %e, "failed to append audit log");
    }
}

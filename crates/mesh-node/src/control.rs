use crate::state::NodeState;
use crate::{convo, discover, drain, send, session_router};
use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use mesh_client::protocol::{MAX_LINE_BYTES, Request, Response};
use mesh_proto::envelope::{MessageType, Priority, SessionTag};
use mesh_proto::time;
use mesh_store::conversation::ConversationType;
use mesh_store::registry::{Peer, PeerRole};
use serde_json::{Value, json};
use std::path::Path;
use std::sync::Arc;
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

/// Start the control socket server. Accepts CLI connections and processes
/// requests until the daemon shuts down.
pub async fn serve(
    state: Arc<NodeState>,
    socket_path: &Path,
    shutdown_tx: mpsc::Sender<()>,
) -> Result<()> {
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700)).ok();
        }
    }

    // Remove stale socket
    if socket_path.exists() {
        std::fs::remove_file(socket_path).ok();
    }

    let listener = UnixListener::bind(socket_path)
        .with_context(|| format!("failed to bind {}", socket_path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600)).ok();
    }

    tracing::info!(path = %socket_path.display(), "control socket listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let state = state.clone();
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_client(state, stream, shutdown_tx).await {
                tracing::debug!(err = %e, "control client disconnected");
            }
        });
    }
}

async fn handle_client(
    state: Arc<NodeState>,
    stream: tokio::net::UnixStream,
    shutdown_tx: mpsc::Sender<()>,
) -> Result<()> {
    let (r, w) = stream.into_split();
    let mut reader = FramedRead::new(r, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
    let mut writer = FramedWrite::new(w, LinesCodec::new_with_max_length(MAX_LINE_BYTES));

    let hello = Response::Hello {
        agent: state.self_name().await,
        version: env!("CARGO_PKG_VERSION").to_string(),
    };
    writer.send(serde_json::to_string(&hello)?).await?;

    while let Some(line) = reader.next().await {
        let line = line?;
        let req: Request = match serde_json::from_str(&line) {
            Ok(req) => req,
            Err(e) => {
                let resp = Response::Error {
                    message: format!("invalid request: {e}"),
                    kind: None,
                };
                writer.send(serde_json::to_string(&resp)?).await?;
                continue;
            }
        };

        let is_shutdown = matches!(req, Request::Shutdown);
        let resp = handle_request(&state, req).await;
        writer.send(serde_json::to_string(&resp)?).await?;

        if is_shutdown {
            shutdown_tx.send(()).await.ok();
            break;
        }
    }
    Ok(())
}

pub async fn handle_request(state: &Arc<NodeState>, req: Request) -> Response {
    match dispatch_request(state, req).await {
        Ok(data) => Response::Ok { data },
        Err(RequestError::Delivery(e)) => Response::Error {
            message: e.to_string(),
            kind: Some(e.kind().to_string()),
        },
        Err(RequestError::Other(e)) => Response::Error {
            message: e.to_string(),
            kind: None,
        },
    }
}

enum RequestError {
    Delivery(crate::outcome::DeliveryError),
    Other(anyhow::Error),
}

impl From<crate::outcome::DeliveryError> for RequestError {
    fn from(e: crate::outcome::DeliveryError) -> Self {
        RequestError::Delivery(e)
    }
}

impl From<anyhow::Error> for RequestError {
    fn from(e: anyhow::Error) -> Self {
        RequestError::Other(e)
    }
}

async fn dispatch_request(
    state: &Arc<NodeState>,
    req: Request,
) -> Result<Option<Value>, RequestError> {
    match req {
        Request::Status => Ok(Some(status(state).await?)),

        Request::Send {
            to,
            kind,
            subject,
            body,
            priority,
            ttl,
            encrypt,
            attach,
            session,
            idempotency_key,
        } => {
            let opts = send::SendOptions {
                kind: parse_kind(kind.as_deref())?,
                priority: parse_priority(priority.as_deref())?,
                ttl,
                encrypt,
                attach,
                session: session.map(|key| SessionTag {
                    key,
                    label: None,
                    user: None,
                }),
                idempotency_key,
                ..Default::default()
            };
            let report = send::send(state, &to, &subject, &body, opts).await?;
            Ok(Some(json!(report)))
        }

        Request::Reply {
            to,
            correlation_id,
            subject,
            body,
        } => {
            let opts = send::SendOptions {
                kind: MessageType::Response,
                correlation_id: Some(correlation_id),
                ..Default::default()
            };
            let report = send::send(state, &to, &subject, &body, opts).await?;
            Ok(Some(json!(report)))
        }

        Request::Broadcast {
            targets,
            subject,
            body,
        } => {
            let opts = send::SendOptions {
                kind: MessageType::Notification,
                ..Default::default()
            };
            let report = send::broadcast(state, &targets, &subject, &body, &opts).await;
            Ok(Some(json!(report)))
        }

        Request::Rally {
            question,
            participants,
            ttl,
        } => {
            let record =
                convo::open(state, ConversationType::Rally, &question, participants, ttl, false)
                    .await?;
            Ok(Some(json!(record)))
        }

        Request::Converse {
            conv_type,
            question,
            participants,
            ttl,
            ack,
        } => {
            let conv_type = parse_conv_type(&conv_type)?;
            let record = convo::open(state, conv_type, &question, participants, ttl, ack).await?;
            Ok(Some(json!(record)))
        }

        Request::FollowUp {
            conversation_id,
            question,
        } => {
            let record = convo::follow_up(state, &conversation_id, &question).await?;
            Ok(Some(json!({
                "conversationId": record.conversation_id,
                "round": record.current_round,
            })))
        }

        Request::ConversationList => {
            let records = state
                .conversations
                .lock()
                .await
                .list()
                .map_err(RequestError::Other)?;
            Ok(Some(json!(records)))
        }

        Request::ConversationShow { conversation_id } => {
            let record = state
                .conversations
                .lock()
                .await
                .get_anywhere(&conversation_id)
                .map_err(RequestError::Other)?
                .with_context(|| format!("unknown conversation: {conversation_id}"))?;
            Ok(Some(json!(record)))
        }

        Request::ConversationComplete {
            conversation_id,
            summary,
        } => {
            let record = convo::complete(state, &conversation_id, summary).await?;
            Ok(Some(json!(record)))
        }

        Request::ConversationClose {
            conversation_id,
            reason,
        } => {
            let record = convo::close(state, &conversation_id, reason).await?;
            Ok(Some(json!(record)))
        }

        Request::ConversationCancel {
            conversation_id,
            reason,
        } => {
            let record = convo::cancel(state, &conversation_id, reason).await?;
            Ok(Some(json!(record)))
        }

        Request::ConversationTimeout => {
            let timed_out = convo::sweep_once(state, time::now_ms()).await?;
            Ok(Some(json!({ "timedOut": timed_out })))
        }

        Request::ConversationConsensus {
            conversation_id,
            round,
        } => {
            let record = state
                .conversations
                .lock()
                .await
                .get_anywhere(&conversation_id)
                .map_err(RequestError::Other)?
                .with_context(|| format!("unknown conversation: {conversation_id}"))?;
            let report = convo::consensus(&record, round);
            Ok(Some(json!(report)))
        }

        Request::ConversationSearch { query } => {
            let records = convo::search(state, &query).await?;
            Ok(Some(json!(records)))
        }

        Request::QueueStatus => {
            let dead_letters = state.dead_letters.lock().await;
            let stats = state.queue_stats.lock().await;
            Ok(Some(json!({
                "size": dead_letters.len(),
                "droppedOverflow": dead_letters.dropped_overflow(),
                "messages": dead_letters.snapshot().iter().map(|m| json!({
                    "id": &m.id,
                    "to": &m.to,
                    "failReason": &m.fail_reason,
                    "attempts": m.attempts,
                    "timestamp": &m.timestamp,
                })).collect::<Vec<_>>(),
                "totalReplayed": stats.get().total_replayed,
                "lastDrain": stats.get().last_drain,
            })))
        }

        Request::QueueDrain => {
            let report = drain::drain_once(state).await?;
            Ok(Some(json!(report)))
        }

        Request::QueuePurge => {
            let purged = state
                .dead_letters
                .lock()
                .await
                .purge_all()
                .map_err(RequestError::Other)?;
            Ok(Some(json!({ "purged": purged })))
        }

        Request::DiscoverProbe => {
            let results = discover::probe_peers(state).await?;
            Ok(Some(json!(results)))
        }

        Request::DiscoverStatus => {
            let health = state.peer_health.lock().await.snapshot().clone();
            let routing = state.routing.lock().await.get().clone();
            Ok(Some(json!({
                "peerHealth": health,
                "routing": routing,
            })))
        }

        Request::DiscoverElect => {
            discover::probe_peers(state).await?;
            let relay = discover::elect(state).await?;
            let routing = state.routing.lock().await.get().clone();
            Ok(Some(json!({ "relay": relay, "routing": routing })))
        }

        Request::DiscoverGossip => {
            let report = discover::gossip(state).await?;
            Ok(Some(json!(report)))
        }

        Request::DiscoverJoin {
            name,
            ip,
            port,
            token,
            role,
            signing,
        } => {
            let peer = Peer {
                ip,
                port,
                token,
                role: parse_role(role.as_deref())?,
                hook_path: "/hooks".to_string(),
                signing,
            };
            state
                .registry
                .lock()
                .await
                .upsert(&name, peer)
                .map_err(RequestError::Other)?;
            Ok(Some(json!({ "joined": name })))
        }

        Request::SessionList => {
            let sessions = state
                .sessions
                .lock()
                .await
                .list()
                .map_err(RequestError::Other)?;
            Ok(Some(json!(sessions)))
        }

        Request::SessionShow { session_key } => {
            let record = state
                .sessions
                .lock()
                .await
                .get(&session_key)
                .map_err(RequestError::Other)?
                .with_context(|| format!("unknown session: {session_key}"))?;
            let context = session_router::context_block(&record, 10);
            Ok(Some(json!({ "session": record, "context": context })))
        }

        Request::SessionSend { session_key, body } => {
            let report = session_router::send_to_session(state, &session_key, &body).await?;
            Ok(Some(json!(report)))
        }

        Request::Export { limit } => {
            let entries = state
                .audit
                .lock()
                .await
                .tail(limit.unwrap_or(200))
                .map_err(RequestError::Other)?;
            Ok(Some(json!(entries)))
        }

        Request::Shutdown => Ok(Some(json!({ "shuttingDown": true }))),
    }
}

async fn status(state: &Arc<NodeState>) -> Result<Value, RequestError> {
    let agent = state.self_name().await;
    let peers: Vec<Value> = {
        let registry = state.registry.lock().await;
        let health = state.peer_health.lock().await;
        registry
            .peers()
            .map(|(name, peer)| {
                json!({
                    "name": name,
                    "ip": &peer.ip,
                    "port": peer.port,
                    "role": peer.role,
                    "signing": peer.signing,
                    "reachable": health.is_reachable(name),
                })
            })
            .collect()
    };
    let routing = state.routing.lock().await.get().clone();
    let circuits = state.circuits.lock().await.snapshot().clone();
    let queue_size = state.dead_letters.lock().await.len();
    let stats = state.queue_stats.lock().await.get().clone();
    let conversations = state
        .conversations
        .lock()
        .await
        .list()
        .map_err(RequestError::Other)?
        .len();

    Ok(json!({
        "agent": agent,
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": mesh_proto::MESH_PROTOCOL,
        "peers": peers,
        "routing": routing,
        "circuits": circuits,
        "queue": {
            "size": queue_size,
            "totalReplayed": stats.total_replayed,
            "lastDrain": stats.last_drain,
        },
        "conversations": conversations,
        "ts": time::now_iso(),
    }))
}

fn parse_kind(s: Option<&str>) -> Result<MessageType, RequestError> {
    match s.unwrap_or("request") {
        "request" => Ok(MessageType::Request),
        "response" => Ok(MessageType::Response),
        "notification" => Ok(MessageType::Notification),
        "alert" => Ok(MessageType::Alert),
        "ack" => Ok(MessageType::Ack),
        other => Err(anyhow::anyhow!("unknown message type: {other}").into()),
    }
}

fn parse_priority(s: Option<&str>) -> Result<Priority, RequestError> {
    match s.unwrap_or("normal") {
        "high" => Ok(Priority::High),
        "normal" => Ok(Priority::Normal),
        "low" => Ok(Priority::Low),
        other => Err(anyhow::anyhow!("unknown priority: {other}").into()),
    }
}

fn parse_conv_type(s: &str) -> Result<ConversationType, RequestError> {
    match s {
        "rally" => Ok(ConversationType::Rally),
        "collab" => Ok(ConversationType::Collab),
        "escalation" => Ok(ConversationType::Escalation),
        "broadcast" => Ok(ConversationType::Broadcast),
        "opinion" => Ok(ConversationType::Opinion),
        "brainstorm" => Ok(ConversationType::Brainstorm),
        other => Err(anyhow::anyhow!("unknown conversation type: {other}").into()),
    }
}

fn parse_role(s: Option<&str>) -> Result<PeerRole, RequestError> {
    match s.unwrap_or("peer") {
        "hub" => Ok(PeerRole::Hub),
        "relay" => Ok(PeerRole::Relay),
        "sre" => Ok(PeerRole::Sre),
        "peer" => Ok(PeerRole::Peer),
        other => Err(anyhow::anyhow!("unknown role: {other}").into()),
    }
}

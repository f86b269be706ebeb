use serde::{Deserialize, Serialize};

/// Maximum size of a JSON-lines frame on the control socket (256 KiB; an
/// envelope with inline attachments can be large).
pub const MAX_LINE_BYTES: usize = 256 * 1024;

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// A request sent from the CLI to the mesh daemon over the control socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Node status: identity, routing, circuits, queue, audit counters.
    Status,

    // -- Messaging --
    /// Send one message to a peer.
    Send {
        to: String,
        #[serde(default)]
        kind: Option<String>,
        subject: String,
        body: String,
        #[serde(default)]
        priority: Option<String>,
        #[serde(default)]
        ttl: Option<u64>,
        #[serde(default)]
        encrypt: bool,
        #[serde(default)]
        attach: Vec<String>,
        #[serde(default)]
        session: Option<String>,
        #[serde(default)]
        idempotency_key: Option<String>,
    },
    /// Send a response correlated to an earlier inbound request.
    Reply {
        to: String,
        correlation_id: String,
        subject: String,
        body: String,
    },
    /// Fan a message to several peers.
    Broadcast {
        targets: Vec<String>,
        subject: String,
        body: String,
    },

    // -- Conversations --
    /// Open a rally: one question fanned to N peers.
    Rally {
        question: String,
        participants: Vec<String>,
        #[serde(default)]
        ttl: Option<u64>,
    },
    /// Open a conversation of an explicit type.
    Converse {
        conv_type: String,
        question: String,
        participants: Vec<String>,
        #[serde(default)]
        ttl: Option<u64>,
        #[serde(default)]
        ack: bool,
    },
    /// Ask a follow-up question in an existing conversation.
    FollowUp {
        conversation_id: String,
        question: String,
    },
    ConversationList,
    ConversationShow {
        conversation_id: String,
    },
    ConversationComplete {
        conversation_id: String,
        #[serde(default)]
        summary: Option<String>,
    },
    ConversationClose {
        conversation_id: String,
        #[serde(default)]
        reason: Option<String>,
    },
    ConversationCancel {
        conversation_id: String,
        #[serde(default)]
        reason: Option<String>,
    },
    /// Run the timeout sweep now.
    ConversationTimeout,
    ConversationConsensus {
        conversation_id: String,
        #[serde(default)]
        round: Option<u32>,
    },
    ConversationSearch {
        query: String,
    },

    // -- Queue --
    QueueStatus,
    QueueDrain,
    QueuePurge,

    // -- Discovery --
    DiscoverProbe,
    DiscoverStatus,
    DiscoverElect,
    DiscoverGossip,
    /// Add or update a peer in the registry.
    DiscoverJoin {
        name: String,
        ip: String,
        port: u16,
        token: String,
        #[serde(default)]
        role: Option<String>,
        #[serde(default)]
        signing: bool,
    },

    // -- Sessions --
    SessionList,
    SessionShow {
        session_key: String,
    },
    /// Fan a message to every other participant of a session.
    SessionSend {
        session_key: String,
        body: String,
    },

    /// Dump the audit log tail.
    Export {
        #[serde(default)]
        limit: Option<usize>,
    },

    /// Stop the daemon.
    Shutdown,
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

/// A response from the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// First frame on every connection.
    Hello { agent: String, version: String },
    Ok {
        #[serde(default)]
        data: Option<serde_json::Value>,
    },
    Error {
        message: String,
        /// Error kind from the delivery taxonomy, when one applies.
        #[serde(default)]
        kind: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_wire_shape() {
        let req = Request::Rally {
            question: "count tanks".into(),
            participants: vec!["bravo".into(), "charlie".into()],
            ttl: Some(300),
        };
        let wire = serde_json::to_string(&req).unwrap();
        assert!(wire.contains("\"type\":\"rally\""));
        let back: Request = serde_json::from_str(&wire).unwrap();
        assert!(matches!(back, Request::Rally { ttl: Some(300), .. }));
    }

    #[test]
    fn optional_fields_default() {
        let req: Request =
            serde_json::from_str(r#"{"type":"send","to":"bravo","subject":"s","body":"b"}"#)
                .unwrap();
        match req {
            Request::Send { encrypt, attach, kind, .. } => {
                assert!(!encrypt);
                assert!(attach.is_empty());
                assert!(kind.is_none());
            }
            _ => panic!("expected Send"),
        }
    }

    #[test]
    fn error_response_carries_kind() {
        let resp = Response::Error {
            message: "unknown peer: x".into(),
            kind: Some("unknown_peer".into()),
        };
        let wire = serde_json::to_string(&resp).unwrap();
        let back: Response = serde_json::from_str(&wire).unwrap();
        match back {
            Response::Error { kind, .. } => assert_eq!(kind.as_deref(), Some("unknown_peer")),
            _ => panic!("expected Error"),
        }
    }
}

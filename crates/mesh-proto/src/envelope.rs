use crate::{MESH_PROTOCOL, ids, time};
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

/// Default envelope time-to-live in seconds.
pub const DEFAULT_TTL_SECS: u64 = 300;

/// Message kind carried in the envelope `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Request,
    Response,
    Notification,
    Alert,
    Ack,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Request => "request",
            MessageType::Response => "response",
            MessageType::Notification => "notification",
            MessageType::Alert => "alert",
            MessageType::Ack => "ack",
        }
    }
}

/// Delivery priority hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

/// Where the receiver must POST a response, with the bearer token to use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyTo {
    pub url: String,
    pub token: String,
}

/// End-to-end session traceability tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionTag {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

/// Relay wrap applied when a message is delivered through an elected relay
/// instead of directly. At most one hop: an envelope that already carries a
/// hint is never relayed again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayHint {
    pub from: String,
    pub via: String,
    pub original_to: String,
}

/// A message attachment. Files below the inline threshold travel as base64;
/// larger ones are served from a scoped static server and referenced by URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum Attachment {
    Url {
        url: String,
        mime_type: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        size: Option<u64>,
    },
    Inline {
        encoding: String,
        data: String,
        mime_type: String,
        size: u64,
    },
    Path {
        path: String,
        mime_type: String,
    },
}

/// The business payload of an envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub subject: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub encrypted: bool,
}

impl Payload {
    pub fn new(subject: &str, body: &str) -> Self {
        Self {
            subject: subject.to_string(),
            body: body.to_string(),
            attachments: Vec::new(),
            metadata: None,
            encrypted: false,
        }
    }
}

/// The on-wire unit: one inter-agent message.
///
/// Field order is load-bearing for signatures: the signed byte sequence is
/// the compact JSON encoding of this struct with `signature` absent, so both
/// sides must serialize with the same declaration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub protocol: String,
    pub id: String,
    pub timestamp: String,
    pub from: String,
    pub to: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_seq: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplyTo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_context: Option<serde_json::Value>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default = "default_ttl")]
    pub ttl: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionTag>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relay: Option<RelayHint>,
    pub payload: Payload,
}

fn default_ttl() -> u64 {
    DEFAULT_TTL_SECS
}

impl Envelope {
    /// New envelope with a fresh id, nonce and current timestamp. Optional
    /// routing fields start empty; the send pipeline fills what it needs.
    pub fn new(from: &str, to: &str, kind: MessageType, subject: &str, body: &str) -> Self {
        Self {
            protocol: MESH_PROTOCOL.to_string(),
            id: ids::message_id(),
            timestamp: time::now_iso(),
            from: from.to_string(),
            to: to.to_string(),
            kind,
            correlation_id: None,
            conversation_id: None,
            conversation_seq: None,
            parent_message_id: None,
            reply_to: None,
            reply_context: None,
            priority: Priority::Normal,
            ttl: DEFAULT_TTL_SECS,
            idempotency_key: None,
            nonce: Some(ids::nonce()),
            signature: None,
            session: None,
            relay: None,
            payload: Payload::new(subject, body),
        }
    }

    /// Build the response to an inbound request: correlation id set to the
    /// request id, `replyContext` echoed verbatim, session tag carried over.
    pub fn response_to(&self, from: &str, subject: &str, body: &str) -> Self {
        let mut resp = Envelope::new(from, &self.from, MessageType::Response, subject, body);
        resp.correlation_id = Some(self.id.clone());
        resp.conversation_id = self.conversation_id.clone();
        resp.parent_message_id = Some(self.id.clone());
        resp.reply_context = self.reply_context.clone();
        resp.session = self.session.clone();
        resp
    }

    /// Parse an envelope from its wire JSON string.
    pub fn parse(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).context("invalid envelope JSON")
    }

    /// Serialize to the wire form.
    pub fn to_wire(&self) -> Result<String> {
        serde_json::to_string(self).context("envelope serialization failed")
    }

    /// Structural invariants every envelope must satisfy before it goes on
    /// the wire or gets dispatched.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            bail!("envelope id is empty");
        }
        if self.timestamp.is_empty() || time::parse_iso(&self.timestamp).is_none() {
            bail!("envelope timestamp is missing or unparseable");
        }
        if self.from.is_empty() {
            bail!("envelope from is empty");
        }
        if self.to.is_empty() {
            bail!("envelope to is empty");
        }
        if self.payload.subject.is_empty() {
            bail!("envelope payload.subject is empty");
        }
        match self.kind {
            MessageType::Response => {
                if self.correlation_id.as_deref().unwrap_or("").is_empty() {
                    bail!("response envelope is missing correlationId");
                }
            }
            MessageType::Request => {
                let reply_to = self
                    .reply_to
                    .as_ref()
                    .context("request envelope is missing replyTo")?;
                if !reply_to.url.starts_with("http://") && !reply_to.url.starts_with("https://") {
                    bail!("replyTo.url is not an absolute HTTP URL: {}", reply_to.url);
                }
                if reply_to.token.is_empty() {
                    bail!("replyTo.token is empty");
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Epoch-millisecond instant at which this envelope expires, if its
    /// timestamp parses.
    pub fn expires_at_ms(&self) -> Option<u64> {
        time::parse_iso(&self.timestamp).map(|ts| ts + self.ttl * 1000)
    }

    /// Whether `timestamp + ttl` has passed. Unparseable timestamps count as
    /// expired: an envelope with no usable clock reference is undeliverable.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        match self.expires_at_ms() {
            Some(deadline) => deadline < now_ms,
            None => true,
        }
    }

    /// The `sessionKey` this envelope participates in, from either the
    /// session tag or the caller-supplied reply context.
    pub fn session_key(&self) -> Option<&str> {
        if let Some(session) = &self.session {
            return Some(session.key.as_str());
        }
        self.reply_context
            .as_ref()
            .and_then(|ctx| ctx.get("sessionKey"))
            .and_then(|v| v.as_str())
    }
}

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mesh_client::protocol::Request;
use mesh_client::NodeClient;
use mesh_proto::paths::default_socket_path;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "mesh", version, about = "MESH operator CLI")]
struct Cli {
    /// Path to the mesh daemon's control socket.
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Send a message to a peer.
    Send {
        /// Recipient agent name.
        to: String,
        /// Message body.
        body: String,
        /// Message subject.
        #[arg(long, default_value = "message")]
        subject: String,
        /// Message type: request, notification, alert, ack.
        #[arg(long = "type")]
        kind: Option<String>,
        /// Priority: high, normal, low.
        #[arg(long)]
        priority: Option<String>,
        /// Time-to-live in seconds.
        #[arg(long)]
        ttl: Option<u64>,
        /// Encrypt the body with the shared peer (or fleet) key.
        #[arg(long)]
        encrypt: bool,
        /// Attach a file (repeatable).
        #[arg(long)]
        attach: Vec<String>,
        /// Session key to tag the message with.
        #[arg(long)]
        session: Option<String>,
        /// Application-level idempotency key.
        #[arg(long)]
        idempotency_key: Option<String>,
    },
    /// Reply to an earlier request.
    Reply {
        /// Recipient agent name.
        to: String,
        /// Message id of the request being answered.
        correlation_id: String,
        /// Response body.
        body: String,
        /// Response subject.
        #[arg(long, default_value = "reply")]
        subject: String,
    },
    /// Fan one question to several peers and collect responses.
    Rally {
        /// The question to ask.
        question: String,
        /// Participant agent names (repeatable).
        #[arg(long = "to", required = true)]
        participants: Vec<String>,
        /// Conversation TTL in seconds.
        #[arg(long)]
        ttl: Option<u64>,
    },
    /// Open a conversation of an explicit type.
    Converse {
        /// Conversation type: rally, collab, escalation, broadcast,
        /// opinion, brainstorm.
        conv_type: String,
        /// The question or opening message.
        question: String,
        /// Participant agent names (repeatable).
        #[arg(long = "to", required = true)]
        participants: Vec<String>,
        /// Conversation TTL in seconds.
        #[arg(long)]
        ttl: Option<u64>,
        /// For broadcast: request acknowledgements.
        #[arg(long)]
        ack: bool,
    },
    /// Dead-letter queue operations.
    Queue {
        #[command(subcommand)]
        command: QueueCommand,
    },
    /// Peer discovery and relay election.
    Discover {
        #[command(subcommand)]
        command: DiscoverCommand,
    },
    /// Conversation lifecycle operations.
    Conversation {
        #[command(subcommand)]
        command: ConversationCommand,
    },
    /// Session operations.
    Session {
        #[command(subcommand)]
        command: SessionCommand,
    },
    /// Node status summary.
    Status,
    /// Dump the audit log tail.
    Export {
        /// Number of entries.
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Stop the daemon.
    Down,
}

#[derive(Subcommand)]
enum QueueCommand {
    /// Show queued dead letters and drain counters.
    Status,
    /// Run a drain pass now.
    Drain,
    /// Drop every queued dead letter.
    Purge,
}

#[derive(Subcommand)]
enum DiscoverCommand {
    /// Probe every peer and record reachability.
    Probe,
    /// Show peer health and the routing table.
    Status,
    /// Probe, then re-run relay election.
    Elect,
    /// Broadcast routing hints to reachable peers.
    Gossip,
    /// Add or update a peer in the registry.
    Join {
        /// Agent name.
        name: String,
        /// Peer IP address.
        ip: String,
        /// Peer webhook port.
        port: u16,
        /// Bearer token for the peer's hooks.
        token: String,
        /// Role: hub, relay, sre, peer.
        #[arg(long)]
        role: Option<String>,
        /// Require signed envelopes to this peer.
        #[arg(long)]
        signing: bool,
    },
}

#[derive(Subcommand)]
enum ConversationCommand {
    /// List active conversations.
    List,
    /// Show one conversation in full.
    Show { conversation_id: String },
    /// Ask a follow-up question with shared context.
    FollowUp {
        conversation_id: String,
        question: String,
    },
    /// Mark a conversation complete.
    Complete {
        conversation_id: String,
        #[arg(long)]
        summary: Option<String>,
    },
    /// Close a conversation.
    Close {
        conversation_id: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Cancel a conversation.
    Cancel {
        conversation_id: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Run the timeout sweep now.
    Timeout,
    /// Compare responses within a round.
    Consensus {
        conversation_id: String,
        #[arg(long)]
        round: Option<u32>,
    },
    /// Search conversations by substring.
    Search { query: String },
}

#[derive(Subcommand)]
enum SessionCommand {
    /// List known sessions.
    List,
    /// Show one session with its context block.
    Show { session_key: String },
    /// Send to every other participant of a session.
    Send { session_key: String, body: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let socket_path = cli.socket.unwrap_or_else(default_socket_path);

    let request = match cli.command {
        Command::Send {
            to,
            body,
            subject,
            kind,
            priority,
            ttl,
            encrypt,
            attach,
            session,
            idempotency_key,
        } => Request::Send {
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
        },
        Command::Reply {
            to,
            correlation_id,
            body,
            subject,
        } => Request::Reply {
            to,
            correlation_id,
            subject,
            body,
        },
        Command::Rally {
            question,
            participants,
            ttl,
        } => Request::Rally {
            question,
            participants,
            ttl,
        },
        Command::Converse {
            conv_type,
            question,
            participants,
            ttl,
            ack,
        } => Request::Converse {
            conv_type,
            question,
            participants,
            ttl,
            ack,
        },
        Command::Queue { command } => match command {
            QueueCommand::Status => Request::QueueStatus,
            QueueCommand::Drain => Request::QueueDrain,
            QueueCommand::Purge => Request::QueuePurge,
        },
        Command::Discover { command } => match command {
            DiscoverCommand::Probe => Request::DiscoverProbe,
            DiscoverCommand::Status => Request::DiscoverStatus,
            DiscoverCommand::Elect => Request::DiscoverElect,
            DiscoverCommand::Gossip => Request::DiscoverGossip,
            DiscoverCommand::Join {
                name,
                ip,
                port,
                token,
                role,
                signing,
            } => Request::DiscoverJoin {
                name,
                ip,
                port,
                token,
                role,
                signing,
            },
        },
        Command::Conversation { command } => match command {
            ConversationCommand::List => Request::ConversationList,
            ConversationCommand::Show { conversation_id } => {
                Request::ConversationShow { conversation_id }
            }
            ConversationCommand::FollowUp {
                conversation_id,
                question,
            } => Request::FollowUp {
                conversation_id,
                question,
            },
            ConversationCommand::Complete {
                conversation_id,
                summary,
            } => Request::ConversationComplete {
                conversation_id,
                summary,
            },
            ConversationCommand::Close {
                conversation_id,
                reason,
            } => Request::ConversationClose {
                conversation_id,
                reason,
            },
            ConversationCommand::Cancel {
                conversation_id,
                reason,
            } => Request::ConversationCancel {
                conversation_id,
                reason,
            },
            ConversationCommand::Timeout => Request::ConversationTimeout,
            ConversationCommand::Consensus {
                conversation_id,
                round,
            } => Request::ConversationConsensus {
                conversation_id,
                round,
            },
            ConversationCommand::Search { query } => Request::ConversationSearch { query },
        },
        Command::Session { command } => match command {
            SessionCommand::List => Request::SessionList,
            SessionCommand::Show { session_key } => Request::SessionShow { session_key },
            SessionCommand::Send { session_key, body } => {
                Request::SessionSend { session_key, body }
            }
        },
        Command::Status => Request::Status,
        Command::Export { limit } => Request::Export { limit },
        Command::Down => Request::Shutdown,
    };

    let mut client = NodeClient::connect(&socket_path)
        .await
        .context("is meshd running?")?;
    let data = client.request(&request).await?;
    if let Some(data) = data {
        println!("{}", serde_json::to_string_pretty(&data)?);
    }
    Ok(())
}

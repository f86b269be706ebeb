use crate::retry::RetryPolicy;
use anyhow::{Context, Result};
use mesh_proto::paths::MeshPaths;
use mesh_store::audit::{AuditLog, OpsLog};
use mesh_store::circuit::CircuitStore;
use mesh_store::conversation::ConversationStore;
use mesh_store::dead_letter::DeadLetterStore;
use mesh_store::keys::KeyStore;
use mesh_store::nonce::NonceLog;
use mesh_store::peer_health::PeerHealthStore;
use mesh_store::queue_stats::QueueStatsStore;
use mesh_store::registry::{Peer, Registry};
use mesh_store::routing::RoutingStore;
use mesh_store::session::SessionStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// HTTP connect timeout for peer deliveries.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Total HTTP timeout for peer deliveries.
pub const TOTAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Daemon configuration resolved from CLI args.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub paths: MeshPaths,
    /// Webhook listen address.
    pub listen: String,
    /// Host-runtime handler command; envelope JSON on stdin, response body
    /// on stdout. `None` runs the node in inbox mode.
    pub handler: Option<String>,
    /// Reject unsigned envelopes from `signing=true` senders.
    pub require_signed: bool,
    /// Fail sends instead of falling back to plaintext when encryption
    /// breaks.
    pub strict_crypto: bool,
    /// Dashboard notification sink port; `None` disables the sink.
    pub dashboard_port: Option<u16>,
    pub retry: RetryPolicy,
    pub drain_interval: Duration,
    pub probe_interval: Duration,
    pub sweep_interval: Duration,
    pub session_cleanup_interval: Duration,
    pub session_idle_ttl: Duration,
    /// Pause between queue replays so a recovering peer is not hammered.
    pub replay_spacing: Duration,
    pub max_queue: usize,
}

/// Everything the daemon's tasks share. Stores are node-local files guarded
/// by per-store mutexes; the HTTP client is shared across all deliveries.
pub struct NodeState {
    pub config: NodeConfig,
    pub registry: Mutex<Registry>,
    pub signing_keys: KeyStore,
    pub encryption_keys: KeyStore,
    pub circuits: Mutex<CircuitStore>,
    pub dead_letters: Mutex<DeadLetterStore>,
    pub nonces: Mutex<NonceLog>,
    pub peer_health: Mutex<PeerHealthStore>,
    pub routing: Mutex<RoutingStore>,
    pub conversations: Mutex<ConversationStore>,
    pub sessions: Mutex<SessionStore>,
    pub queue_stats: Mutex<QueueStatsStore>,
    pub audit: Mutex<AuditLog>,
    pub replay_log: OpsLog,
    pub discover_log: OpsLog,
    pub http: reqwest::Client,
}

impl NodeState {
    /// Load every store from the state root and build the shared state.
    pub fn load(config: NodeConfig) -> Result<Arc<Self>> {
        let paths = &config.paths;
        paths.ensure().context("failed to create MESH home layout")?;

        let registry = Registry::load(&paths.identity_file(), &paths.registry_file())
            .context("failed to load registry (create config/identity first)")?;

        let state = Self {
            signing_keys: KeyStore::new(paths.signing_keys_dir()),
            encryption_keys: KeyStore::new(paths.encryption_keys_dir()),
            circuits: Mutex::new(CircuitStore::load(&paths.circuit_file())?),
            dead_letters: Mutex::new(DeadLetterStore::load_with_capacity(
                &paths.dead_letter_file(),
                config.max_queue,
            )?),
            nonces: Mutex::new(NonceLog::load(&paths.nonce_log_file())?),
            peer_health: Mutex::new(PeerHealthStore::load(&paths.peer_health_file())?),
            routing: Mutex::new(RoutingStore::load(
                &paths.routing_file(),
                registry.self_name(),
            )?),
            conversations: Mutex::new(ConversationStore::new(
                paths.conversations_dir(),
                paths.conversations_archive_dir(),
            )),
            sessions: Mutex::new(SessionStore::new(paths.sessions_dir())),
            queue_stats: Mutex::new(QueueStatsStore::load(&paths.queue_state_file())?),
            audit: Mutex::new(AuditLog::new(paths.audit_log_file())),
            replay_log: OpsLog::new(paths.queue_replay_log_file()),
            discover_log: OpsLog::new(paths.discover_log_file()),
            registry: Mutex::new(registry),
            http: reqwest::Client::builder()
                .connect_timeout(CONNECT_TIMEOUT)
                .timeout(TOTAL_TIMEOUT)
                .build()
                .context("failed to build HTTP client")?,
            config,
        };
        Ok(Arc::new(state))
    }

    pub async fn self_name(&self) -> String {
        self.registry.lock().await.self_name().to_string()
    }

    /// This node's own registry entry, needed to build `replyTo`.
    pub async fn self_peer(&self) -> Option<Peer> {
        self.registry.lock().await.self_peer().cloned()
    }

    /// Resolve a peer entry by name.
    pub async fn peer(&self, name: &str) -> Option<Peer> {
        self.registry.lock().await.peer(name).cloned()
    }

    /// The bearer token peers must present when posting to our hooks.
    pub async fn self_token(&self) -> Option<String> {
        self.self_peer().await.map(|p| p.token)
    }
}

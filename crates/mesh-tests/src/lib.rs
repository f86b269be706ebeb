//! Multi-node test harness: temp state dirs, ephemeral webhook ports, and
//! registries wired across every node in the mesh.

use anyhow::{Context, Result};
use mesh_node::hooks;
use mesh_node::retry::RetryPolicy;
use mesh_node::state::{NodeConfig, NodeState};
use mesh_proto::paths::MeshPaths;
use mesh_store::audit::AuditEntry;
use mesh_store::registry::PeerRole;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::task::JoinHandle;

/// Fast retry schedule for tests: four attempts, barely spaced.
pub const FAST_RETRIES: [u64; 4] = [0, 50, 50, 50];

/// Declarative description of one node in a test mesh.
pub struct NodeSpec {
    pub name: String,
    pub handler: Option<String>,
    pub role: PeerRole,
    pub signing: bool,
    pub start: bool,
    pub retry_delays_ms: Vec<u64>,
    pub require_signed: bool,
}

impl NodeSpec {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            handler: None,
            role: PeerRole::Peer,
            signing: false,
            start: true,
            retry_delays_ms: FAST_RETRIES.to_vec(),
            require_signed: false,
        }
    }

    /// Host handler command for this node.
    pub fn handler(mut self, command: &str) -> Self {
        self.handler = Some(command.to_string());
        self
    }

    pub fn role(mut self, role: PeerRole) -> Self {
        self.role = role;
        self
    }

    /// Mark this node as requiring signed envelopes (registry flag).
    pub fn signing(mut self) -> Self {
        self.signing = true;
        self
    }

    /// Allocate the node but do not start its webhook server.
    pub fn down(mut self) -> Self {
        self.start = false;
        self
    }

    pub fn retries(mut self, delays_ms: &[u64]) -> Self {
        self.retry_delays_ms = delays_ms.to_vec();
        self
    }

    pub fn require_signed(mut self) -> Self {
        self.require_signed = true;
        self
    }
}

/// A node in the test mesh. The webhook server runs only while `started`;
/// the state directory survives either way so a node can come up later.
pub struct TestNode {
    pub name: String,
    pub port: u16,
    pub token: String,
    pub paths: MeshPaths,
    state: Option<Arc<NodeState>>,
    server: Option<JoinHandle<()>>,
    config: NodeConfig,
    _home: TempDir,
}

impl TestNode {
    pub fn state(&self) -> &Arc<NodeState> {
        self.state.as_ref().expect("node not started")
    }

    /// Bring the node up on its reserved port (used to simulate recovery).
    pub async fn start(&mut self) -> Result<()> {
        if self.server.is_some() {
            return Ok(());
        }
        let state = NodeState::load(self.config.clone())?;
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", self.port))
            .await
            .with_context(|| format!("failed to bind test node port {}", self.port))?;
        let app = hooks::router(state.clone());
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        self.state = Some(state);
        self.server = Some(handle);
        Ok(())
    }

    /// The node's webhook URL for a given sender path segment.
    pub fn hook_url(&self, sender: &str) -> String {
        format!("http://127.0.0.1:{}/hooks/{sender}", self.port)
    }

    /// Read this node's audit log from disk.
    pub fn audit_entries(&self) -> Vec<AuditEntry> {
        let path = self.paths.audit_log_file();
        let Ok(data) = std::fs::read_to_string(&path) else {
            return Vec::new();
        };
        data.lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect()
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        if let Some(handle) = self.server.take() {
            handle.abort();
        }
    }
}

/// Build a wired mesh: every node's registry lists every other node, with
/// shared pairwise signing keys where a target requires signatures.
pub async fn spawn_mesh(specs: Vec<NodeSpec>) -> Result<Vec<TestNode>> {
    // Reserve a distinct localhost port per node up front; registries need
    // every address before any node starts.
    let mut reserved = Vec::with_capacity(specs.len());
    for spec in &specs {
        let listener =
            std::net::TcpListener::bind("127.0.0.1:0").context("failed to reserve test port")?;
        let port = listener.local_addr()?.port();
        drop(listener);
        reserved.push((spec.name.clone(), port, format!("tok_{}", spec.name)));
    }

    let registry_json = json!({
        "agents": specs
            .iter()
            .zip(&reserved)
            .map(|(spec, (name, port, token))| {
                (
                    name.clone(),
                    json!({
                        "ip": "127.0.0.1",
                        "port": port,
                        "token": token,
                        "role": role_str(spec.role),
                        "hookPath": "/hooks",
                        "signing": spec.signing,
                    }),
                )
            })
            .collect::<serde_json::Map<String, serde_json::Value>>(),
    });

    // One symmetric key per unordered pair involving a signing target.
    let mut pair_keys: Vec<(String, String, [u8; 32])> = Vec::new();
    for (i, a) in specs.iter().enumerate() {
        for b in specs.iter().skip(i + 1) {
            if a.signing || b.signing {
                let mut key = [0u8; 32];
                let hex = mesh_proto::ids::random_hex(32);
                key.copy_from_slice(&mesh_proto::ids::from_hex(&hex)?);
                pair_keys.push((a.name.clone(), b.name.clone(), key));
            }
        }
    }

    let mut nodes = Vec::with_capacity(specs.len());
    for (spec, (name, port, token)) in specs.into_iter().zip(reserved) {
        let home = TempDir::new()?;
        let paths = MeshPaths::new(home.path().to_path_buf());
        paths.ensure()?;

        std::fs::write(paths.identity_file(), format!("{name}\n"))?;
        std::fs::write(
            paths.registry_file(),
            serde_json::to_string_pretty(&registry_json)?,
        )?;
        for (a, b, key) in &pair_keys {
            let other = if *a == name {
                Some(b)
            } else if *b == name {
                Some(a)
            } else {
                None
            };
            if let Some(other) = other {
                std::fs::write(
                    paths.signing_keys_dir().join(format!("{other}.key")),
                    mesh_proto::ids::to_hex(key),
                )?;
            }
        }

        let config = NodeConfig {
            paths: paths.clone(),
            listen: format!("127.0.0.1:{port}"),
            handler: spec.handler.clone(),
            require_signed: spec.require_signed,
            strict_crypto: false,
            dashboard_port: None,
            retry: RetryPolicy::new(spec.retry_delays_ms.clone()),
            // Periodic work is driven explicitly by the tests.
            drain_interval: Duration::from_secs(3600),
            probe_interval: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(3600),
            session_cleanup_interval: Duration::from_secs(3600),
            session_idle_ttl: Duration::from_secs(86_400),
            replay_spacing: Duration::from_millis(10),
            max_queue: 100,
        };

        let mut node = TestNode {
            name,
            port,
            token,
            paths,
            state: None,
            server: None,
            config,
            _home: home,
        };
        if spec.start {
            node.start().await?;
        }
        nodes.push(node);
    }
    Ok(nodes)
}

fn role_str(role: PeerRole) -> &'static str {
    match role {
        PeerRole::Hub => "hub",
        PeerRole::Relay => "relay",
        PeerRole::Sre => "sre",
        PeerRole::Peer => "peer",
    }
}

/// Poll a condition until it holds or the timeout elapses.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

/// POST a raw webhook body the way a peer would.
pub async fn post_hook(
    url: &str,
    token: &str,
    body: &serde_json::Value,
) -> Result<(u16, serde_json::Value)> {
    let client = reqwest::Client::new();
    let resp = client
        .post(url)
        .header("Authorization", format!("Bearer {token}"))
        .json(body)
        .send()
        .await?;
    let code = resp.status().as_u16();
    let body = resp.json().await.unwrap_or(serde_json::Value::Null);
    Ok((code, body))
}

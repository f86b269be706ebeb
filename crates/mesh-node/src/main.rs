use anyhow::{Context, Result};
use clap::Parser;
use mesh_node::retry::RetryPolicy;
use mesh_node::state::{NodeConfig, NodeState};
use mesh_node::{control, convo, discover, drain, hooks, session_router};
use mesh_proto::paths::{self, MeshPaths};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Parser, Debug)]
#[command(name = "meshd", version, about = "MESH inter-agent messaging daemon")]
struct Args {
    /// MESH home directory (default: $MESH_HOME or ~/.mesh).
    #[arg(long)]
    home: Option<PathBuf>,

    /// Path to the control socket.
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Webhook listen address.
    #[arg(long, default_value = "0.0.0.0:8900")]
    listen: String,

    /// Host-runtime handler command. Receives the envelope JSON on stdin;
    /// stdout becomes the response body. Without one the node runs in
    /// inbox mode.
    #[arg(long)]
    handler: Option<String>,

    /// Reject unsigned envelopes from senders marked `signing` in the
    /// registry.
    #[arg(long)]
    require_signed: bool,

    /// Fail sends instead of falling back to plaintext when encryption
    /// breaks.
    #[arg(long)]
    strict_crypto: bool,

    /// Dashboard notification sink port.
    #[arg(long, default_value = "8880")]
    dashboard_port: u16,

    /// Disable the dashboard notification sink.
    #[arg(long)]
    no_dashboard: bool,

    /// Retry delays in seconds, comma-separated.
    #[arg(long, default_value = "0,5,15,60")]
    retry_delays: String,

    /// Queue drain interval in seconds.
    #[arg(long, default_value = "60")]
    drain_interval_secs: u64,

    /// Spacing between queue replays in milliseconds.
    #[arg(long, default_value = "1000")]
    replay_spacing_ms: u64,

    /// Peer probe + election interval in seconds.
    #[arg(long, default_value = "120")]
    probe_interval_secs: u64,

    /// Conversation timeout sweep interval in seconds.
    #[arg(long, default_value = "30")]
    sweep_interval_secs: u64,

    /// Session cleanup interval in seconds.
    #[arg(long, default_value = "3600")]
    session_cleanup_interval_secs: u64,

    /// Session idle TTL in seconds.
    #[arg(long, default_value = "86400")]
    session_idle_ttl_secs: u64,

    /// Dead-letter queue bound.
    #[arg(long, default_value = "100")]
    max_queue: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "meshd=info".into()),
        )
        .init();

    let args = Args::parse();

    let home = match args.home {
        Some(home) => home,
        None => paths::mesh_home().context("failed to resolve MESH home")?,
    };
    let socket_path = args.socket.unwrap_or_else(paths::default_socket_path);

    let retry_delays: Vec<u64> = args
        .retry_delays
        .split(',')
        .map(|s| {
            s.trim()
                .parse::<u64>()
                .map(|secs| secs * 1000)
                .with_context(|| format!("invalid retry delay: {s}"))
        })
        .collect::<Result<_>>()?;

    let config = NodeConfig {
        paths: MeshPaths::new(home),
        listen: args.listen.clone(),
        handler: args.handler,
        require_signed: args.require_signed,
        strict_crypto: args.strict_crypto,
        dashboard_port: (!args.no_dashboard).then_some(args.dashboard_port),
        retry: RetryPolicy::new(retry_delays),
        drain_interval: Duration::from_secs(args.drain_interval_secs),
        probe_interval: Duration::from_secs(args.probe_interval_secs),
        sweep_interval: Duration::from_secs(args.sweep_interval_secs),
        session_cleanup_interval: Duration::from_secs(args.session_cleanup_interval_secs),
        session_idle_ttl: Duration::from_secs(args.session_idle_ttl_secs),
        replay_spacing: Duration::from_millis(args.replay_spacing_ms),
        max_queue: args.max_queue,
    };

    let state = NodeState::load(config)?;
    let agent = state.self_name().await;
    tracing::info!(agent = %agent, listen = %args.listen, "mesh node starting");

    // Periodic tasks share the daemon's scheduler.
    tokio::spawn(drain::run_loop(state.clone()));
    tokio::spawn(discover::run_loop(state.clone()));
    tokio::spawn(convo::run_sweep_loop(state.clone()));
    tokio::spawn(session_router::run_cleanup_loop(state.clone()));

    // Webhook server.
    let listener = tokio::net::TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    let app = hooks::router(state.clone());
    let webhook = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(err = %e, "webhook server failed");
        }
    });

    // Control socket, with a channel for CLI-initiated shutdown.
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
    let control_state = state.clone();
    let control_socket = socket_path.clone();
    tokio::spawn(async move {
        if let Err(e) = control::serve(control_state, &control_socket, shutdown_tx).await {
            tracing::error!(err = %e, "control socket failed");
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, shutting down");
        }
        _ = shutdown_rx.recv() => {
            tracing::info!("shutdown requested over control socket");
        }
    }

    webhook.abort();
    std::fs::remove_file(&socket_path).ok();
    tracing::info!("mesh node shut down");
    Ok(())
}

use crate::state::NodeState;
use anyhow::{Context, Result};
use axum::Router;
use axum::routing::get;
use base64::Engine;
use mesh_proto::envelope::Attachment;
use std::path::Path;
use std::time::Duration;

/// Files at or above this size are served by URL instead of inlined.
pub const INLINE_LIMIT: u64 = 64 * 1024;

/// Lifetime of a scoped attachment server.
pub const SCOPED_SERVER_TTL: Duration = Duration::from_secs(300);

/// Turn operator-supplied file paths into wire attachments. Small files are
/// inlined base64; large ones get a scoped local HTTP server for a bounded
/// lifetime and travel as URLs.
pub async fn build_attachments(state: &NodeState, paths: &[String]) -> Result<Vec<Attachment>> {
    let mut attachments = Vec::with_capacity(paths.len());
    for raw in paths {
        let path = Path::new(raw);
        let meta = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("attachment not found: {raw}"))?;
        let mime = mime_for(path);
        if meta.len() < INLINE_LIMIT {
            let data = tokio::fs::read(path)
                .await
                .with_context(|| format!("failed to read attachment {raw}"))?;
            attachments.push(Attachment::Inline {
                encoding: "base64".to_string(),
                data: base64::engine::general_purpose::STANDARD.encode(&data),
                mime_type: mime.to_string(),
                size: meta.len(),
            });
        } else {
            let url = serve_scoped(state, path).await?;
            attachments.push(Attachment::Url {
                url,
                mime_type: mime.to_string(),
                size: Some(meta.len()),
            });
        }
    }
    Ok(attachments)
}

/// Serve one file over HTTP from an ephemeral port for a bounded lifetime.
/// The server future is raced against the TTL sleep inside one task, so the
/// listener is torn down on expiry, serve error, or runtime shutdown alike.
async fn serve_scoped(state: &NodeState, path: &Path) -> Result<String> {
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read attachment {}", path.display()))?;
    let token = mesh_proto::ids::random_hex(8);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", 0))
        .await
        .context("failed to bind scoped attachment server")?;
    let port = listener.local_addr()?.port();

    let route = format!("/files/{token}");
    let app = Router::new().route(
        &route,
        get(move || {
            let data = data.clone();
            async move { data }
        }),
    );

    tokio::spawn(async move {
        tokio::select! {
            result = axum::serve(listener, app) => {
                if let Err(e) = result {
                    tracing::warn!(err = %e, "scoped attachment server failed");
                }
            }
            _ = tokio::time::sleep(SCOPED_SERVER_TTL) => {
                tracing::debug!(port, "scoped attachment server expired");
            }
        }
    });

    let host = state
        .self_peer()
        .await
        .map(|p| p.ip)
        .unwrap_or_else(|| "127.0.0.1".to_string());
    Ok(format!("http://{host}:{port}/files/{token}"))
}

fn mime_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase()
        .as_str()
    {
        "txt" | "md" | "log" => "text/plain",
        "json" | "jsonl" => "application/json",
        "html" => "text/html",
        "csv" => "text/csv",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "pdf" => "application/pdf",
        "tar" => "application/x-tar",
        "gz" => "application/gzip",
        "zip" => "application/zip",
        _ => "application/octet-stream",
    }
}

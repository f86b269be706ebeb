use crate::protocol::{MAX_LINE_BYTES, Request, Response};
use anyhow::{Context, Result, anyhow, bail};
use futures_util::{SinkExt, StreamExt};
use std::path::Path;
use tokio::net::UnixStream;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

/// Client for the mesh daemon's control socket.
pub struct NodeClient {
    reader: FramedRead<tokio::net::unix::OwnedReadHalf, LinesCodec>,
    writer: FramedWrite<tokio::net::unix::OwnedWriteHalf, LinesCodec>,
    agent: String,
}

impl NodeClient {
    /// Connect to the daemon at the given socket path. Waits for the Hello
    /// frame before returning.
    pub async fn connect(socket_path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(socket_path)
            .await
            .with_context(|| format!("failed to connect to {}", socket_path.display()))?;
        let (r, w) = stream.into_split();
        let reader = FramedRead::new(r, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
        let writer = FramedWrite::new(w, LinesCodec::new_with_max_length(MAX_LINE_BYTES));

        let mut client = Self {
            reader,
            writer,
            agent: String::new(),
        };

        match client.next_response().await? {
            Response::Hello { agent, .. } => {
                client.agent = agent;
                Ok(client)
            }
            other => Err(anyhow!("expected Hello, got {other:?}")),
        }
    }

    /// The agent name received in the Hello handshake.
    pub fn agent(&self) -> &str {
        &self.agent
    }

    pub async fn send(&mut self, req: &Request) -> Result<()> {
        let line = serde_json::to_string(req)?;
        self.writer.send(line).await?;
        Ok(())
    }

    pub async fn next_response(&mut self) -> Result<Response> {
        let Some(line) = self.reader.next().await else {
            bail!("daemon disconnected");
        };
        Ok(serde_json::from_str(&line?)?)
    }

    /// Send a request and wait for its Ok/Error response.
    pub async fn request(&mut self, req: &Request) -> Result<Option<serde_json::Value>> {
        self.send(req).await?;
        loop {
            match self.next_response().await? {
                Response::Hello { .. } => continue,
                Response::Ok { data } => return Ok(data),
                Response::Error { message, kind } => match kind {
                    Some(kind) => bail!("{kind}: {message}"),
                    None => bail!("{message}"),
                },
            }
        }
    }
}

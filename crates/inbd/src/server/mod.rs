//! Local request server.
//!
//! Newline-delimited JSON over a Unix socket: each line is one [`Command`],
//! each reply one [`UpdateResponse`](crate::request::UpdateResponse) line.

mod handler;

pub use handler::{Command, dispatch, handle_line};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

use inbd_core::CommandRunner;

use crate::disk::DiskProbe;
use crate::pipeline::Orchestrator;

/// Default socket path.
pub const DEFAULT_SOCKET: &str = "/run/inbd.sock";

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Unix-socket front end for an [`Orchestrator`].
pub struct RequestServer<R, P> {
    orchestrator: Arc<Orchestrator<R, P>>,
    listener: UnixListener,
    path: PathBuf,
}

impl<R, P> RequestServer<R, P>
where
    R: CommandRunner + 'static,
    P: DiskProbe + 'static,
{
    /// Bind `path`, replacing a stale socket left by a previous run.
    pub fn bind(orchestrator: Arc<Orchestrator<R, P>>, path: &Path) -> Result<Self, ServerError> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(path)?;
        info!(path = %path.display(), "request socket bound");
        Ok(Self {
            orchestrator,
            listener,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept connections until the listener fails. Each connection runs on
    /// its own task.
    pub async fn serve(self) -> Result<(), ServerError> {
        loop {
            let (stream, _) = self.listener.accept().await?;
            let orchestrator = Arc::clone(&self.orchestrator);
            tokio::spawn(async move {
                if let Err(e) = serve_connection(&orchestrator, stream).await {
                    warn!(error = %e, "connection ended with error");
                }
            });
        }
    }
}

async fn serve_connection<R: CommandRunner, P: DiskProbe>(
    orchestrator: &Orchestrator<R, P>,
    stream: UnixStream,
) -> Result<(), ServerError> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = handle_line(orchestrator, &line).await;
        let mut out = serde_json::to_vec(&response)?;
        out.push(b'\n');
        write.write_all(&out).await?;
        write.flush().await?;
    }
    debug!("client disconnected");
    Ok(())
}

//! IPC client for the daemon's Unix socket
//!
//! One connection per call: write a request line, read a response line.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::protocol::{self, Request, Response};
use crate::tools::ToolResult;

static NEXT_ID: AtomicI64 = AtomicI64::new(1);

/// `$TETHER_HOME` or `~/.tether`
pub fn default_home() -> PathBuf {
    if let Ok(home) = std::env::var("TETHER_HOME") {
        return PathBuf::from(home);
    }
    dirs::home_dir()
        .map(|h| h.join(".tether"))
        .unwrap_or_else(|| PathBuf::from(".tether"))
}

/// `$TETHER_IPC_SOCKET` or `<home>/tetherd.sock`
pub fn socket_path_from_env() -> PathBuf {
    if let Ok(sock) = std::env::var("TETHER_IPC_SOCKET") {
        return PathBuf::from(sock);
    }
    default_home().join("tetherd.sock")
}

#[derive(Debug, Clone)]
pub struct IpcClient {
    socket_path: PathBuf,
}

impl IpcClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    async fn request(&self, request: &Request) -> Result<Response> {
        let mut stream = UnixStream::connect(&self.socket_path)
            .await
            .with_context(|| {
                format!(
                    "Failed to connect to daemon socket: {}",
                    self.socket_path.display()
                )
            })?;
        let line = protocol::to_line(request)?;
        debug!(method = %request.method, "IPC -> {}", line);
        stream.write_all(line.as_bytes()).await?;
        stream.write_all(b"\n").await?;
        stream.flush().await?;

        let mut reader = BufReader::new(stream);
        let mut reply = String::new();
        if reader.read_line(&mut reply).await? == 0 {
            return Err(anyhow!("Daemon closed connection without response"));
        }
        debug!(method = %request.method, "IPC <- {}", reply.trim());
        Ok(serde_json::from_str(reply.trim())?)
    }

    pub async fn ping(&self) -> Result<Value> {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let response = self.request(&Request::new("ping", None, id)).await?;
        response
            .into_result()
            .map_err(|e| anyhow!("ping failed: {}", e))
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolResult> {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let response = self
            .request(&Request::tool_call(name, arguments, id))
            .await?;
        match response.into_result() {
            Ok(result) => Ok(serde_json::from_value(result)?),
            Err(err) => Ok(ToolResult::error("RPC_ERROR", err.message)),
        }
    }
}

/// Sibling `tetherd` next to the current executable, else `$PATH`
fn daemon_binary_path() -> PathBuf {
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let candidate = dir.join("tetherd");
            if candidate.exists() {
                return candidate;
            }
        }
    }
    PathBuf::from("tetherd")
}

fn spawn_daemon() -> Result<()> {
    let bin = daemon_binary_path();
    std::process::Command::new(&bin)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .with_context(|| format!("Failed to spawn daemon: {}", bin.display()))?;
    Ok(())
}

/// Start the daemon if its socket is not answering, then wait for it
pub async fn ensure_daemon(socket_path: &Path) -> Result<()> {
    if UnixStream::connect(socket_path).await.is_ok() {
        return Ok(());
    }
    warn!(socket = %socket_path.display(), "Daemon socket not reachable, starting daemon");
    spawn_daemon()?;

    for _ in 0..50 {
        if UnixStream::connect(socket_path).await.is_ok() {
            info!("Daemon is ready");
            return Ok(());
        }
        sleep(Duration::from_millis(100)).await;
    }
    Err(anyhow!(
        "Timed out waiting for daemon socket: {}",
        socket_path.display()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::UnixListener;

    #[tokio::test]
    async fn test_call_tool_over_socket() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("t.sock");
        let listener = UnixListener::bind(&sock).unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(stream);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            let req = protocol::parse_request(line.trim()).unwrap();
            assert_eq!(req.params.as_ref().unwrap()["name"], "control_get");
            let result = serde_json::to_value(ToolResult::json(&json!({"id": 1}))).unwrap();
            let resp = Response::success(req.id, result);
            let mut stream = reader.into_inner();
            stream
                .write_all(format!("{}\n", protocol::to_line(&resp).unwrap()).as_bytes())
                .await
                .unwrap();
        });

        let client = IpcClient::new(&sock);
        let result = client.call_tool("control_get", json!({"id": 1})).await.unwrap();
        assert_eq!(result.json_content()["id"], 1);
        server.await.unwrap();
    }
}

//! tether-mcp - MCP stdio server that forwards tool calls to `tetherd`
//!
//! Launched by the agent host as an MCP server. Starts the daemon on demand.

use anyhow::Result;
use serde_json::Value;
use tracing::error;

use tetherd_mcp::{ensure_daemon, socket_path_from_env, IpcClient, McpServer, ToolHandler, ToolResult};

struct ProxyHandler {
    client: IpcClient,
}

#[async_trait::async_trait]
impl ToolHandler for ProxyHandler {
    async fn call(&self, name: &str, arguments: Value) -> ToolResult {
        match self.client.call_tool(name, arguments).await {
            Ok(res) => res,
            Err(e) => {
                error!(tool = %name, error = %e, "IPC tool call failed");
                ToolResult::error("INTERNAL_ERROR", e.to_string())
            }
        }
    }
}

/// stdout carries the protocol, so logs go to stderr and default to warn
fn log_filter() -> tracing_subscriber::EnvFilter {
    let level = match (std::env::var("RUST_LOG"), std::env::var("TETHER_LOG_LEVEL")) {
        (Ok(v), _) => v,
        (Err(_), Ok(v)) => match v.as_str() {
            "silent" => "off".to_string(),
            "fatal" => "error".to_string(),
            other => other.to_string(),
        },
        _ => "warn".to_string(),
    };
    tracing_subscriber::EnvFilter::try_new(level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(log_filter())
        .with_writer(std::io::stderr)
        .init();

    let socket_path = socket_path_from_env();
    ensure_daemon(&socket_path).await?;

    let mut server = McpServer::new(ProxyHandler {
        client: IpcClient::new(socket_path),
    });
    server.run().await
}

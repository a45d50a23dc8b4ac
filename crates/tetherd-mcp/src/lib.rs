//! MCP surface for tetherd
//!
//! - `protocol`: JSON-RPC 2.0 line framing
//! - `tools`: the gateway tool catalogue and result envelope
//! - `server`: stdio MCP server driven by a [`ToolHandler`]
//! - `client`: IPC client for the daemon socket

pub mod client;
pub mod protocol;
pub mod server;
pub mod tools;

pub use client::{ensure_daemon, socket_path_from_env, IpcClient};
pub use protocol::{ErrorObject, Request, RequestId, Response, RpcError};
pub use server::{McpServer, ToolHandler};
pub use tools::{all_tools, get_tool, ToolContent, ToolDefinition, ToolResult};

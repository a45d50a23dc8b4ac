//! tetherd - singleton daemon for the tether gateway
//!
//! Responsibilities:
//! - Own the gateway state (store, liveness file, hosted session)
//! - Drive the dispatcher, heartbeat, control sweep, scheduler and reaper loops
//! - Expose an IPC JSON-RPC endpoint for `tether-mcp` and `tether-ctl`

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info, warn};

use tetherd_core::{
    CommandNotifier, ControlStatus, CreateTaskRequest, EnqueueRequest, Gateway, GatewayConfig,
    GatewayError, LivenessFile, MessageStatus, ReceiveRequest, TaskStatus, TickOutcome,
    TmuxSession,
};
use tetherd_mcp::protocol::{self, Request, RequestId, Response, RpcError};
use tetherd_mcp::ToolResult;

const DEFAULT_LIST_LIMIT: i64 = 20;
const RETENTION_INTERVAL_SECS: u64 = 60 * 60;

// =========================
// Tool arguments
// =========================

#[derive(Deserialize)]
struct IdArgs {
    id: i64,
}

#[derive(Deserialize)]
struct OutboundArgs {
    channel: String,
    #[serde(default)]
    endpoint: Option<String>,
    content: String,
}

#[derive(Deserialize)]
struct CompleteArgs {
    id: i64,
    #[serde(default = "default_true")]
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize, Default)]
struct ListArgs {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    limit: Option<i64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckpointArgs {
    end_id: i64,
    #[serde(default)]
    summary: Option<String>,
}

// =========================
// App state
// =========================

#[derive(Clone)]
struct AppState {
    gateway: Arc<Gateway>,
}

impl AppState {
    async fn call_tool(&self, name: &str, args: Value) -> ToolResult {
        match self.call_tool_inner(name, args).await {
            Ok(res) => res,
            Err(e) => {
                if let Some(gw) = e.downcast_ref::<GatewayError>() {
                    debug!(tool = %name, code = gw.code().as_str(), error = %gw, "Tool rejected");
                    return ToolResult::error(gw.code().as_str(), gw.to_string());
                }
                if let Some(de) = e.downcast_ref::<serde_json::Error>() {
                    return ToolResult::error("INVALID_ARGS", de.to_string());
                }
                error!(tool = %name, error = %e, "Tool call failed");
                ToolResult::error("INTERNAL_ERROR", e.to_string())
            }
        }
    }

    async fn call_tool_inner(&self, name: &str, args: Value) -> Result<ToolResult> {
        let gw = &self.gateway;
        let now = tetherd_core::now_ms();
        match name {
            // ===== Gateway =====
            "gateway_receive" => {
                let req: ReceiveRequest = serde_json::from_value(args)?;
                let outcome = gw.intake().receive(req);
                if outcome.ok {
                    Ok(ToolResult::json(&outcome))
                } else {
                    let code = outcome.code.map(|c| c.as_str()).unwrap_or("INTERNAL_ERROR");
                    Ok(ToolResult::error(code, outcome.error.unwrap_or_default()))
                }
            }
            "gateway_record_outbound" => {
                let OutboundArgs {
                    channel,
                    endpoint,
                    content,
                } = serde_json::from_value(args)?;
                let id = gw
                    .intake()
                    .record_outbound(&channel, endpoint.as_deref(), &content)?;
                Ok(ToolResult::json(&json!({ "ok": true, "id": id })))
            }
            "gateway_complete" => {
                let CompleteArgs { id, ok, error } = serde_json::from_value(args)?;
                let message = gw.dispatcher().complete(id, ok, error.as_deref())?;
                Ok(ToolResult::json(&json!({ "ok": true, "message": message })))
            }
            "message_list" => {
                let ListArgs { status, limit } = list_args(args)?;
                let status = match status.as_deref() {
                    Some(s) => Some(MessageStatus::from_str(s).ok_or_else(|| {
                        GatewayError::InvalidArgs(format!("unknown message status: {}", s))
                    })?),
                    None => None,
                };
                let messages = gw
                    .db()
                    .list_messages(status, limit.unwrap_or(DEFAULT_LIST_LIMIT))
                    .map_err(GatewayError::from)?;
                Ok(ToolResult::json(&messages))
            }

            // ===== Control plane =====
            "control_enqueue" => {
                let req: EnqueueRequest = serde_json::from_value(args)?;
                let id = gw.control().enqueue(req)?;
                Ok(ToolResult::json(&json!({ "ok": true, "id": id })))
            }
            "control_get" => {
                let IdArgs { id } = serde_json::from_value(args)?;
                Ok(ToolResult::json(&gw.control().get(id)?))
            }
            "control_ack" => {
                let IdArgs { id } = serde_json::from_value(args)?;
                Ok(ToolResult::json(&gw.control().ack(id)?))
            }
            "control_list" => {
                let ListArgs { status, limit } = list_args(args)?;
                let status = match status.as_deref() {
                    Some(s) => Some(ControlStatus::from_str(s).ok_or_else(|| {
                        GatewayError::InvalidArgs(format!("unknown control status: {}", s))
                    })?),
                    None => None,
                };
                let records = gw
                    .control()
                    .list(status, limit.unwrap_or(DEFAULT_LIST_LIMIT))?;
                Ok(ToolResult::json(&records))
            }

            // ===== Checkpoints =====
            "checkpoint_create" => {
                let CheckpointArgs { end_id, summary } = serde_json::from_value(args)?;
                let checkpoint = gw.checkpoints().create(end_id, summary.as_deref())?;
                Ok(ToolResult::json(&checkpoint))
            }
            "checkpoint_list" => {
                let ListArgs { limit, .. } = list_args(args)?;
                Ok(ToolResult::json(&gw.checkpoints().list(limit)?))
            }
            "checkpoint_latest" => {
                let latest = gw.checkpoints().latest()?;
                let boundary = gw.checkpoints().boundary()?;
                Ok(ToolResult::json(&json!({
                    "checkpoint": latest,
                    "boundary": boundary,
                })))
            }

            // ===== Health =====
            "health_status" => {
                let heartbeat = gw.heartbeat().status().await;
                let boundary = gw.checkpoints().boundary()?;
                let db = gw.db();
                let pending_messages = db
                    .list_messages(Some(MessageStatus::Pending), i64::MAX)
                    .map_err(GatewayError::from)?
                    .len();
                let pending_controls = db
                    .list_controls(Some(ControlStatus::Pending), i64::MAX)
                    .map_err(GatewayError::from)?
                    .len();
                let running = db
                    .running_message()
                    .map_err(GatewayError::from)?
                    .map(|m| m.id);
                Ok(ToolResult::json(&json!({
                    "heartbeat": heartbeat,
                    "boundary": boundary,
                    "queue": {
                        "pendingMessages": pending_messages,
                        "pendingControls": pending_controls,
                        "runningMessage": running,
                    },
                })))
            }

            // ===== Scheduler =====
            "schedule_create" => {
                let req: CreateTaskRequest = serde_json::from_value(args)?;
                Ok(ToolResult::json(&gw.scheduler().create_task(req, now)?))
            }
            "schedule_list" => {
                let ListArgs { status, .. } = list_args(args)?;
                let status = match status.as_deref() {
                    Some(s) => Some(TaskStatus::from_str(s).ok_or_else(|| {
                        GatewayError::InvalidArgs(format!("unknown task status: {}", s))
                    })?),
                    None => None,
                };
                Ok(ToolResult::json(&gw.scheduler().list_tasks(status)?))
            }
            "schedule_pause" => {
                let IdArgs { id } = serde_json::from_value(args)?;
                Ok(ToolResult::json(&gw.scheduler().pause(id)?))
            }
            "schedule_resume" => {
                let IdArgs { id } = serde_json::from_value(args)?;
                Ok(ToolResult::json(&gw.scheduler().resume(id, now)?))
            }
            "schedule_delete" => {
                let IdArgs { id } = serde_json::from_value(args)?;
                gw.scheduler().delete(id)?;
                Ok(ToolResult::json(&json!({ "ok": true, "id": id })))
            }

            _ => Ok(ToolResult::error(
                "INVALID_ARGS",
                format!("Unknown tool: {}", name),
            )),
        }
    }
}

/// Missing or null arguments mean "no filter"
fn list_args(args: Value) -> Result<ListArgs> {
    if args.is_null() {
        return Ok(ListArgs::default());
    }
    Ok(serde_json::from_value(args)?)
}

// =========================
// IPC server (daemon)
// =========================

async fn handle_ipc_connection(state: AppState, mut reader: BufReader<UnixStream>) -> Result<()> {
    let mut line = String::new();
    let bytes = reader.read_line(&mut line).await?;
    if bytes == 0 {
        return Ok(());
    }

    let resp = match protocol::parse_request(line.trim()) {
        Ok(request) => handle_ipc_request(state, request).await,
        Err(e) => Response::failure(RequestId::Null, e),
    };
    let json = protocol::to_line(&resp)?;
    let stream = reader.get_mut();
    stream.write_all(json.as_bytes()).await?;
    stream.write_all(b"\n").await?;
    stream.flush().await?;
    Ok(())
}

async fn handle_ipc_request(state: AppState, request: Request) -> Response {
    let id = request.id;
    let method = request.method.as_str();
    let params = request.params.unwrap_or(Value::Null);

    match method {
        "ping" => Response::success(id, json!({})),
        "tools/call" => {
            let name = match params.get("name").and_then(|v| v.as_str()) {
                Some(n) => n.to_string(),
                None => {
                    return Response::failure(
                        id,
                        RpcError::InvalidParams("Missing 'name' field".to_string()),
                    );
                }
            };
            let arguments = params
                .get("arguments")
                .cloned()
                .unwrap_or(Value::Object(serde_json::Map::new()));

            let tool_res = state.call_tool(&name, arguments).await;
            Response::success(id, serde_json::to_value(tool_res).unwrap_or(Value::Null))
        }
        _ => Response::failure(id, RpcError::MethodNotFound(method.to_string())),
    }
}

/// Bind the socket, clearing a stale file left by a previous instance
async fn bind_ipc_listener(path: &Path) -> Result<UnixListener> {
    if path.exists() {
        if UnixStream::connect(path).await.is_ok() {
            anyhow::bail!("another tetherd is already listening on {}", path.display());
        }
        std::fs::remove_file(path)
            .with_context(|| format!("Failed to remove stale socket {}", path.display()))?;
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    UnixListener::bind(path).with_context(|| format!("Failed to bind {}", path.display()))
}

// =========================
// Loops
// =========================

async fn dispatch_tick(state: &AppState) {
    let now = tetherd_core::now_ms();
    match state.gateway.dispatcher().tick(now).await {
        Ok(TickOutcome::InjectFailed(id)) => warn!(id, "Injection failed"),
        Ok(outcome) => debug!(?outcome, "Dispatch tick"),
        Err(e) => warn!(error = %e, "Dispatch tick failed"),
    }
}

async fn heartbeat_tick(state: &AppState) {
    let now = tetherd_core::now_ms();
    if let Err(e) = state.gateway.heartbeat().tick(now).await {
        warn!(error = %e, "Heartbeat tick failed");
    }
}

fn sweep_tick(state: &AppState) {
    match state.gateway.control().sweep(tetherd_core::now_ms()) {
        Ok(expired) if !expired.is_empty() => info!(count = expired.len(), ids = ?expired, "Control records timed out"),
        Ok(_) => {}
        Err(e) => warn!(error = %e, "Control sweep failed"),
    }
    match state.gateway.reaper().reap(tetherd_core::now_ms()) {
        Ok(reaped) if !reaped.is_empty() => info!(count = reaped.len(), ids = ?reaped, "Reaped stale messages"),
        Ok(_) => {}
        Err(e) => warn!(error = %e, "Reaper failed"),
    }
}

fn scheduler_tick(state: &AppState) {
    match state.gateway.scheduler().tick(tetherd_core::now_ms()) {
        Ok(report) if !report.fired.is_empty() || !report.missed.is_empty() => {
            info!(
                fired = ?report.fired,
                late = ?report.late,
                skipped = ?report.skipped,
                missed = ?report.missed,
                deferred = ?report.deferred,
                "Scheduler tick"
            );
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, "Scheduler tick failed"),
    }
}

fn retention_tick(state: &AppState) {
    let gw = &state.gateway;
    if let Err(e) = gw
        .checkpoints()
        .prune_retention(gw.config().retention_days, tetherd_core::now_ms())
    {
        warn!(error = %e, "Retention prune failed");
    }
}

fn log_filter() -> tracing_subscriber::EnvFilter {
    let level = if let Ok(v) = std::env::var("RUST_LOG") {
        v
    } else if let Ok(v) = std::env::var("TETHER_LOG_LEVEL") {
        match v.as_str() {
            "silent" => "off".to_string(),
            "fatal" => "error".to_string(),
            other => other.to_string(),
        }
    } else {
        "info".to_string()
    };

    tracing_subscriber::EnvFilter::try_new(level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"))
}

fn secs(n: u64) -> Duration {
    Duration::from_secs(n.max(1))
}

#[tokio::main]
async fn main() -> Result<()> {
    let home = tetherd_core::config::default_home();
    std::fs::create_dir_all(&home).ok();

    // Dual-layer logging: stderr + file (daily rotation)
    let log_dir = home.join("logs");
    std::fs::create_dir_all(&log_dir).ok();
    let file_appender = tracing_appender::rolling::daily(&log_dir, "tetherd.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    tracing_subscriber::registry()
        .with(log_filter())
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .init();

    std::panic::set_hook(Box::new(|info| {
        let payload = if let Some(s) = info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };
        let location = info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_default();
        eprintln!("PANIC at {}: {}", location, payload);
        tracing::error!(location = %location, "DAEMON PANIC: {}", payload);
    }));

    let config = GatewayConfig::load()?;
    let mut session = TmuxSession::new(
        config.session_name.clone(),
        config.session_command.clone(),
        LivenessFile::new(&config.status_file),
    );
    if let Some(cwd) = &config.session_cwd {
        session = session.with_cwd(cwd.clone());
    }
    let session = Arc::new(session);
    let config = Arc::new(config);
    let notifier = Arc::new(CommandNotifier::new(config.clone()));
    let socket_path = config.ipc_socket.clone();

    let gateway = Gateway::open((*config).clone(), session, notifier)
        .context("Failed to open gateway store")?;
    let state = AppState {
        gateway: Arc::new(gateway),
    };

    let listener = bind_ipc_listener(&socket_path).await?;
    info!(socket = %socket_path.display(), "tetherd IPC listening");

    let cfg = state.gateway.config().clone();
    let mut dispatch_interval = tokio::time::interval(secs(cfg.dispatch_interval_secs));
    let mut heartbeat_interval = tokio::time::interval(secs(cfg.dispatch_interval_secs));
    let mut sweep_interval = tokio::time::interval(secs(cfg.sweep_interval_secs));
    let mut scheduler_interval = tokio::time::interval(secs(cfg.scheduler_interval_secs));
    let mut retention_interval = tokio::time::interval(secs(RETENTION_INTERVAL_SECS));
    info!(
        dispatch_secs = cfg.dispatch_interval_secs,
        probe_secs = cfg.probe_interval_secs,
        sweep_secs = cfg.sweep_interval_secs,
        scheduler_secs = cfg.scheduler_interval_secs,
        "Gateway loops started"
    );

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, _) = result?;
                let reader = BufReader::new(stream);
                let conn_state = state.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_ipc_connection(conn_state, reader).await {
                        warn!(error = %e, "IPC connection error");
                    }
                });
            }
            _ = dispatch_interval.tick() => dispatch_tick(&state).await,
            _ = heartbeat_interval.tick() => heartbeat_tick(&state).await,
            _ = sweep_interval.tick() => sweep_tick(&state),
            _ = scheduler_interval.tick() => scheduler_tick(&state),
            _ = retention_interval.tick() => retention_tick(&state),
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                break;
            }
        }
    }

    let _ = std::fs::remove_file(&socket_path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tetherd_core::{ChannelNotifier, GatewayDB, SessionHost};

    struct StubSession {
        injected: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl SessionHost for StubSession {
        async fn exists(&self) -> bool {
            true
        }
        async fn inject(&self, text: &str) -> tetherd_core::Result<()> {
            self.injected.lock().unwrap().push(text.to_string());
            Ok(())
        }
        async fn idle_seconds(&self) -> Option<u64> {
            None
        }
        async fn terminate(&self) -> tetherd_core::Result<()> {
            Ok(())
        }
        async fn restart(&self) -> tetherd_core::Result<()> {
            Ok(())
        }
    }

    struct StubNotifier;

    #[async_trait::async_trait]
    impl ChannelNotifier for StubNotifier {
        async fn notify(
            &self,
            _channel: &str,
            _endpoint: Option<&str>,
            _text: &str,
        ) -> tetherd_core::Result<()> {
            Ok(())
        }
    }

    fn test_state(dir: &Path) -> (AppState, Arc<StubSession>) {
        let config = Arc::new(GatewayConfig::with_home(dir.to_path_buf()));
        let session = Arc::new(StubSession {
            injected: Mutex::new(Vec::new()),
        });
        let db = Arc::new(GatewayDB::in_memory().unwrap());
        let gateway = Gateway::with_db(db, config, session.clone(), Arc::new(StubNotifier));
        (
            AppState {
                gateway: Arc::new(gateway),
            },
            session,
        )
    }

    #[tokio::test]
    async fn test_receive_dispatch_complete() {
        let dir = tempfile::tempdir().unwrap();
        let (state, session) = test_state(dir.path());

        let res = state
            .call_tool(
                "gateway_receive",
                json!({ "channel": "chat", "content": "hello", "priority": 2 }),
            )
            .await;
        assert!(!res.is_error());
        let id = res.json_content()["id"].as_i64().unwrap();

        dispatch_tick(&state).await;
        let injected = session.injected.lock().unwrap().clone();
        assert_eq!(injected.len(), 1);
        assert!(injected[0].contains("hello"));

        let res = state
            .call_tool("gateway_complete", json!({ "id": id }))
            .await;
        assert!(!res.is_error(), "{}", res.text_content());
        assert_eq!(res.json_content()["message"]["status"], "done");
    }

    #[tokio::test]
    async fn test_error_codes_on_the_wire() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _) = test_state(dir.path());

        let res = state.call_tool("control_get", json!({ "id": 404 })).await;
        assert!(res.is_error());
        assert_eq!(res.json_content()["code"], "NOT_FOUND");

        let res = state.call_tool("control_get", json!({ "id": "x" })).await;
        assert_eq!(res.json_content()["code"], "INVALID_ARGS");

        let res = state
            .call_tool("message_list", json!({ "status": "weird" }))
            .await;
        assert_eq!(res.json_content()["code"], "INVALID_ARGS");

        std::fs::write(
            dir.path().join("status.json"),
            r#"{"health":"down"}"#,
        )
        .unwrap();
        let res = state
            .call_tool("gateway_receive", json!({ "channel": "chat", "content": "hi" }))
            .await;
        assert_eq!(res.json_content()["code"], "HEALTH_DOWN");
    }

    #[tokio::test]
    async fn test_control_ack_and_status() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _) = test_state(dir.path());

        let res = state
            .call_tool("control_enqueue", json!({ "content": "run {{control_id}}" }))
            .await;
        let id = res.json_content()["id"].as_i64().unwrap();

        let res = state.call_tool("control_ack", json!({ "id": id })).await;
        assert_eq!(res.json_content()["status"], "done");
        let res = state.call_tool("control_ack", json!({ "id": id })).await;
        assert_eq!(res.json_content()["alreadyFinal"], true);

        let res = state.call_tool("health_status", json!({})).await;
        let body = res.json_content();
        assert_eq!(body["heartbeat"]["health"], "ok");
        assert_eq!(body["queue"]["pendingControls"], 0);
    }

    #[tokio::test]
    async fn test_ipc_request_routing() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _) = test_state(dir.path());

        let resp = handle_ipc_request(state.clone(), Request::new("ping", None, 1i64)).await;
        assert!(resp.error.is_none());

        let resp = handle_ipc_request(state.clone(), Request::new("bogus", None, 2i64)).await;
        assert_eq!(resp.error.unwrap().code, -32601);

        let resp = handle_ipc_request(
            state,
            Request::tool_call("checkpoint_latest", json!({}), 3i64),
        )
        .await;
        let result: ToolResult = serde_json::from_value(resp.result.unwrap()).unwrap();
        assert_eq!(result.json_content()["boundary"]["summarizedThrough"], 0);
    }
}

//! tether-ctl - command-line client for tetherd
//!
//! Used by operators, channel adapters and the agent itself.
//!
//! Usage:
//!   tether-ctl send --channel chat --endpoint 42 "hello"
//!   tether-ctl ack 17
//!   tether-ctl schedule create --name digest --cron "0 9 * * *" "summarize the inbox"

use std::io::Read;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Map, Value};
use tetherd_mcp::{socket_path_from_env, IpcClient};

#[derive(Parser, Debug)]
#[command(name = "tether-ctl")]
#[command(about = "Control the tetherd message gateway")]
#[command(version)]
struct Cli {
    /// Daemon socket (defaults to $TETHER_IPC_SOCKET or ~/.tether/tetherd.sock)
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check that the daemon answers
    Ping,
    /// Submit an inbound message (`-` reads content from stdin)
    Send {
        #[arg(short, long)]
        channel: Option<String>,
        #[arg(short, long)]
        endpoint: Option<String>,
        #[arg(short, long)]
        priority: Option<i64>,
        #[arg(long)]
        require_idle: bool,
        #[arg(long)]
        no_reply: bool,
        content: String,
    },
    /// Record a reply sent on a channel
    Outbound {
        #[arg(short, long)]
        channel: String,
        #[arg(short, long)]
        endpoint: Option<String>,
        content: String,
    },
    /// Report the in-flight message as handled
    #[command(alias = "complete")]
    Done {
        id: i64,
        /// Mark the message failed with this error
        #[arg(long)]
        error: Option<String>,
    },
    /// List conversation records
    Messages {
        #[arg(short, long)]
        status: Option<String>,
        #[arg(short, long)]
        limit: Option<i64>,
    },
    /// Queue a control command
    Enqueue {
        #[arg(short, long)]
        priority: Option<i64>,
        #[arg(long)]
        require_idle: bool,
        #[arg(long)]
        bypass_state: bool,
        /// Seconds after availability before the record times out
        #[arg(long)]
        deadline: Option<u64>,
        /// Delay before the record becomes eligible
        #[arg(long)]
        delay: Option<u64>,
        #[arg(long)]
        source: Option<String>,
        content: String,
    },
    /// Acknowledge a control record
    Ack { id: i64 },
    /// Show a control record
    Get { id: i64 },
    /// List control records
    Controls {
        #[arg(short, long)]
        status: Option<String>,
        #[arg(short, long)]
        limit: Option<i64>,
    },
    /// Health, heartbeat and queue depth
    #[command(alias = "health")]
    Status,
    #[command(subcommand)]
    Checkpoint(CheckpointCommand),
    #[command(subcommand)]
    Schedule(ScheduleCommand),
}

#[derive(Subcommand, Debug)]
enum CheckpointCommand {
    /// Declare everything up to END_ID summarized
    Create {
        end_id: i64,
        #[arg(short, long)]
        summary: Option<String>,
    },
    List {
        #[arg(short, long)]
        limit: Option<i64>,
    },
    Latest,
}

#[derive(Subcommand, Debug)]
enum ScheduleCommand {
    /// Recurring with --cron, or once with --at / --delay
    Create {
        #[arg(short, long)]
        name: String,
        #[arg(long)]
        cron: Option<String>,
        /// Epoch milliseconds
        #[arg(long)]
        at: Option<i64>,
        /// Seconds from now
        #[arg(long)]
        delay: Option<u64>,
        #[arg(short, long)]
        priority: Option<i64>,
        #[arg(long)]
        require_idle: bool,
        prompt: String,
    },
    List {
        #[arg(short, long)]
        status: Option<String>,
    },
    Pause { id: i64 },
    Resume { id: i64 },
    Delete { id: i64 },
}

/// Insert only the options that were given
fn args(pairs: Vec<(&str, Option<Value>)>) -> Value {
    let map: Map<String, Value> = pairs
        .into_iter()
        .filter_map(|(k, v)| v.map(|v| (k.to_string(), v)))
        .collect();
    Value::Object(map)
}

fn read_content(content: String) -> Result<String> {
    if content != "-" {
        return Ok(content);
    }
    let mut buf = String::new();
    std::io::stdin()
        .read_to_string(&mut buf)
        .context("Failed to read content from stdin")?;
    Ok(buf)
}

/// Map a subcommand to its tool name and arguments; `None` for ping
fn tool_call(command: Command) -> Result<Option<(&'static str, Value)>> {
    let call = match command {
        Command::Ping => return Ok(None),
        Command::Send {
            channel,
            endpoint,
            priority,
            require_idle,
            no_reply,
            content,
        } => (
            "gateway_receive",
            args(vec![
                ("channel", channel.map(Value::from)),
                ("endpoint", endpoint.map(Value::from)),
                ("content", Some(read_content(content)?.into())),
                ("priority", priority.map(Value::from)),
                ("requireIdle", Some(require_idle.into())),
                ("noReply", Some(no_reply.into())),
            ]),
        ),
        Command::Outbound {
            channel,
            endpoint,
            content,
        } => (
            "gateway_record_outbound",
            args(vec![
                ("channel", Some(channel.into())),
                ("endpoint", endpoint.map(Value::from)),
                ("content", Some(read_content(content)?.into())),
            ]),
        ),
        Command::Done { id, error } => (
            "gateway_complete",
            args(vec![
                ("id", Some(id.into())),
                ("ok", Some(error.is_none().into())),
                ("error", error.map(Value::from)),
            ]),
        ),
        Command::Messages { status, limit } => (
            "message_list",
            args(vec![
                ("status", status.map(Value::from)),
                ("limit", limit.map(Value::from)),
            ]),
        ),
        Command::Enqueue {
            priority,
            require_idle,
            bypass_state,
            deadline,
            delay,
            source,
            content,
        } => (
            "control_enqueue",
            args(vec![
                ("content", Some(read_content(content)?.into())),
                ("priority", priority.map(Value::from)),
                ("requireIdle", Some(require_idle.into())),
                ("bypassState", Some(bypass_state.into())),
                ("ackDeadlineSeconds", deadline.map(Value::from)),
                ("availableInSeconds", delay.map(Value::from)),
                ("source", source.map(Value::from)),
            ]),
        ),
        Command::Ack { id } => ("control_ack", json!({ "id": id })),
        Command::Get { id } => ("control_get", json!({ "id": id })),
        Command::Controls { status, limit } => (
            "control_list",
            args(vec![
                ("status", status.map(Value::from)),
                ("limit", limit.map(Value::from)),
            ]),
        ),
        Command::Status => ("health_status", json!({})),
        Command::Checkpoint(cmd) => match cmd {
            CheckpointCommand::Create { end_id, summary } => (
                "checkpoint_create",
                args(vec![
                    ("endId", Some(end_id.into())),
                    ("summary", summary.map(Value::from)),
                ]),
            ),
            CheckpointCommand::List { limit } => (
                "checkpoint_list",
                args(vec![("limit", limit.map(Value::from))]),
            ),
            CheckpointCommand::Latest => ("checkpoint_latest", json!({})),
        },
        Command::Schedule(cmd) => match cmd {
            ScheduleCommand::Create {
                name,
                cron,
                at,
                delay,
                priority,
                require_idle,
                prompt,
            } => (
                "schedule_create",
                args(vec![
                    ("name", Some(name.into())),
                    ("prompt", Some(read_content(prompt)?.into())),
                    ("cron", cron.map(Value::from)),
                    ("runAt", at.map(Value::from)),
                    ("delaySeconds", delay.map(Value::from)),
                    ("priority", priority.map(Value::from)),
                    ("requireIdle", Some(require_idle.into())),
                ]),
            ),
            ScheduleCommand::List { status } => (
                "schedule_list",
                args(vec![("status", status.map(Value::from))]),
            ),
            ScheduleCommand::Pause { id } => ("schedule_pause", json!({ "id": id })),
            ScheduleCommand::Resume { id } => ("schedule_resume", json!({ "id": id })),
            ScheduleCommand::Delete { id } => ("schedule_delete", json!({ "id": id })),
        },
    };
    Ok(Some(call))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = IpcClient::new(cli.socket.unwrap_or_else(socket_path_from_env));

    let Some((tool, arguments)) = tool_call(cli.command)? else {
        let pong = client.ping().await?;
        println!("{}", serde_json::to_string_pretty(&pong)?);
        return Ok(());
    };
    let result = client.call_tool(tool, arguments).await?;
    let body = serde_json::to_string_pretty(&result.json_content())?;
    if result.is_error() {
        eprintln!("{}", body);
        std::process::exit(1);
    }
    println!("{}", body);
    Ok(())
}

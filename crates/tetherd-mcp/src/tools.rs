//! MCP tool catalogue and result envelope

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the arguments object
    pub input_schema: Value,
}

impl ToolDefinition {
    pub fn new(name: &str, description: &str, input_schema: Value) -> Self {
        ToolDefinition {
            name: name.to_string(),
            description: description.to_string(),
            input_schema,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolContent {
    Text { text: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub content: Vec<ToolContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
}

impl ToolResult {
    pub fn text(text: impl Into<String>) -> Self {
        ToolResult {
            content: vec![ToolContent::Text { text: text.into() }],
            is_error: None,
        }
    }

    pub fn json<T: Serialize>(value: &T) -> Self {
        match serde_json::to_string(value) {
            Ok(text) => ToolResult::text(text),
            Err(e) => ToolResult::error("INTERNAL_ERROR", e.to_string()),
        }
    }

    /// Structured failure: `{"ok": false, "code": ..., "error": ...}`
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        ToolResult {
            content: vec![ToolContent::Text {
                text: json!({ "ok": false, "code": code, "error": message.into() }).to_string(),
            }],
            is_error: Some(true),
        }
    }

    pub fn is_error(&self) -> bool {
        self.is_error.unwrap_or(false)
    }

    /// Concatenated text content
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .map(|c| match c {
                ToolContent::Text { text } => text.as_str(),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Text content parsed as JSON, falling back to a string value
    pub fn json_content(&self) -> Value {
        let text = self.text_content();
        serde_json::from_str(&text).unwrap_or(Value::String(text))
    }
}

fn id_schema(what: &str) -> Value {
    json!({
        "type": "object",
        "properties": { "id": { "type": "integer", "description": what } },
        "required": ["id"]
    })
}

pub fn all_tools() -> Vec<ToolDefinition> {
    vec![
        // ===== Gateway =====
        ToolDefinition::new(
            "gateway_receive",
            "Submit an inbound message for the agent. Rejected with HEALTH_RECOVERING/HEALTH_DOWN while the agent is unhealthy.",
            json!({
                "type": "object",
                "properties": {
                    "channel": { "type": "string", "description": "Source channel (required unless noReply)" },
                    "endpoint": { "type": "string", "description": "Channel-specific reply target" },
                    "content": { "type": "string" },
                    "priority": { "type": "integer", "minimum": 1, "maximum": 3, "default": 3 },
                    "requireIdle": { "type": "boolean", "default": false },
                    "noReply": { "type": "boolean", "default": false }
                },
                "required": ["content"]
            }),
        ),
        ToolDefinition::new(
            "gateway_record_outbound",
            "Record a reply the agent sent on a channel (audit only)",
            json!({
                "type": "object",
                "properties": {
                    "channel": { "type": "string" },
                    "endpoint": { "type": "string" },
                    "content": { "type": "string" }
                },
                "required": ["channel", "content"]
            }),
        ),
        ToolDefinition::new(
            "gateway_complete",
            "Report that the in-flight message has been handled",
            json!({
                "type": "object",
                "properties": {
                    "id": { "type": "integer" },
                    "ok": { "type": "boolean", "default": true },
                    "error": { "type": "string" }
                },
                "required": ["id"]
            }),
        ),
        ToolDefinition::new(
            "message_list",
            "List conversation records, newest first",
            json!({
                "type": "object",
                "properties": {
                    "status": { "type": "string", "enum": ["pending", "running", "done", "failed"] },
                    "limit": { "type": "integer", "default": 20 }
                }
            }),
        ),
        // ===== Control plane =====
        ToolDefinition::new(
            "control_enqueue",
            "Queue a control command. {{control_id}} in content is replaced by the record id.",
            json!({
                "type": "object",
                "properties": {
                    "content": { "type": "string" },
                    "priority": { "type": "integer", "minimum": 0, "maximum": 3, "default": 3 },
                    "requireIdle": { "type": "boolean", "default": false },
                    "bypassState": { "type": "boolean", "default": false },
                    "ackDeadlineSeconds": { "type": "integer", "minimum": 0 },
                    "availableInSeconds": { "type": "integer", "minimum": 0 },
                    "source": { "type": "string" }
                },
                "required": ["content"]
            }),
        ),
        ToolDefinition::new("control_get", "Get a control record", id_schema("Control record id")),
        ToolDefinition::new(
            "control_ack",
            "Acknowledge a control record (idempotent)",
            id_schema("Control record id"),
        ),
        ToolDefinition::new(
            "control_list",
            "List control records, newest first",
            json!({
                "type": "object",
                "properties": {
                    "status": { "type": "string", "enum": ["pending", "running", "done", "failed", "timeout"] },
                    "limit": { "type": "integer", "default": 20 }
                }
            }),
        ),
        // ===== Checkpoints =====
        ToolDefinition::new(
            "checkpoint_create",
            "Declare conversations up to endId durably summarized",
            json!({
                "type": "object",
                "properties": {
                    "endId": { "type": "integer" },
                    "summary": { "type": "string" }
                },
                "required": ["endId"]
            }),
        ),
        ToolDefinition::new(
            "checkpoint_list",
            "List checkpoints, newest first",
            json!({
                "type": "object",
                "properties": { "limit": { "type": "integer", "default": 20 } }
            }),
        ),
        ToolDefinition::new(
            "checkpoint_latest",
            "Latest checkpoint and the unsummarized boundary",
            json!({ "type": "object", "properties": {} }),
        ),
        // ===== Health =====
        ToolDefinition::new(
            "health_status",
            "Agent health, heartbeat state and queue depth",
            json!({ "type": "object", "properties": {} }),
        ),
        // ===== Scheduler =====
        ToolDefinition::new(
            "schedule_create",
            "Schedule a prompt: recurring with cron, or once at runAt / after delaySeconds",
            json!({
                "type": "object",
                "properties": {
                    "name": { "type": "string" },
                    "prompt": { "type": "string" },
                    "cron": { "type": "string", "description": "Five- or six-field cron expression (UTC)" },
                    "runAt": { "type": "integer", "description": "Epoch milliseconds" },
                    "delaySeconds": { "type": "integer", "minimum": 0 },
                    "priority": { "type": "integer", "minimum": 1, "maximum": 3, "default": 3 },
                    "requireIdle": { "type": "boolean", "default": false }
                },
                "required": ["name", "prompt"]
            }),
        ),
        ToolDefinition::new(
            "schedule_list",
            "List scheduled tasks",
            json!({
                "type": "object",
                "properties": {
                    "status": { "type": "string", "enum": ["active", "running", "done", "failed", "paused"] }
                }
            }),
        ),
        ToolDefinition::new("schedule_pause", "Pause an active task", id_schema("Task id")),
        ToolDefinition::new("schedule_resume", "Resume a paused task", id_schema("Task id")),
        ToolDefinition::new("schedule_delete", "Delete a task", id_schema("Task id")),
    ]
}

pub fn get_tool(name: &str) -> Option<ToolDefinition> {
    all_tools().into_iter().find(|t| t.name == name)
}

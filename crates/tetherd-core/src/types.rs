//! Core types for tetherd
//!
//! Rows of the gateway store and the closed enumerations that describe them.
//! Timestamps are epoch milliseconds throughout.

use serde::{Deserialize, Serialize};

// ============ Priority ============

/// Priority band shared by both queues.
///
/// Lower numeric value wins. `Liveness` (0) exists only on the control queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Priority {
    Liveness,
    Urgent,
    High,
    Normal,
}

impl Priority {
    pub fn as_i64(&self) -> i64 {
        match self {
            Priority::Liveness => 0,
            Priority::Urgent => 1,
            Priority::High => 2,
            Priority::Normal => 3,
        }
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(Priority::Liveness),
            1 => Some(Priority::Urgent),
            2 => Some(Priority::High),
            3 => Some(Priority::Normal),
            _ => None,
        }
    }

    /// Bands accepted on the conversation queue (1..=3).
    pub fn from_message_band(value: i64) -> Option<Self> {
        match Self::from_i64(value)? {
            Priority::Liveness => None,
            p => Some(p),
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl TryFrom<u8> for Priority {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Priority::from_i64(value as i64).ok_or_else(|| format!("priority out of range: {}", value))
    }
}

impl From<Priority> for u8 {
    fn from(p: Priority) -> Self {
        p.as_i64() as u8
    }
}

// ============ Message ============

/// Direction of a conversation record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "in" => Some(Direction::In),
            "out" => Some(Direction::Out),
            _ => None,
        }
    }
}

/// Message status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Running => "running",
            MessageStatus::Done => "done",
            MessageStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(MessageStatus::Pending),
            "running" => Some(MessageStatus::Running),
            "done" => Some(MessageStatus::Done),
            "failed" => Some(MessageStatus::Failed),
            _ => None,
        }
    }
}

/// A conversation record (inbound or outbound)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: i64,
    pub direction: Direction,
    pub channel: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_preview: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment_path: Option<String>,
    pub priority: Priority,
    pub status: MessageStatus,
    pub require_idle: bool,
    /// Scheduled task that produced this message, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<i64>,
    pub attempts: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub available_at: i64,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<i64>,
}

/// Input for appending a message
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub direction: Direction,
    pub channel: String,
    pub endpoint: Option<String>,
    pub content: String,
    pub content_preview: Option<String>,
    pub attachment_path: Option<String>,
    pub priority: Priority,
    pub status: MessageStatus,
    pub require_idle: bool,
    pub task_id: Option<i64>,
    pub available_at: i64,
}

// ============ Control queue ============

/// Control record status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlStatus {
    Pending,
    Running,
    Done,
    Failed,
    Timeout,
}

impl ControlStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlStatus::Pending => "pending",
            ControlStatus::Running => "running",
            ControlStatus::Done => "done",
            ControlStatus::Failed => "failed",
            ControlStatus::Timeout => "timeout",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ControlStatus::Pending),
            "running" => Some(ControlStatus::Running),
            "done" => Some(ControlStatus::Done),
            "failed" => Some(ControlStatus::Failed),
            "timeout" => Some(ControlStatus::Timeout),
            _ => None,
        }
    }

    /// Terminal states never transition again.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            ControlStatus::Done | ControlStatus::Failed | ControlStatus::Timeout
        )
    }
}

/// An out-of-band control record
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlRecord {
    pub id: i64,
    pub content: String,
    pub priority: Priority,
    pub require_idle: bool,
    pub bypass_state: bool,
    pub status: ControlStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ack_deadline_at: Option<i64>,
    /// Subsystem that enqueued the record (e.g. "heartbeat")
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub available_at: i64,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<i64>,
}

/// Input for inserting a control record
#[derive(Debug, Clone)]
pub struct NewControl {
    pub content: String,
    pub priority: Priority,
    pub require_idle: bool,
    pub bypass_state: bool,
    pub ack_deadline_at: Option<i64>,
    pub available_at: i64,
    pub source: String,
}

// ============ Checkpoint ============

/// Marker that conversation ids `start..=end` are durably summarized
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub id: i64,
    pub start_conversation_id: i64,
    pub end_conversation_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub created_at: i64,
}

// ============ Scheduled tasks ============

/// Scheduled task kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Once,
    Recurring,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Once => "once",
            TaskKind::Recurring => "recurring",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "once" => Some(TaskKind::Once),
            "recurring" => Some(TaskKind::Recurring),
            _ => None,
        }
    }
}

/// Scheduled task status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Active,
    Running,
    Done,
    Failed,
    Paused,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Active => "active",
            TaskStatus::Running => "running",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
            TaskStatus::Paused => "paused",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "active" => Some(TaskStatus::Active),
            "running" => Some(TaskStatus::Running),
            "done" => Some(TaskStatus::Done),
            "failed" => Some(TaskStatus::Failed),
            "paused" => Some(TaskStatus::Paused),
            _ => None,
        }
    }
}

/// A time-based task fed into the gateway by the scheduler
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledTask {
    pub id: i64,
    pub name: String,
    pub prompt: String,
    pub kind: TaskKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cron_expr: Option<String>,
    pub priority: Priority,
    pub require_idle: bool,
    pub status: TaskStatus,
    pub next_run_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: i64,
}

/// Input for creating a scheduled task
#[derive(Debug, Clone)]
pub struct NewScheduledTask {
    pub name: String,
    pub prompt: String,
    pub kind: TaskKind,
    pub cron_expr: Option<String>,
    pub priority: Priority,
    pub require_idle: bool,
    pub next_run_at: i64,
}

/// Current time in epoch milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Seconds to milliseconds, clamped to `i64::MAX`
pub fn secs_to_ms(secs: u64) -> i64 {
    i64::try_from(secs).unwrap_or(i64::MAX).saturating_mul(1000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secs_to_ms_clamps() {
        assert_eq!(secs_to_ms(30), 30_000);
        assert_eq!(secs_to_ms(u64::MAX), i64::MAX);
        assert_eq!(secs_to_ms(i64::MAX as u64), i64::MAX);
    }

    #[test]
    fn test_priority_bands() {
        assert_eq!(Priority::from_i64(0), Some(Priority::Liveness));
        assert_eq!(Priority::from_i64(4), None);
        assert_eq!(Priority::from_message_band(0), None);
        assert_eq!(Priority::from_message_band(2), Some(Priority::High));
        assert!(Priority::Urgent < Priority::Normal);
    }

    #[test]
    fn test_priority_serializes_as_number() {
        let json = serde_json::to_string(&Priority::High).unwrap();
        assert_eq!(json, "2");
        let p: Priority = serde_json::from_str("0").unwrap();
        assert_eq!(p, Priority::Liveness);
        assert!(serde_json::from_str::<Priority>("9").is_err());
    }

    #[test]
    fn test_control_status_final() {
        assert!(ControlStatus::Timeout.is_final());
        assert!(ControlStatus::Done.is_final());
        assert!(!ControlStatus::Running.is_final());
        assert_eq!(ControlStatus::from_str("timeout"), Some(ControlStatus::Timeout));
    }
}

//! SQLite store for the gateway
//!
//! Single serialization point for every polling loop. Status transitions are
//! single-statement conditional UPDATEs so two loops can never claim the same
//! row.

use rusqlite::{params, Connection, OptionalExtension, Result as SqliteResult, Row};
use std::path::Path;

use crate::types::{
    Checkpoint, ControlRecord, ControlStatus, Direction, Message, MessageStatus, NewControl,
    NewMessage, NewScheduledTask, Priority, ScheduledTask, TaskKind, TaskStatus,
};

const SCHEMA: &str = r#"
-- Conversation records (inbound and outbound)
CREATE TABLE IF NOT EXISTS messages (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  direction TEXT NOT NULL DEFAULT 'in',
  channel TEXT NOT NULL,
  endpoint TEXT,
  content TEXT NOT NULL,
  content_preview TEXT,
  attachment_path TEXT,
  priority INTEGER NOT NULL DEFAULT 3,
  status TEXT NOT NULL DEFAULT 'pending',
  require_idle INTEGER NOT NULL DEFAULT 0,
  task_id INTEGER,
  attempts INTEGER NOT NULL DEFAULT 0,
  last_error TEXT,
  available_at INTEGER NOT NULL,
  created_at INTEGER NOT NULL,
  started_at INTEGER,
  finished_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_messages_dispatch ON messages(status, priority, created_at);
CREATE INDEX IF NOT EXISTS idx_messages_task ON messages(task_id);

-- Out-of-band control queue
CREATE TABLE IF NOT EXISTS control_queue (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  content TEXT NOT NULL,
  priority INTEGER NOT NULL DEFAULT 3,
  require_idle INTEGER NOT NULL DEFAULT 0,
  bypass_state INTEGER NOT NULL DEFAULT 0,
  status TEXT NOT NULL DEFAULT 'pending',
  ack_deadline_at INTEGER,
  source TEXT NOT NULL DEFAULT 'manual',
  last_error TEXT,
  available_at INTEGER NOT NULL,
  created_at INTEGER NOT NULL,
  started_at INTEGER,
  finished_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_control_dispatch ON control_queue(status, priority, created_at);
CREATE INDEX IF NOT EXISTS idx_control_deadline ON control_queue(status, ack_deadline_at);

-- Sync checkpoints
CREATE TABLE IF NOT EXISTS checkpoints (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  start_conversation_id INTEGER NOT NULL,
  end_conversation_id INTEGER NOT NULL,
  summary TEXT,
  created_at INTEGER NOT NULL
);

-- Scheduler tasks
CREATE TABLE IF NOT EXISTS scheduled_tasks (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL,
  prompt TEXT NOT NULL,
  kind TEXT NOT NULL DEFAULT 'once',
  cron_expr TEXT,
  priority INTEGER NOT NULL DEFAULT 3,
  require_idle INTEGER NOT NULL DEFAULT 0,
  status TEXT NOT NULL DEFAULT 'active',
  next_run_at INTEGER NOT NULL,
  last_run_at INTEGER,
  last_message_id INTEGER,
  last_error TEXT,
  created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_scheduled_due ON scheduled_tasks(status, next_run_at);
"#;

/// Result of acknowledging a control record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Record moved to `done`
    Acked,
    /// Record was already in a terminal state; nothing changed
    AlreadyFinal(ControlStatus),
    NotFound,
}

/// SQLite database operations class
pub struct GatewayDB {
    conn: std::sync::Mutex<Connection>,
}

impl GatewayDB {
    /// Open (or create) a database file
    pub fn open<P: AsRef<Path>>(db_path: P) -> SqliteResult<Self> {
        let conn = Connection::open(&db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        let db = Self {
            conn: std::sync::Mutex::new(conn),
        };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory database (for testing)
    pub fn in_memory() -> SqliteResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: std::sync::Mutex::new(conn),
        };
        db.init()?;
        Ok(db)
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A panic while holding the lock leaves the connection itself intact.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn init(&self) -> SqliteResult<()> {
        let conn = self.conn();
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    // ============ Messages ============

    /// Append a message, returning its id
    pub fn insert_message(&self, msg: &NewMessage, now: i64) -> SqliteResult<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO messages (direction, channel, endpoint, content, content_preview, attachment_path,
                                   priority, status, require_idle, task_id, available_at, created_at, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                msg.direction.as_str(),
                msg.channel,
                msg.endpoint,
                msg.content,
                msg.content_preview,
                msg.attachment_path,
                msg.priority.as_i64(),
                msg.status.as_str(),
                msg.require_idle,
                msg.task_id,
                msg.available_at,
                now,
                if msg.status == MessageStatus::Done { Some(now) } else { None },
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_message(&self, id: i64) -> SqliteResult<Option<Message>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT * FROM messages WHERE id = ?1",
            params![id],
            Self::row_to_message,
        )
        .optional()
    }

    /// List messages newest first, optionally filtered by status
    pub fn list_messages(
        &self,
        status: Option<MessageStatus>,
        limit: i64,
    ) -> SqliteResult<Vec<Message>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT * FROM messages WHERE (?1 IS NULL OR status = ?1) ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(
            params![status.map(|s| s.as_str()), limit],
            Self::row_to_message,
        )?;
        rows.collect()
    }

    /// Head of the inbound queue: highest priority, then oldest
    pub fn next_pending_message(&self, now: i64) -> SqliteResult<Option<Message>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT * FROM messages
             WHERE direction = 'in' AND status = 'pending' AND available_at <= ?1
             ORDER BY priority ASC, created_at ASC, id ASC
             LIMIT 1",
            params![now],
            Self::row_to_message,
        )
        .optional()
    }

    /// The inbound message currently in flight, if any
    pub fn running_message(&self) -> SqliteResult<Option<Message>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT * FROM messages WHERE direction = 'in' AND status = 'running'
             ORDER BY started_at ASC LIMIT 1",
            [],
            Self::row_to_message,
        )
        .optional()
    }

    /// Claim a pending message for delivery.
    ///
    /// Refuses when another inbound message is already running, so at most one
    /// message is ever in flight. Returns false if the claim lost.
    pub fn claim_message(&self, id: i64, now: i64) -> SqliteResult<bool> {
        let conn = self.conn();
        let n = conn.execute(
            "UPDATE messages SET status = 'running', started_at = ?2, attempts = attempts + 1
             WHERE id = ?1 AND status = 'pending'
               AND NOT EXISTS (SELECT 1 FROM messages WHERE direction = 'in' AND status = 'running')",
            params![id, now],
        )?;
        Ok(n == 1)
    }

    /// Put a running message back in the queue after a failed injection
    pub fn release_message(&self, id: i64, error: &str) -> SqliteResult<bool> {
        let conn = self.conn();
        let n = conn.execute(
            "UPDATE messages SET status = 'pending', started_at = NULL, last_error = ?2
             WHERE id = ?1 AND status = 'running'",
            params![id, error],
        )?;
        Ok(n == 1)
    }

    /// Finish a running message (`done` or `failed`)
    pub fn finish_message(
        &self,
        id: i64,
        status: MessageStatus,
        error: Option<&str>,
        now: i64,
    ) -> SqliteResult<bool> {
        let conn = self.conn();
        let n = conn.execute(
            "UPDATE messages SET status = ?2, finished_at = ?3, last_error = COALESCE(?4, last_error)
             WHERE id = ?1 AND status = 'running'",
            params![id, status.as_str(), now, error],
        )?;
        Ok(n == 1)
    }

    /// Inbound messages running since before `cutoff`
    pub fn stale_running_messages(&self, cutoff: i64) -> SqliteResult<Vec<Message>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT * FROM messages
             WHERE direction = 'in' AND status = 'running' AND started_at IS NOT NULL AND started_at < ?1
             ORDER BY started_at ASC",
        )?;
        let rows = stmt.query_map(params![cutoff], Self::row_to_message)?;
        rows.collect()
    }

    pub fn max_message_id(&self) -> SqliteResult<i64> {
        let conn = self.conn();
        conn.query_row("SELECT COALESCE(MAX(id), 0) FROM messages", [], |row| {
            row.get(0)
        })
    }

    /// Retention: delete `done` rows finished before `before` whose id is at or
    /// below `max_id` (the latest summarized id).
    pub fn prune_done_messages(&self, before: i64, max_id: i64) -> SqliteResult<usize> {
        let conn = self.conn();
        conn.execute(
            "DELETE FROM messages
             WHERE status = 'done' AND id <= ?2 AND COALESCE(finished_at, created_at) < ?1",
            params![before, max_id],
        )
    }

    fn row_to_message(row: &Row) -> SqliteResult<Message> {
        let direction: String = row.get("direction")?;
        let status: String = row.get("status")?;
        let priority: i64 = row.get("priority")?;
        Ok(Message {
            id: row.get("id")?,
            direction: Direction::from_str(&direction).unwrap_or(Direction::In),
            channel: row.get("channel")?,
            endpoint: row.get("endpoint")?,
            content: row.get("content")?,
            content_preview: row.get("content_preview")?,
            attachment_path: row.get("attachment_path")?,
            priority: Priority::from_i64(priority).unwrap_or_default(),
            status: MessageStatus::from_str(&status).unwrap_or(MessageStatus::Failed),
            require_idle: row.get("require_idle")?,
            task_id: row.get("task_id")?,
            attempts: row.get("attempts")?,
            last_error: row.get("last_error")?,
            available_at: row.get("available_at")?,
            created_at: row.get("created_at")?,
            started_at: row.get("started_at")?,
            finished_at: row.get("finished_at")?,
        })
    }

    // ============ Control queue ============

    /// Insert a pending control record, returning its id
    pub fn insert_control(&self, ctl: &NewControl, now: i64) -> SqliteResult<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO control_queue (content, priority, require_idle, bypass_state, status,
                                        ack_deadline_at, source, available_at, created_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6, ?7, ?8)",
            params![
                ctl.content,
                ctl.priority.as_i64(),
                ctl.require_idle,
                ctl.bypass_state,
                ctl.ack_deadline_at,
                ctl.source,
                ctl.available_at,
                now,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn set_control_content(&self, id: i64, content: &str) -> SqliteResult<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE control_queue SET content = ?2 WHERE id = ?1",
            params![id, content],
        )?;
        Ok(())
    }

    pub fn get_control(&self, id: i64) -> SqliteResult<Option<ControlRecord>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT * FROM control_queue WHERE id = ?1",
            params![id],
            Self::row_to_control,
        )
        .optional()
    }

    pub fn list_controls(
        &self,
        status: Option<ControlStatus>,
        limit: i64,
    ) -> SqliteResult<Vec<ControlRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT * FROM control_queue WHERE (?1 IS NULL OR status = ?1) ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(
            params![status.map(|s| s.as_str()), limit],
            Self::row_to_control,
        )?;
        rows.collect()
    }

    /// Head of the control queue
    pub fn next_pending_control(&self, now: i64) -> SqliteResult<Option<ControlRecord>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT * FROM control_queue
             WHERE status = 'pending' AND available_at <= ?1
             ORDER BY priority ASC, created_at ASC, id ASC
             LIMIT 1",
            params![now],
            Self::row_to_control,
        )
        .optional()
    }

    /// Claim a pending control record (only if still pending)
    pub fn claim_control(&self, id: i64, now: i64) -> SqliteResult<bool> {
        let conn = self.conn();
        let n = conn.execute(
            "UPDATE control_queue SET status = 'running', started_at = ?2
             WHERE id = ?1 AND status = 'pending'",
            params![id, now],
        )?;
        Ok(n == 1)
    }

    /// Mark a non-final control record failed
    pub fn fail_control(&self, id: i64, error: &str, now: i64) -> SqliteResult<bool> {
        let conn = self.conn();
        let n = conn.execute(
            "UPDATE control_queue SET status = 'failed', last_error = ?2, finished_at = ?3
             WHERE id = ?1 AND status IN ('pending', 'running')",
            params![id, error, now],
        )?;
        Ok(n == 1)
    }

    /// Acknowledge a control record. Idempotent on terminal records.
    pub fn ack_control(&self, id: i64, now: i64) -> SqliteResult<AckOutcome> {
        let conn = self.conn();
        let n = conn.execute(
            "UPDATE control_queue SET status = 'done', finished_at = ?2
             WHERE id = ?1 AND status IN ('pending', 'running')",
            params![id, now],
        )?;
        if n == 1 {
            return Ok(AckOutcome::Acked);
        }
        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM control_queue WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(match status.as_deref().and_then(ControlStatus::from_str) {
            Some(s) => AckOutcome::AlreadyFinal(s),
            None => AckOutcome::NotFound,
        })
    }

    /// Mark every pending/running record whose deadline has passed as `timeout`.
    /// Returns the ids that expired.
    pub fn expire_controls(&self, now: i64) -> SqliteResult<Vec<i64>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "UPDATE control_queue SET status = 'timeout', finished_at = ?1
             WHERE status IN ('pending', 'running')
               AND ack_deadline_at IS NOT NULL AND ack_deadline_at <= ?1
             RETURNING id",
        )?;
        let rows = stmt.query_map(params![now], |row| row.get(0))?;
        rows.collect()
    }

    fn row_to_control(row: &Row) -> SqliteResult<ControlRecord> {
        let status: String = row.get("status")?;
        let priority: i64 = row.get("priority")?;
        Ok(ControlRecord {
            id: row.get("id")?,
            content: row.get("content")?,
            priority: Priority::from_i64(priority).unwrap_or_default(),
            require_idle: row.get("require_idle")?,
            bypass_state: row.get("bypass_state")?,
            status: ControlStatus::from_str(&status).unwrap_or(ControlStatus::Failed),
            ack_deadline_at: row.get("ack_deadline_at")?,
            source: row.get("source")?,
            last_error: row.get("last_error")?,
            available_at: row.get("available_at")?,
            created_at: row.get("created_at")?,
            started_at: row.get("started_at")?,
            finished_at: row.get("finished_at")?,
        })
    }

    // ============ Checkpoints ============

    /// Create the next checkpoint ending at `end_id`.
    ///
    /// The start id is derived from the previous checkpoint inside the same
    /// write transaction. Returns None when `end_id` would not advance.
    pub fn create_checkpoint(
        &self,
        end_id: i64,
        summary: Option<&str>,
        now: i64,
    ) -> SqliteResult<Option<Checkpoint>> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        let start_id: i64 = tx.query_row(
            "SELECT COALESCE(MAX(end_conversation_id), 0) + 1 FROM checkpoints",
            [],
            |row| row.get(0),
        )?;
        if end_id < start_id {
            return Ok(None);
        }
        tx.execute(
            "INSERT INTO checkpoints (start_conversation_id, end_conversation_id, summary, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![start_id, end_id, summary, now],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(Some(Checkpoint {
            id,
            start_conversation_id: start_id,
            end_conversation_id: end_id,
            summary: summary.map(str::to_string),
            created_at: now,
        }))
    }

    pub fn latest_checkpoint(&self) -> SqliteResult<Option<Checkpoint>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT * FROM checkpoints ORDER BY id DESC LIMIT 1",
            [],
            Self::row_to_checkpoint,
        )
        .optional()
    }

    pub fn list_checkpoints(&self, limit: i64) -> SqliteResult<Vec<Checkpoint>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT * FROM checkpoints ORDER BY id DESC LIMIT ?1")?;
        let rows = stmt.query_map(params![limit], Self::row_to_checkpoint)?;
        rows.collect()
    }

    fn row_to_checkpoint(row: &Row) -> SqliteResult<Checkpoint> {
        Ok(Checkpoint {
            id: row.get("id")?,
            start_conversation_id: row.get("start_conversation_id")?,
            end_conversation_id: row.get("end_conversation_id")?,
            summary: row.get("summary")?,
            created_at: row.get("created_at")?,
        })
    }

    // ============ Scheduled tasks ============

    pub fn insert_task(&self, task: &NewScheduledTask, now: i64) -> SqliteResult<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO scheduled_tasks (name, prompt, kind, cron_expr, priority, require_idle,
                                          status, next_run_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'active', ?7, ?8)",
            params![
                task.name,
                task.prompt,
                task.kind.as_str(),
                task.cron_expr,
                task.priority.as_i64(),
                task.require_idle,
                task.next_run_at,
                now,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_task(&self, id: i64) -> SqliteResult<Option<ScheduledTask>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT * FROM scheduled_tasks WHERE id = ?1",
            params![id],
            Self::row_to_task,
        )
        .optional()
    }

    pub fn list_tasks(&self, status: Option<TaskStatus>) -> SqliteResult<Vec<ScheduledTask>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT * FROM scheduled_tasks WHERE (?1 IS NULL OR status = ?1) ORDER BY next_run_at ASC",
        )?;
        let rows = stmt.query_map(params![status.map(|s| s.as_str())], Self::row_to_task)?;
        rows.collect()
    }

    /// Active tasks whose next run time has arrived
    pub fn due_tasks(&self, now: i64) -> SqliteResult<Vec<ScheduledTask>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT * FROM scheduled_tasks WHERE status = 'active' AND next_run_at <= ?1
             ORDER BY next_run_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![now], Self::row_to_task)?;
        rows.collect()
    }

    /// Record that a task produced `message_id`.
    ///
    /// With `next_run_at` the task stays active for its next run; without it
    /// the task moves to `running` until its message finishes.
    pub fn mark_task_fired(
        &self,
        id: i64,
        message_id: i64,
        next_run_at: Option<i64>,
        now: i64,
    ) -> SqliteResult<()> {
        let conn = self.conn();
        match next_run_at {
            Some(next) => conn.execute(
                "UPDATE scheduled_tasks SET last_run_at = ?2, last_message_id = ?3, next_run_at = ?4,
                        last_error = NULL
                 WHERE id = ?1",
                params![id, now, message_id, next],
            )?,
            None => conn.execute(
                "UPDATE scheduled_tasks SET last_run_at = ?2, last_message_id = ?3, status = 'running',
                        last_error = NULL
                 WHERE id = ?1",
                params![id, now, message_id],
            )?,
        };
        Ok(())
    }

    /// Move a task's next run time, optionally recording why
    pub fn reschedule_task(&self, id: i64, next_run_at: i64, note: Option<&str>) -> SqliteResult<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE scheduled_tasks SET next_run_at = ?2, status = 'active', last_error = ?3 WHERE id = ?1",
            params![id, next_run_at, note],
        )?;
        Ok(())
    }

    pub fn set_task_status(
        &self,
        id: i64,
        status: TaskStatus,
        note: Option<&str>,
    ) -> SqliteResult<bool> {
        let conn = self.conn();
        let n = conn.execute(
            "UPDATE scheduled_tasks SET status = ?2, last_error = COALESCE(?3, last_error) WHERE id = ?1",
            params![id, status.as_str(), note],
        )?;
        Ok(n == 1)
    }

    pub fn delete_task(&self, id: i64) -> SqliteResult<bool> {
        let conn = self.conn();
        let n = conn.execute("DELETE FROM scheduled_tasks WHERE id = ?1", params![id])?;
        Ok(n == 1)
    }

    fn row_to_task(row: &Row) -> SqliteResult<ScheduledTask> {
        let kind: String = row.get("kind")?;
        let status: String = row.get("status")?;
        let priority: i64 = row.get("priority")?;
        Ok(ScheduledTask {
            id: row.get("id")?,
            name: row.get("name")?,
            prompt: row.get("prompt")?,
            kind: TaskKind::from_str(&kind).unwrap_or(TaskKind::Once),
            cron_expr: row.get("cron_expr")?,
            priority: Priority::from_i64(priority).unwrap_or_default(),
            require_idle: row.get("require_idle")?,
            status: TaskStatus::from_str(&status).unwrap_or(TaskStatus::Paused),
            next_run_at: row.get("next_run_at")?,
            last_run_at: row.get("last_run_at")?,
            last_message_id: row.get("last_message_id")?,
            last_error: row.get("last_error")?,
            created_at: row.get("created_at")?,
        })
    }
}

//! Staleness reaper
//!
//! Force-finishes messages that stayed `running` past the staleness limit so
//! the one-in-flight slot cannot be held forever by a lost completion.

use std::sync::Arc;

use tracing::{info, warn};

use crate::core::scheduler::{next_fire_after, parse_cron};
use crate::db::GatewayDB;
use crate::error::Result;
use crate::types::{secs_to_ms, MessageStatus, TaskKind, TaskStatus};

pub struct Reaper {
    db: Arc<GatewayDB>,
    max_running_ms: i64,
}

impl Reaper {
    pub fn new(db: Arc<GatewayDB>, max_running_secs: u64) -> Self {
        Self {
            db,
            max_running_ms: secs_to_ms(max_running_secs),
        }
    }

    /// Returns the ids of the messages that were force-finished
    pub fn reap(&self, now: i64) -> Result<Vec<i64>> {
        let cutoff = now.saturating_sub(self.max_running_ms);
        let mut reaped = Vec::new();
        for msg in self.db.stale_running_messages(cutoff)? {
            let task = match msg.task_id {
                Some(id) => self.db.get_task(id)?,
                None => None,
            };
            match task {
                Some(task) if task.kind == TaskKind::Recurring => {
                    // A recurring run that went quiet counts as completed.
                    if !self
                        .db
                        .finish_message(msg.id, MessageStatus::Done, None, now)?
                    {
                        continue;
                    }
                    let next = task
                        .cron_expr
                        .as_deref()
                        .and_then(|expr| parse_cron(expr).ok())
                        .and_then(|s| next_fire_after(&s, now));
                    if task.status == TaskStatus::Active {
                        if let Some(next) = next.filter(|n| *n > task.next_run_at) {
                            self.db.reschedule_task(task.id, next, None)?;
                        }
                    } else if task.status == TaskStatus::Running {
                        self.db
                            .reschedule_task(task.id, next.unwrap_or(task.next_run_at), None)?;
                    }
                    info!(
                        id = msg.id,
                        task_id = task.id,
                        reason = "completed",
                        "Stale recurring run marked done"
                    );
                }
                task => {
                    if !self.db.finish_message(
                        msg.id,
                        MessageStatus::Failed,
                        Some("stale: no completion reported"),
                        now,
                    )? {
                        continue;
                    }
                    if let Some(task) = task.filter(|t| t.kind == TaskKind::Once) {
                        self.db
                            .set_task_status(task.id, TaskStatus::Failed, Some("stale"))?;
                    }
                    warn!(id = msg.id, "Stale message failed");
                }
            }
            reaped.push(msg.id);
        }
        Ok(reaped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Direction, NewMessage, NewScheduledTask, Priority};

    const MIN: i64 = 60 * 1000;

    fn task(db: &GatewayDB, kind: TaskKind, cron: Option<&str>, next: i64) -> i64 {
        db.insert_task(
            &NewScheduledTask {
                name: "t".to_string(),
                prompt: "p".to_string(),
                kind,
                cron_expr: cron.map(str::to_string),
                priority: Priority::Normal,
                require_idle: false,
                next_run_at: next,
            },
            0,
        )
        .unwrap()
    }

    fn running(db: &GatewayDB, task_id: Option<i64>, started: i64) -> i64 {
        let id = db
            .insert_message(
                &NewMessage {
                    direction: Direction::In,
                    channel: "scheduler".to_string(),
                    endpoint: None,
                    content: "p".to_string(),
                    content_preview: None,
                    attachment_path: None,
                    priority: Priority::Normal,
                    status: MessageStatus::Pending,
                    require_idle: false,
                    task_id,
                    available_at: 0,
                },
                0,
            )
            .unwrap();
        assert!(db.claim_message(id, started).unwrap());
        id
    }

    #[test]
    fn test_fresh_messages_untouched() {
        let db = Arc::new(GatewayDB::in_memory().unwrap());
        let id = running(&db, None, 100 * MIN);
        let reaper = Reaper::new(db.clone(), 30 * 60);
        assert!(reaper.reap(120 * MIN).unwrap().is_empty());
        assert_eq!(
            db.get_message(id).unwrap().unwrap().status,
            MessageStatus::Running
        );
    }

    #[test]
    fn test_stale_once_fails_task() {
        let db = Arc::new(GatewayDB::in_memory().unwrap());
        let task_id = task(&db, TaskKind::Once, None, 0);
        let msg = running(&db, Some(task_id), 0);
        db.mark_task_fired(task_id, msg, None, 0).unwrap();

        let reaper = Reaper::new(db.clone(), 30 * 60);
        assert_eq!(reaper.reap(31 * MIN).unwrap(), vec![msg]);

        let m = db.get_message(msg).unwrap().unwrap();
        assert_eq!(m.status, MessageStatus::Failed);
        let t = db.get_task(task_id).unwrap().unwrap();
        assert_eq!(t.status, TaskStatus::Failed);
    }

    #[test]
    fn test_stale_recurring_done_and_rescheduled() {
        let db = Arc::new(GatewayDB::in_memory().unwrap());
        let task_id = task(&db, TaskKind::Recurring, Some("0 * * * *"), 0);
        let msg = running(&db, Some(task_id), 0);
        db.mark_task_fired(task_id, msg, None, 0).unwrap();

        let reaper = Reaper::new(db.clone(), 30 * 60);
        let now = 31 * MIN;
        assert_eq!(reaper.reap(now).unwrap(), vec![msg]);

        let m = db.get_message(msg).unwrap().unwrap();
        assert_eq!(m.status, MessageStatus::Done);
        assert!(m.last_error.is_none());
        let t = db.get_task(task_id).unwrap().unwrap();
        assert_eq!(t.status, TaskStatus::Active);
        assert_eq!(t.next_run_at, 60 * MIN);

        // Slot is free again.
        assert!(db.running_message().unwrap().is_none());
    }

    #[test]
    fn test_stale_plain_message_fails() {
        let db = Arc::new(GatewayDB::in_memory().unwrap());
        let msg = running(&db, None, 0);
        let reaper = Reaper::new(db.clone(), 60);
        assert_eq!(reaper.reap(2 * MIN).unwrap(), vec![msg]);
        assert_eq!(
            db.get_message(msg).unwrap().unwrap().status,
            MessageStatus::Failed
        );
    }
}

//! Scheduler
//!
//! Feeds time-based tasks into the intake gate like any other channel.
//! Cron expressions are interpreted by the `cron` crate; five-field
//! expressions get a zero seconds field prepended.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::intake::{IntakeGate, ReceiveRequest};
use crate::db::GatewayDB;
use crate::error::{GatewayError, Result};
use crate::types::{secs_to_ms, NewScheduledTask, Priority, ScheduledTask, TaskKind, TaskStatus};

const MINUTE_MS: i64 = 60 * 1000;
/// Runs later than this are marked late in the prompt
const LATE_AFTER_MS: i64 = 5 * MINUTE_MS;
/// Runs later than this are skipped (recurring) or missed (once)
const MISSED_AFTER_MS: i64 = 60 * MINUTE_MS;

pub const SCHEDULER_CHANNEL: &str = "scheduler";

/// Arguments of `schedule_create`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskRequest {
    pub name: String,
    pub prompt: String,
    /// Makes the task recurring
    #[serde(default)]
    pub cron: Option<String>,
    /// One-time run at this epoch-ms instant
    #[serde(default)]
    pub run_at: Option<i64>,
    /// One-time run this many seconds from now
    #[serde(default)]
    pub delay_seconds: Option<u64>,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub require_idle: bool,
}

/// What one scheduler tick did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerReport {
    pub fired: Vec<i64>,
    pub late: Vec<i64>,
    pub skipped: Vec<i64>,
    pub missed: Vec<i64>,
    /// Turned away by intake; still due
    pub deferred: Vec<i64>,
}

/// Parse a cron expression, accepting the classic five-field form
pub fn parse_cron(expr: &str) -> Result<Schedule> {
    let trimmed = expr.trim();
    let normalized = if trimmed.split_whitespace().count() == 5 {
        format!("0 {}", trimmed)
    } else {
        trimmed.to_string()
    };
    Schedule::from_str(&normalized)
        .map_err(|e| GatewayError::InvalidArgs(format!("invalid cron '{}': {}", expr, e)))
}

/// First fire time strictly after `after_ms`
pub fn next_fire_after(schedule: &Schedule, after_ms: i64) -> Option<i64> {
    let after: DateTime<Utc> = DateTime::from_timestamp_millis(after_ms)?;
    schedule.after(&after).next().map(|t| t.timestamp_millis())
}

pub struct Scheduler {
    db: Arc<GatewayDB>,
    intake: Arc<IntakeGate>,
}

impl Scheduler {
    pub fn new(db: Arc<GatewayDB>, intake: Arc<IntakeGate>) -> Self {
        Self { db, intake }
    }

    pub fn create_task(&self, req: CreateTaskRequest, now: i64) -> Result<ScheduledTask> {
        if req.name.trim().is_empty() {
            return Err(GatewayError::InvalidArgs("name is required".into()));
        }
        if req.prompt.trim().is_empty() {
            return Err(GatewayError::InvalidArgs("prompt is required".into()));
        }
        let priority = match req.priority {
            None => Priority::Normal,
            Some(p) => Priority::from_message_band(p).ok_or_else(|| {
                GatewayError::InvalidArgs(format!("priority must be 1..3, got {}", p))
            })?,
        };
        let (kind, cron_expr, next_run_at) = match req.cron {
            Some(expr) => {
                let schedule = parse_cron(&expr)?;
                let next = next_fire_after(&schedule, now).ok_or_else(|| {
                    GatewayError::InvalidArgs(format!("cron '{}' never fires", expr))
                })?;
                (TaskKind::Recurring, Some(expr.trim().to_string()), next)
            }
            None => {
                let at = match (req.run_at, req.delay_seconds) {
                    (Some(at), _) => at,
                    (None, Some(delay)) => now.saturating_add(secs_to_ms(delay)),
                    (None, None) => now,
                };
                (TaskKind::Once, None, at)
            }
        };

        let id = self.db.insert_task(
            &NewScheduledTask {
                name: req.name.trim().to_string(),
                prompt: req.prompt,
                kind,
                cron_expr,
                priority,
                require_idle: req.require_idle,
                next_run_at,
            },
            now,
        )?;
        info!(id, kind = kind.as_str(), next_run_at, "Task scheduled");
        self.get(id)
    }

    pub fn get(&self, id: i64) -> Result<ScheduledTask> {
        self.db
            .get_task(id)?
            .ok_or_else(|| GatewayError::NotFound(format!("task {}", id)))
    }

    pub fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<ScheduledTask>> {
        Ok(self.db.list_tasks(status)?)
    }

    pub fn pause(&self, id: i64) -> Result<ScheduledTask> {
        let task = self.get(id)?;
        if task.status != TaskStatus::Active {
            return Err(GatewayError::InvalidArgs(format!(
                "task {} is {}, only active tasks can be paused",
                id,
                task.status.as_str()
            )));
        }
        self.db.set_task_status(id, TaskStatus::Paused, None)?;
        info!(id, "Task paused");
        self.get(id)
    }

    /// Resume a paused task. Recurring tasks restart from the next cron time
    /// instead of replaying what was missed while paused.
    pub fn resume(&self, id: i64, now: i64) -> Result<ScheduledTask> {
        let task = self.get(id)?;
        if task.status != TaskStatus::Paused {
            return Err(GatewayError::InvalidArgs(format!(
                "task {} is {}, not paused",
                id,
                task.status.as_str()
            )));
        }
        let next = match (&task.kind, task.cron_expr.as_deref()) {
            (TaskKind::Recurring, Some(expr)) => next_fire_after(&parse_cron(expr)?, now)
                .unwrap_or(task.next_run_at),
            _ => task.next_run_at,
        };
        self.db.reschedule_task(id, next, task.last_error.as_deref())?;
        info!(id, next_run_at = next, "Task resumed");
        self.get(id)
    }

    pub fn delete(&self, id: i64) -> Result<()> {
        if !self.db.delete_task(id)? {
            return Err(GatewayError::NotFound(format!("task {}", id)));
        }
        info!(id, "Task deleted");
        Ok(())
    }

    /// Fire every due task according to how late it is
    pub fn tick(&self, now: i64) -> Result<SchedulerReport> {
        let mut report = SchedulerReport::default();
        for task in self.db.due_tasks(now)? {
            let lateness = now - task.next_run_at;
            let schedule = match (task.kind, task.cron_expr.as_deref()) {
                (TaskKind::Recurring, Some(expr)) => match parse_cron(expr) {
                    Ok(s) => Some(s),
                    Err(e) => {
                        warn!(id = task.id, error = %e, "Recurring task has bad cron");
                        self.db
                            .set_task_status(task.id, TaskStatus::Failed, Some(&e.to_string()))?;
                        continue;
                    }
                },
                _ => None,
            };

            if lateness > MISSED_AFTER_MS {
                match &schedule {
                    Some(s) => {
                        let next = next_fire_after(s, now).unwrap_or(i64::MAX);
                        self.db
                            .reschedule_task(task.id, next, Some("skipped missed run"))?;
                        info!(id = task.id, late_min = lateness / MINUTE_MS, "Skipped missed recurring run");
                        report.skipped.push(task.id);
                    }
                    None => {
                        self.db
                            .set_task_status(task.id, TaskStatus::Failed, Some("missed"))?;
                        warn!(id = task.id, late_min = lateness / MINUTE_MS, "One-time task missed");
                        report.missed.push(task.id);
                    }
                }
                continue;
            }

            let late = lateness > LATE_AFTER_MS;
            let mut content = format!("[scheduled task: {}] ", task.name);
            if late {
                content.push_str(&format!("[late by {} min] ", lateness / MINUTE_MS));
            }
            content.push_str(&task.prompt);

            let admitted = self.intake.admit(
                ReceiveRequest {
                    channel: Some(SCHEDULER_CHANNEL.to_string()),
                    endpoint: None,
                    content,
                    priority: Some(task.priority.as_i64()),
                    require_idle: task.require_idle,
                    no_reply: true,
                    task_id: Some(task.id),
                },
                now,
            );
            match admitted {
                Ok(message_id) => {
                    let next = schedule
                        .as_ref()
                        .map(|s| next_fire_after(s, now).unwrap_or(i64::MAX));
                    self.db.mark_task_fired(task.id, message_id, next, now)?;
                    info!(id = task.id, message_id, late, "Task fired");
                    report.fired.push(task.id);
                    if late {
                        report.late.push(task.id);
                    }
                }
                Err(GatewayError::HealthRecovering) | Err(GatewayError::HealthDown) => {
                    debug!(id = task.id, "Agent unhealthy, task stays due");
                    report.deferred.push(task.id);
                }
                Err(e) => {
                    warn!(id = task.id, error = %e, "Task could not be admitted");
                    self.db
                        .set_task_status(task.id, TaskStatus::Failed, Some(&e.to_string()))?;
                }
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use chrono::TimeZone;
    use tempfile::{tempdir, TempDir};

    struct Rig {
        _dir: TempDir,
        db: Arc<GatewayDB>,
        config: Arc<GatewayConfig>,
        scheduler: Scheduler,
    }

    fn rig() -> Rig {
        let dir = tempdir().unwrap();
        let config = Arc::new(GatewayConfig::with_home(dir.path().to_path_buf()));
        let db = Arc::new(GatewayDB::in_memory().unwrap());
        let intake = Arc::new(IntakeGate::new(db.clone(), config.clone()));
        Rig {
            _dir: dir,
            scheduler: Scheduler::new(db.clone(), intake),
            db,
            config,
        }
    }

    fn at(h: u32, m: u32) -> i64 {
        Utc.with_ymd_and_hms(2026, 3, 2, h, m, 0)
            .unwrap()
            .timestamp_millis()
    }

    fn once(rig: &Rig, run_at: i64) -> ScheduledTask {
        rig.scheduler
            .create_task(
                CreateTaskRequest {
                    name: "report".to_string(),
                    prompt: "Write the report".to_string(),
                    run_at: Some(run_at),
                    ..Default::default()
                },
                0,
            )
            .unwrap()
    }

    fn hourly(rig: &Rig, now: i64) -> ScheduledTask {
        rig.scheduler
            .create_task(
                CreateTaskRequest {
                    name: "inbox sweep".to_string(),
                    prompt: "Check the inbox".to_string(),
                    cron: Some("0 * * * *".to_string()),
                    ..Default::default()
                },
                now,
            )
            .unwrap()
    }

    #[test]
    fn test_parse_cron_accepts_five_fields() {
        let s = parse_cron("30 9 * * *").unwrap();
        let next = next_fire_after(&s, at(8, 0)).unwrap();
        assert_eq!(next, at(9, 30));
        assert!(parse_cron("not a cron").is_err());
    }

    #[test]
    fn test_on_time_once_task_fires() {
        let rig = rig();
        let task = once(&rig, at(9, 0));
        assert_eq!(task.kind, TaskKind::Once);

        assert!(rig.scheduler.tick(at(8, 59)).unwrap().fired.is_empty());
        let report = rig.scheduler.tick(at(9, 2)).unwrap();
        assert_eq!(report.fired, vec![task.id]);
        assert!(report.late.is_empty());

        let task = rig.scheduler.get(task.id).unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        let msg = rig.db.get_message(task.last_message_id.unwrap()).unwrap().unwrap();
        assert_eq!(msg.channel, SCHEDULER_CHANNEL);
        assert_eq!(msg.task_id, Some(task.id));
        assert!(!msg.content.contains("[late"));
        assert!(!msg.content.contains("[reply via"));
    }

    #[test]
    fn test_late_run_is_marked() {
        let rig = rig();
        let task = once(&rig, at(9, 0));
        let report = rig.scheduler.tick(at(9, 20)).unwrap();
        assert_eq!(report.late, vec![task.id]);
        let msg_id = rig.scheduler.get(task.id).unwrap().last_message_id.unwrap();
        let msg = rig.db.get_message(msg_id).unwrap().unwrap();
        assert!(msg.content.contains("[late by 20 min]"));
    }

    #[test]
    fn test_very_late_once_is_missed() {
        let rig = rig();
        let task = once(&rig, at(9, 0));
        let report = rig.scheduler.tick(at(10, 1)).unwrap();
        assert_eq!(report.missed, vec![task.id]);
        let task = rig.scheduler.get(task.id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.last_error.as_deref(), Some("missed"));
        assert!(rig.db.list_messages(None, 10).unwrap().is_empty());
    }

    #[test]
    fn test_recurring_fires_and_skips() {
        let rig = rig();
        let task = hourly(&rig, at(8, 30));
        assert_eq!(task.kind, TaskKind::Recurring);
        assert_eq!(task.next_run_at, at(9, 0));

        let report = rig.scheduler.tick(at(9, 0)).unwrap();
        assert_eq!(report.fired, vec![task.id]);
        let after_fire = rig.scheduler.get(task.id).unwrap();
        assert_eq!(after_fire.status, TaskStatus::Active);
        assert_eq!(after_fire.next_run_at, at(10, 0));

        // Daemon was off for hours: skip to the next slot, no message.
        let report = rig.scheduler.tick(at(13, 30)).unwrap();
        assert_eq!(report.skipped, vec![task.id]);
        let skipped = rig.scheduler.get(task.id).unwrap();
        assert_eq!(skipped.next_run_at, at(14, 0));
        assert_eq!(rig.db.list_messages(None, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_unhealthy_leaves_task_due() {
        let rig = rig();
        let task = once(&rig, at(9, 0));
        std::fs::write(&rig.config.status_file, r#"{"health":"down"}"#).unwrap();
        let report = rig.scheduler.tick(at(9, 1)).unwrap();
        assert_eq!(report.deferred, vec![task.id]);
        assert_eq!(rig.scheduler.get(task.id).unwrap().status, TaskStatus::Active);

        std::fs::write(&rig.config.status_file, r#"{"health":"ok"}"#).unwrap();
        assert_eq!(rig.scheduler.tick(at(9, 2)).unwrap().fired, vec![task.id]);
    }

    #[test]
    fn test_pause_resume_delete() {
        let rig = rig();
        let task = hourly(&rig, at(8, 30));
        rig.scheduler.pause(task.id).unwrap();
        assert!(rig.scheduler.tick(at(9, 0)).unwrap().fired.is_empty());
        assert!(rig.scheduler.pause(task.id).is_err());

        let resumed = rig.scheduler.resume(task.id, at(11, 10)).unwrap();
        assert_eq!(resumed.status, TaskStatus::Active);
        assert_eq!(resumed.next_run_at, at(12, 0));

        rig.scheduler.delete(task.id).unwrap();
        assert!(matches!(
            rig.scheduler.delete(task.id),
            Err(GatewayError::NotFound(_))
        ));
    }

    #[test]
    fn test_create_validation() {
        let rig = rig();
        let bad_cron = rig.scheduler.create_task(
            CreateTaskRequest {
                name: "x".to_string(),
                prompt: "y".to_string(),
                cron: Some("every tuesday".to_string()),
                ..Default::default()
            },
            0,
        );
        assert!(matches!(bad_cron, Err(GatewayError::InvalidArgs(_))));
        let no_prompt = rig.scheduler.create_task(
            CreateTaskRequest {
                name: "x".to_string(),
                ..Default::default()
            },
            0,
        );
        assert!(matches!(no_prompt, Err(GatewayError::InvalidArgs(_))));
    }
}

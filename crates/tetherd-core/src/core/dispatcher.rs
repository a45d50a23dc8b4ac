//! Dispatcher
//!
//! One tick injects at most one item into the hosted session: the control
//! queue head first, then the message queue head. While an available control
//! record is pending, no message is injected. Messages stay `running`
//! until the completion pathway reports them finished, and the claim
//! statement refuses while another inbound message is in flight.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::db::GatewayDB;
use crate::error::{GatewayError, Result};
use crate::liveness::{HealthState, LivenessFile};
use crate::session::SessionHost;
use crate::types::{now_ms, ControlRecord, Message, MessageStatus, Priority, TaskKind, TaskStatus};

/// What a single dispatcher tick did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Hosted session absent; nothing attempted
    NoSession,
    /// Nothing eligible right now
    Idle,
    /// A message is already in flight
    InFlight(i64),
    ControlInjected(i64),
    MessageInjected(i64),
    /// Injection failed; the item was released or failed
    InjectFailed(i64),
}

pub struct Dispatcher {
    db: Arc<GatewayDB>,
    config: Arc<GatewayConfig>,
    session: Arc<dyn SessionHost>,
    liveness: LivenessFile,
}

impl Dispatcher {
    pub fn new(
        db: Arc<GatewayDB>,
        config: Arc<GatewayConfig>,
        session: Arc<dyn SessionHost>,
    ) -> Self {
        let liveness = LivenessFile::new(&config.status_file);
        Self {
            db,
            config,
            session,
            liveness,
        }
    }

    /// Whether an item with these constraints may be injected now
    fn eligible(
        &self,
        priority: Priority,
        require_idle: bool,
        bypass_state: bool,
        idle: u64,
        health: HealthState,
    ) -> bool {
        if bypass_state {
            return true;
        }
        if health != HealthState::Ok {
            return false;
        }
        !require_idle || idle >= self.config.idle_thresholds.for_priority(priority)
    }

    pub async fn tick(&self, now: i64) -> Result<TickOutcome> {
        if !self.session.exists().await {
            debug!("Session absent, waiting");
            return Ok(TickOutcome::NoSession);
        }
        // Unknown idleness counts as fully idle.
        let idle = self.session.idle_seconds().await.unwrap_or(u64::MAX);
        let health = self.liveness.health();

        // A waiting control record holds the message queue back.
        if let Some(ctl) = self.db.next_pending_control(now)? {
            if !self.eligible(ctl.priority, ctl.require_idle, ctl.bypass_state, idle, health) {
                debug!(id = ctl.id, idle, health = health.as_str(), "Head control not eligible");
                return Ok(TickOutcome::Idle);
            }
            if self.db.claim_control(ctl.id, now)? {
                return self.inject_control(ctl, now).await;
            }
        }

        if let Some(running) = self.db.running_message()? {
            return Ok(TickOutcome::InFlight(running.id));
        }
        let Some(msg) = self.db.next_pending_message(now)? else {
            return Ok(TickOutcome::Idle);
        };
        if !self.eligible(msg.priority, msg.require_idle, false, idle, health) {
            debug!(id = msg.id, idle, health = health.as_str(), "Head message not eligible");
            return Ok(TickOutcome::Idle);
        }
        if !self.db.claim_message(msg.id, now)? {
            return Ok(match self.db.running_message()? {
                Some(running) => TickOutcome::InFlight(running.id),
                None => TickOutcome::Idle,
            });
        }
        self.inject_message(msg).await
    }

    async fn inject_control(&self, ctl: ControlRecord, now: i64) -> Result<TickOutcome> {
        match self.session.inject(&ctl.content).await {
            Ok(()) => {
                info!(id = ctl.id, source = %ctl.source, "Control injected");
                Ok(TickOutcome::ControlInjected(ctl.id))
            }
            Err(e) => {
                warn!(id = ctl.id, error = %e, "Control injection failed");
                self.db.fail_control(ctl.id, &e.to_string(), now)?;
                Ok(TickOutcome::InjectFailed(ctl.id))
            }
        }
    }

    async fn inject_message(&self, msg: Message) -> Result<TickOutcome> {
        let text = injection_text(&msg);
        match self.session.inject(&text).await {
            Ok(()) => {
                info!(id = msg.id, channel = %msg.channel, attempt = msg.attempts + 1, "Message injected");
                Ok(TickOutcome::MessageInjected(msg.id))
            }
            Err(e) => {
                warn!(id = msg.id, error = %e, "Message injection failed, requeueing");
                self.db.release_message(msg.id, &e.to_string())?;
                Ok(TickOutcome::InjectFailed(msg.id))
            }
        }
    }

    /// Completion pathway: `running → done | failed`
    pub fn complete(&self, id: i64, ok: bool, error: Option<&str>) -> Result<Message> {
        let now = now_ms();
        let status = if ok {
            MessageStatus::Done
        } else {
            MessageStatus::Failed
        };
        if !self.db.finish_message(id, status, error, now)? {
            return Err(match self.db.get_message(id)? {
                None => GatewayError::NotFound(format!("message {}", id)),
                Some(m) => GatewayError::InvalidArgs(format!(
                    "message {} is {}, not running",
                    id,
                    m.status.as_str()
                )),
            });
        }
        let msg = self
            .db
            .get_message(id)?
            .ok_or_else(|| GatewayError::NotFound(format!("message {}", id)))?;
        info!(id, status = status.as_str(), "Message completed");

        if let Some(task_id) = msg.task_id {
            self.finish_task(task_id, ok, error)?;
        }
        Ok(msg)
    }

    fn finish_task(&self, task_id: i64, ok: bool, error: Option<&str>) -> Result<()> {
        let Some(task) = self.db.get_task(task_id)? else {
            return Ok(());
        };
        // Recurring tasks were already rescheduled when they fired.
        if task.kind == TaskKind::Once && task.status == TaskStatus::Running {
            let status = if ok { TaskStatus::Done } else { TaskStatus::Failed };
            self.db.set_task_status(task_id, status, error)?;
            debug!(task_id, status = status.as_str(), "Task finished with its message");
        }
        Ok(())
    }
}

/// Text typed into the session for a message
fn injection_text(msg: &Message) -> String {
    format!("[msg {} via {}] {}", msg.id, msg.channel, msg.content)
}

//! Heartbeat engine
//!
//! Drives the `ok → recovering → down → ok` health machine from liveness
//! probes sent through the control plane. The engine is the only writer of
//! health and the only component that terminates or restarts the session.
//!
//! ```text
//!   ok ──probe timeout──▶ verify ──fails──▶ recovering ──N failures──▶ down
//!    ▲                      │ack               │ack                      │ack
//!    └──────────────────────┴──────────────────┴─────────────────────────┘
//! ```

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::GatewayConfig;
use crate::core::control::{ControlPlane, EnqueueRequest, CONTROL_ID_PLACEHOLDER};
use crate::db::GatewayDB;
use crate::error::Result;
use crate::liveness::{HealthState, LivenessFile, LivenessStatus, PendingChannels};
use crate::notify::ChannelNotifier;
use crate::session::SessionHost;
use crate::types::{secs_to_ms, ControlStatus};

/// Sent to every channel that was turned away while the agent was unhealthy
pub const RECOVERY_NOTICE: &str =
    "The agent is back online. If your last message went unanswered, please send it again.";

const PROBE_SOURCE: &str = "heartbeat";

#[derive(Debug)]
struct Inner {
    health: HealthState,
    /// Outstanding probe control id
    probe: Option<i64>,
    /// The outstanding probe is the verify probe after a miss
    verifying: bool,
    /// Failed recovery probes since entering `recovering`
    attempts: u32,
    next_probe_at: i64,
}

/// Snapshot for `health_status`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatStatus {
    pub health: HealthState,
    pub verifying: bool,
    pub recovery_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outstanding_probe: Option<i64>,
    pub next_probe_at: i64,
    pub liveness: LivenessStatus,
}

pub struct HeartbeatEngine {
    db: Arc<GatewayDB>,
    config: Arc<GatewayConfig>,
    control: ControlPlane,
    session: Arc<dyn SessionHost>,
    notifier: Arc<dyn ChannelNotifier>,
    liveness: LivenessFile,
    pending: PendingChannels,
    inner: Mutex<Inner>,
}

impl HeartbeatEngine {
    /// Resume from whatever health the status file last recorded
    pub fn new(
        db: Arc<GatewayDB>,
        config: Arc<GatewayConfig>,
        session: Arc<dyn SessionHost>,
        notifier: Arc<dyn ChannelNotifier>,
    ) -> Self {
        let liveness = LivenessFile::new(&config.status_file);
        let pending = PendingChannels::new(&config.pending_file);
        let health = liveness.health();
        if health != HealthState::Ok {
            warn!(health = health.as_str(), "Starting with unhealthy agent");
        }
        Self {
            control: ControlPlane::new(db.clone()),
            db,
            config,
            session,
            notifier,
            liveness,
            pending,
            inner: Mutex::new(Inner {
                health,
                probe: None,
                verifying: false,
                attempts: 0,
                next_probe_at: 0,
            }),
        }
    }

    pub async fn status(&self) -> HeartbeatStatus {
        let inner = self.inner.lock().await;
        HeartbeatStatus {
            health: inner.health,
            verifying: inner.verifying,
            recovery_attempts: inner.attempts,
            outstanding_probe: inner.probe,
            next_probe_at: inner.next_probe_at,
            liveness: self.liveness.read(),
        }
    }

    /// Advance the machine: resolve the outstanding probe, then send the next
    /// one when due. Returns the health after the tick.
    pub async fn tick(&self, now: i64) -> Result<HealthState> {
        let mut inner = self.inner.lock().await;

        if let Some(id) = inner.probe {
            let status = self.db.get_control(id)?.map(|r| r.status);
            match status {
                Some(ControlStatus::Pending) | Some(ControlStatus::Running) => {
                    return Ok(inner.health);
                }
                Some(ControlStatus::Done) => {
                    inner.probe = None;
                    self.on_ack(&mut inner, now).await?;
                }
                other => {
                    inner.probe = None;
                    let cause = match other {
                        Some(ControlStatus::Timeout) => format!("probe {} timed out", id),
                        Some(ControlStatus::Failed) => format!("probe {} could not be delivered", id),
                        _ => format!("probe {} vanished", id),
                    };
                    self.on_failure(&mut inner, now, &cause).await?;
                }
            }
        }

        if inner.probe.is_none() && now >= inner.next_probe_at {
            let deadline = if inner.verifying {
                self.config.verify_deadline_secs
            } else {
                self.config.probe_deadline_secs
            };
            let id = self.send_probe(deadline, now)?;
            inner.probe = Some(id);
        }
        Ok(inner.health)
    }

    fn send_probe(&self, deadline_secs: u64, now: i64) -> Result<i64> {
        let id = self.control.enqueue_at(
            EnqueueRequest {
                content: format!(
                    "[heartbeat] Liveness check. Run `tether-ctl ack {}` now.",
                    CONTROL_ID_PLACEHOLDER
                ),
                priority: Some(0),
                require_idle: false,
                bypass_state: true,
                ack_deadline_seconds: Some(deadline_secs),
                available_in_seconds: None,
                source: Some(PROBE_SOURCE.to_string()),
            },
            now,
        )?;
        debug!(id, deadline_secs, "Probe sent");
        Ok(id)
    }

    async fn on_ack(&self, inner: &mut Inner, now: i64) -> Result<()> {
        inner.verifying = false;
        inner.attempts = 0;
        inner.next_probe_at = now.saturating_add(secs_to_ms(self.config.probe_interval_secs));
        if inner.health == HealthState::Ok {
            debug!("Probe acked");
            return Ok(());
        }
        let from = inner.health;
        self.transition(inner, HealthState::Ok, "probe acked", now)?;
        info!(from = from.as_str(), "Agent recovered");
        self.flush_pending().await;
        Ok(())
    }

    async fn on_failure(&self, inner: &mut Inner, now: i64, cause: &str) -> Result<()> {
        match inner.health {
            HealthState::Ok if !inner.verifying => {
                warn!(cause = %cause, "Probe missed, verifying");
                inner.verifying = true;
                inner.next_probe_at = now;
            }
            HealthState::Ok => {
                inner.verifying = false;
                inner.attempts = 0;
                let cause = format!("verify failed: {}", cause);
                self.transition(inner, HealthState::Recovering, &cause, now)?;
                if let Err(e) = self.session.terminate().await {
                    error!(error = %e, "Failed to terminate session");
                }
                self.restart(inner, now).await;
            }
            HealthState::Recovering => {
                inner.attempts += 1;
                if inner.attempts >= self.config.max_recovery_attempts {
                    let cause = format!(
                        "{} recovery attempts failed, last: {}",
                        inner.attempts, cause
                    );
                    self.transition(inner, HealthState::Down, &cause, now)?;
                    inner.next_probe_at =
                        now.saturating_add(secs_to_ms(self.config.down_probe_interval_secs));
                } else {
                    warn!(attempt = inner.attempts, cause = %cause, "Recovery probe failed, retrying");
                    self.restart(inner, now).await;
                }
            }
            HealthState::Down => {
                debug!(cause = %cause, "Still down");
                inner.next_probe_at =
                    now.saturating_add(secs_to_ms(self.config.down_probe_interval_secs));
            }
        }
        Ok(())
    }

    /// Restart the session and probe straight away
    async fn restart(&self, inner: &mut Inner, now: i64) {
        match self.session.restart().await {
            Ok(()) => info!(attempt = inner.attempts + 1, "Session restarted"),
            Err(e) => error!(error = %e, "Session restart failed"),
        }
        inner.next_probe_at = now;
    }

    fn transition(&self, inner: &mut Inner, to: HealthState, cause: &str, now: i64) -> Result<()> {
        let from = inner.health;
        self.liveness.write_health(to, cause, now)?;
        inner.health = to;
        match to {
            HealthState::Ok => info!(from = from.as_str(), to = to.as_str(), cause = %cause, "Health transition"),
            _ => warn!(from = from.as_str(), to = to.as_str(), cause = %cause, "Health transition"),
        }
        Ok(())
    }

    /// Tell every turned-away channel the agent is back, once each
    async fn flush_pending(&self) {
        let entries = match self.pending.drain() {
            Ok(entries) => entries,
            Err(e) => {
                error!(error = %e, "Failed to drain pending channels");
                return;
            }
        };
        for entry in &entries {
            if let Err(e) = self
                .notifier
                .notify(&entry.channel, entry.endpoint.as_deref(), RECOVERY_NOTICE)
                .await
            {
                warn!(channel = %entry.channel, error = %e, "Recovery notice failed");
            }
        }
        if !entries.is_empty() {
            info!(count = entries.len(), "Pending channels notified");
        }
    }
}

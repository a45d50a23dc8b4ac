//! Control plane
//!
//! Out-of-band queue for liveness probes and maintenance commands. Records
//! may carry an ack deadline; a background sweep times out records whose
//! deadline passed without an ack.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::db::{AckOutcome, GatewayDB};
use crate::error::{GatewayError, Result};
use crate::types::{now_ms, secs_to_ms, ControlRecord, ControlStatus, NewControl, Priority};

/// Replaced by the record's own id after insert
pub const CONTROL_ID_PLACEHOLDER: &str = "{{control_id}}";

/// Arguments of `enqueue`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueRequest {
    pub content: String,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub require_idle: bool,
    #[serde(default)]
    pub bypass_state: bool,
    #[serde(default)]
    pub ack_deadline_seconds: Option<u64>,
    #[serde(default)]
    pub available_in_seconds: Option<u64>,
    #[serde(default)]
    pub source: Option<String>,
}

/// Result of `ack`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AckResult {
    pub ok: bool,
    /// The record was already terminal; nothing changed
    pub already_final: bool,
    pub status: ControlStatus,
}

pub struct ControlPlane {
    db: Arc<GatewayDB>,
}

impl ControlPlane {
    pub fn new(db: Arc<GatewayDB>) -> Self {
        Self { db }
    }

    pub fn enqueue(&self, req: EnqueueRequest) -> Result<i64> {
        self.enqueue_at(req, now_ms())
    }

    /// Insert a pending record. The ack deadline counts from `available_at`.
    pub fn enqueue_at(&self, req: EnqueueRequest, now: i64) -> Result<i64> {
        if req.content.trim().is_empty() {
            return Err(GatewayError::InvalidArgs("content is required".into()));
        }
        let priority = match req.priority {
            None => Priority::Normal,
            Some(p) => Priority::from_i64(p).ok_or_else(|| {
                GatewayError::InvalidArgs(format!("priority must be 0..3, got {}", p))
            })?,
        };
        let delay_ms = secs_to_ms(req.available_in_seconds.unwrap_or(0));
        let available_at = now.saturating_add(delay_ms);
        let ack_deadline_at = req
            .ack_deadline_seconds
            .map(|secs| available_at.saturating_add(secs_to_ms(secs)));
        let source = req.source.unwrap_or_else(|| "manual".to_string());

        let id = self.db.insert_control(
            &NewControl {
                content: req.content.clone(),
                priority,
                require_idle: req.require_idle,
                bypass_state: req.bypass_state,
                ack_deadline_at,
                available_at,
                source: source.clone(),
            },
            now,
        )?;
        if req.content.contains(CONTROL_ID_PLACEHOLDER) {
            let content = req.content.replace(CONTROL_ID_PLACEHOLDER, &id.to_string());
            self.db.set_control_content(id, &content)?;
        }
        info!(id, source = %source, priority = priority.as_i64(), deadline = ?ack_deadline_at, "Control enqueued");
        Ok(id)
    }

    pub fn get(&self, id: i64) -> Result<ControlRecord> {
        self.db
            .get_control(id)?
            .ok_or_else(|| GatewayError::NotFound(format!("control record {}", id)))
    }

    /// Acknowledge a record. Acking a terminal record is a successful no-op.
    pub fn ack(&self, id: i64) -> Result<AckResult> {
        self.ack_at(id, now_ms())
    }

    pub fn ack_at(&self, id: i64, now: i64) -> Result<AckResult> {
        match self.db.ack_control(id, now)? {
            AckOutcome::Acked => {
                info!(id, "Control acked");
                Ok(AckResult {
                    ok: true,
                    already_final: false,
                    status: ControlStatus::Done,
                })
            }
            AckOutcome::AlreadyFinal(status) => {
                debug!(id, status = status.as_str(), "Ack on final record");
                Ok(AckResult {
                    ok: true,
                    already_final: true,
                    status,
                })
            }
            AckOutcome::NotFound => Err(GatewayError::NotFound(format!("control record {}", id))),
        }
    }

    pub fn list(&self, status: Option<ControlStatus>, limit: i64) -> Result<Vec<ControlRecord>> {
        Ok(self.db.list_controls(status, limit)?)
    }

    /// Time out every pending/running record whose deadline has passed
    pub fn sweep(&self, now: i64) -> Result<Vec<i64>> {
        let expired = self.db.expire_controls(now)?;
        for id in &expired {
            warn!(id, "Control record timed out");
        }
        Ok(expired)
    }
}

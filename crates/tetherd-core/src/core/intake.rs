//! Intake gate
//!
//! Admission control for every message entering the gateway. Health is
//! checked on every call: a session that may not exist never accepts new
//! load, but a missing or corrupt status file never blocks intake.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::GatewayConfig;
use crate::db::GatewayDB;
use crate::error::{ErrorCode, GatewayError, Result};
use crate::liveness::{HealthState, LivenessFile, PendingChannels};
use crate::types::{now_ms, Direction, MessageStatus, NewMessage, Priority};

/// Channel recorded for no-reply messages submitted without one
const DIRECT_CHANNEL: &str = "direct";

/// Arguments of `receive`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiveRequest {
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub require_idle: bool,
    #[serde(default)]
    pub no_reply: bool,
    /// Set by the scheduler to link the message to its task
    #[serde(skip)]
    pub task_id: Option<i64>,
}

/// Result of `receive`: `{ok:true, id}` or `{ok:false, code}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReceiveOutcome {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ReceiveOutcome {
    pub fn accepted(id: i64) -> Self {
        Self {
            ok: true,
            id: Some(id),
            code: None,
            error: None,
        }
    }

    pub fn rejected(err: &GatewayError) -> Self {
        Self {
            ok: false,
            id: None,
            code: Some(err.code()),
            error: Some(err.to_string()),
        }
    }
}

/// Spilled or inline body ready to persist
struct Body {
    content: String,
    preview: Option<String>,
    attachment: Option<String>,
}

pub struct IntakeGate {
    db: Arc<GatewayDB>,
    config: Arc<GatewayConfig>,
    liveness: LivenessFile,
    pending: PendingChannels,
}

impl IntakeGate {
    pub fn new(db: Arc<GatewayDB>, config: Arc<GatewayConfig>) -> Self {
        let liveness = LivenessFile::new(&config.status_file);
        let pending = PendingChannels::new(&config.pending_file);
        Self {
            db,
            config,
            liveness,
            pending,
        }
    }

    /// Admit an inbound message, never erroring out of band
    pub fn receive(&self, req: ReceiveRequest) -> ReceiveOutcome {
        match self.admit(req, now_ms()) {
            Ok(id) => ReceiveOutcome::accepted(id),
            Err(e) => {
                match e.code() {
                    ErrorCode::InternalError => warn!(error = %e, "Receive failed"),
                    _ => debug!(error = %e, "Receive rejected"),
                }
                ReceiveOutcome::rejected(&e)
            }
        }
    }

    /// Validate, health-gate and persist an inbound message
    pub fn admit(&self, req: ReceiveRequest, now: i64) -> Result<i64> {
        if req.content.trim().is_empty() {
            return Err(GatewayError::InvalidArgs("content is required".into()));
        }
        let channel = match req.channel.as_deref().map(str::trim) {
            Some(c) if !c.is_empty() => c.to_string(),
            _ if req.no_reply => DIRECT_CHANNEL.to_string(),
            _ => return Err(GatewayError::InvalidArgs("channel is required".into())),
        };
        let priority = match req.priority {
            None => Priority::Normal,
            Some(p) => Priority::from_message_band(p).ok_or_else(|| {
                GatewayError::InvalidArgs(format!("priority must be 1..3, got {}", p))
            })?,
        };

        let health = self.liveness.health();
        if health != HealthState::Ok {
            if !req.no_reply {
                if let Err(e) = self.pending.record(&channel, req.endpoint.as_deref()) {
                    warn!(channel = %channel, error = %e, "Failed to record pending channel");
                }
            }
            info!(channel = %channel, health = health.as_str(), "Rejecting message while unhealthy");
            return Err(match health {
                HealthState::Down => GatewayError::HealthDown,
                _ => GatewayError::HealthRecovering,
            });
        }

        let body = self.spill(&req.content)?;
        let mut content = body.content;
        if !req.no_reply {
            content.push_str(&self.reply_suffix(&channel, req.endpoint.as_deref()));
        }

        let id = self.db.insert_message(
            &NewMessage {
                direction: Direction::In,
                channel: channel.clone(),
                endpoint: req.endpoint,
                content,
                content_preview: body.preview,
                attachment_path: body.attachment,
                priority,
                status: MessageStatus::Pending,
                require_idle: req.require_idle,
                task_id: req.task_id,
                available_at: now,
            },
            now,
        )?;
        info!(id, channel = %channel, priority = priority.as_i64(), "Message queued");
        Ok(id)
    }

    /// Append an outbound audit row (`direction=out`, already `done`)
    pub fn record_outbound(
        &self,
        channel: &str,
        endpoint: Option<&str>,
        content: &str,
    ) -> Result<i64> {
        if channel.trim().is_empty() {
            return Err(GatewayError::InvalidArgs("channel is required".into()));
        }
        if content.trim().is_empty() {
            return Err(GatewayError::InvalidArgs("content is required".into()));
        }
        let now = now_ms();
        let body = self.spill(content)?;
        let id = self.db.insert_message(
            &NewMessage {
                direction: Direction::Out,
                channel: channel.trim().to_string(),
                endpoint: endpoint.map(str::to_string),
                content: body.content,
                content_preview: body.preview,
                attachment_path: body.attachment,
                priority: Priority::Normal,
                status: MessageStatus::Done,
                require_idle: false,
                task_id: None,
                available_at: now,
            },
            now,
        )?;
        debug!(id, channel = %channel, "Outbound recorded");
        Ok(id)
    }

    /// Line telling the agent how to answer on this channel
    pub fn reply_suffix(&self, channel: &str, endpoint: Option<&str>) -> String {
        format!(
            "\n\n[reply via: {}]",
            self.config.reply_command(channel, endpoint)
        )
    }

    fn spill(&self, content: &str) -> Result<Body> {
        if content.len() <= self.config.spill_threshold_bytes {
            return Ok(Body {
                content: content.to_string(),
                preview: None,
                attachment: None,
            });
        }
        std::fs::create_dir_all(&self.config.attachments_dir)?;
        let path: PathBuf = self
            .config
            .attachments_dir
            .join(format!("msg-{}.txt", Uuid::new_v4()));
        std::fs::write(&path, content)?;

        let preview = truncate_at_char_boundary(content, self.config.preview_bytes).to_string();
        let path_str = path.to_string_lossy().to_string();
        debug!(bytes = content.len(), path = %path_str, "Payload spilled to attachment");
        Ok(Body {
            content: format!(
                "{}\n[truncated, {} bytes total; full text at {}]",
                preview,
                content.len(),
                path_str
            ),
            preview: Some(preview),
            attachment: Some(path_str),
        })
    }
}

/// Longest prefix of `s` no longer than `max` bytes that ends on a char boundary
pub(crate) fn truncate_at_char_boundary(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Message;
    use tempfile::{tempdir, TempDir};

    fn gate() -> (TempDir, IntakeGate, Arc<GatewayDB>, Arc<GatewayConfig>) {
        let dir = tempdir().unwrap();
        let mut config = GatewayConfig::with_home(dir.path().to_path_buf());
        config.spill_threshold_bytes = 64;
        config.preview_bytes = 16;
        let config = Arc::new(config);
        let db = Arc::new(GatewayDB::in_memory().unwrap());
        let gate = IntakeGate::new(db.clone(), config.clone());
        (dir, gate, db, config)
    }

    fn req(channel: &str, content: &str) -> ReceiveRequest {
        ReceiveRequest {
            channel: Some(channel.to_string()),
            endpoint: Some("42".to_string()),
            content: content.to_string(),
            ..Default::default()
        }
    }

    fn stored(db: &GatewayDB, id: i64) -> Message {
        db.get_message(id).unwrap().unwrap()
    }

    #[test]
    fn test_receive_appends_reply_suffix() {
        let (_dir, gate, db, _) = gate();
        let out = gate.receive(req("telegram", "hello"));
        assert!(out.ok);
        let msg = stored(&db, out.id.unwrap());
        assert_eq!(msg.status, MessageStatus::Pending);
        assert_eq!(msg.priority, Priority::Normal);
        assert_eq!(msg.content, "hello\n\n[reply via: telegram-send 42]");
    }

    #[test]
    fn test_no_reply_skips_suffix_and_channel() {
        let (_dir, gate, db, _) = gate();
        let out = gate.receive(ReceiveRequest {
            content: "note to self".to_string(),
            no_reply: true,
            ..Default::default()
        });
        let msg = stored(&db, out.id.unwrap());
        assert_eq!(msg.content, "note to self");
        assert_eq!(msg.channel, DIRECT_CHANNEL);
    }

    #[test]
    fn test_validation() {
        let (_dir, gate, _db, _) = gate();
        let blank = gate.receive(req("telegram", "   "));
        assert_eq!(blank.code, Some(ErrorCode::InvalidArgs));

        let no_channel = gate.receive(ReceiveRequest {
            content: "hi".to_string(),
            ..Default::default()
        });
        assert_eq!(no_channel.code, Some(ErrorCode::InvalidArgs));

        for bad in [0, 4, -1] {
            let mut r = req("telegram", "hi");
            r.priority = Some(bad);
            assert_eq!(gate.receive(r).code, Some(ErrorCode::InvalidArgs));
        }
    }

    #[test]
    fn test_unhealthy_rejects_and_records_pending_once() {
        let (_dir, gate, db, config) = gate();
        std::fs::write(&config.status_file, r#"{"health":"recovering"}"#).unwrap();

        let out = gate.receive(req("telegram", "hello"));
        assert!(!out.ok);
        assert_eq!(out.code, Some(ErrorCode::HealthRecovering));
        assert!(db.list_messages(None, 10).unwrap().is_empty());

        let pending = PendingChannels::new(&config.pending_file).list().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].channel, "telegram");
        assert_eq!(pending[0].endpoint.as_deref(), Some("42"));

        std::fs::write(&config.status_file, r#"{"health":"down"}"#).unwrap();
        assert_eq!(
            gate.receive(req("telegram", "again")).code,
            Some(ErrorCode::HealthDown)
        );
    }

    #[tokio::test]
    async fn test_hostile_pending_endpoint_is_inert_when_flushed() {
        use crate::notify::{ChannelNotifier, CommandNotifier};

        let dir = tempdir().unwrap();
        let out = dir.path().join("sent.txt");
        let marker = dir.path().join("marker");
        let mut config = GatewayConfig::with_home(dir.path().to_path_buf());
        config.reply_commands.insert(
            "file".to_string(),
            format!("printf '%s|%s' {{endpoint}} > {}", out.display()),
        );
        let config = Arc::new(config);
        let gate = IntakeGate::new(Arc::new(GatewayDB::in_memory().unwrap()), config.clone());
        std::fs::write(&config.status_file, r#"{"health":"recovering"}"#).unwrap();

        let endpoint = format!("$(touch {})", marker.display());
        let rejected = gate.receive(ReceiveRequest {
            channel: Some("file".to_string()),
            endpoint: Some(endpoint.clone()),
            content: "hello".to_string(),
            ..Default::default()
        });
        assert_eq!(rejected.code, Some(ErrorCode::HealthRecovering));

        let notifier = CommandNotifier::new(config.clone());
        for entry in PendingChannels::new(&config.pending_file).drain().unwrap() {
            notifier
                .notify(&entry.channel, entry.endpoint.as_deref(), "back")
                .await
                .unwrap();
        }
        assert!(!marker.exists());
        assert_eq!(
            std::fs::read_to_string(&out).unwrap(),
            format!("{}|back", endpoint)
        );
    }

    #[test]
    fn test_no_reply_rejection_leaves_no_pending_entry() {
        let (_dir, gate, _db, config) = gate();
        std::fs::write(&config.status_file, r#"{"health":"down"}"#).unwrap();
        let out = gate.receive(ReceiveRequest {
            channel: Some("scheduler".to_string()),
            content: "tick".to_string(),
            no_reply: true,
            ..Default::default()
        });
        assert_eq!(out.code, Some(ErrorCode::HealthDown));
        assert!(PendingChannels::new(&config.pending_file).list().unwrap().is_empty());
    }

    #[test]
    fn test_missing_or_corrupt_status_fails_open() {
        let (_dir, gate, _db, config) = gate();
        assert!(gate.receive(req("telegram", "a")).ok);
        std::fs::write(&config.status_file, "\u{0}garbage").unwrap();
        assert!(gate.receive(req("telegram", "b")).ok);
    }

    #[test]
    fn test_large_payload_spills() {
        let (_dir, gate, db, _) = gate();
        let big = "é".repeat(100);
        let id = gate.receive(req("telegram", &big)).id.unwrap();
        let msg = stored(&db, id);

        let preview = msg.content_preview.clone().unwrap();
        assert!(preview.len() <= 16);
        assert!(big.starts_with(&preview));
        let path = msg.attachment_path.clone().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), big);
        assert!(msg.content.starts_with(&preview));
        assert!(msg.content.contains(&path));
        assert!(msg.content.len() < big.len());
    }

    #[test]
    fn test_record_outbound() {
        let (_dir, gate, db, _) = gate();
        let id = gate.record_outbound("telegram", Some("42"), "sent!").unwrap();
        let msg = stored(&db, id);
        assert_eq!(msg.direction, Direction::Out);
        assert_eq!(msg.status, MessageStatus::Done);
        assert!(db.next_pending_message(i64::MAX).unwrap().is_none());
        assert!(gate.record_outbound("", None, "x").is_err());
    }

    #[test]
    fn test_truncate_at_char_boundary() {
        assert_eq!(truncate_at_char_boundary("abc", 10), "abc");
        assert_eq!(truncate_at_char_boundary("héllo", 2), "h");
        assert_eq!(truncate_at_char_boundary("héllo", 3), "hé");
    }
}

//! Liveness status file and pending-channel record
//!
//! The status file is shared with the external idle tracker, which writes
//! `state`/`idle_seconds`. The heartbeat engine is the only writer of the
//! `health*` fields. Readers decode leniently: anything missing or malformed
//! falls back to healthy so a corrupt file can never block intake.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// Process-wide liveness classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    #[default]
    Ok,
    Recovering,
    Down,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Ok => "ok",
            HealthState::Recovering => "recovering",
            HealthState::Down => "down",
        }
    }

    /// Unknown strings decode as `Ok` (fail open)
    fn decode(value: Option<&Value>) -> Self {
        match value.and_then(Value::as_str) {
            Some("recovering") => HealthState::Recovering,
            Some("down") => HealthState::Down,
            _ => HealthState::Ok,
        }
    }
}

/// Activity classification reported by the idle tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Busy,
    Idle,
    Offline,
    #[default]
    Unknown,
}

impl AgentState {
    fn decode(value: Option<&Value>) -> Self {
        match value.and_then(Value::as_str) {
            Some("busy") => AgentState::Busy,
            Some("idle") => AgentState::Idle,
            Some("offline") => AgentState::Offline,
            _ => AgentState::Unknown,
        }
    }
}

/// Decoded contents of the status file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct LivenessStatus {
    pub state: AgentState,
    pub idle_seconds: Option<u64>,
    pub health: HealthState,
    pub last_check: Option<String>,
    pub source: Option<String>,
    /// Bumped on every health transition
    pub health_version: u64,
    pub health_cause: Option<String>,
    pub health_since: Option<i64>,
}

impl LivenessStatus {
    /// Lenient decode: each field falls back independently
    pub fn decode(text: &str) -> Self {
        let value: Value = match serde_json::from_str(text) {
            Ok(v @ Value::Object(_)) => v,
            _ => return Self::default(),
        };
        Self {
            state: AgentState::decode(value.get("state")),
            idle_seconds: value.get("idle_seconds").and_then(Value::as_u64),
            health: HealthState::decode(value.get("health")),
            last_check: value
                .get("last_check")
                .and_then(Value::as_str)
                .map(str::to_string),
            source: value
                .get("source")
                .and_then(Value::as_str)
                .map(str::to_string),
            health_version: value
                .get("health_version")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            health_cause: value
                .get("health_cause")
                .and_then(Value::as_str)
                .map(str::to_string),
            health_since: value.get("health_since").and_then(Value::as_i64),
        }
    }
}

/// Handle to the liveness status file
#[derive(Debug, Clone)]
pub struct LivenessFile {
    path: PathBuf,
}

impl LivenessFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current status; a missing or unreadable file reads as the default
    pub fn read(&self) -> LivenessStatus {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => LivenessStatus::decode(&text),
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %self.path.display(), error = %e, "Status file unreadable, assuming healthy");
                }
                LivenessStatus::default()
            }
        }
    }

    pub fn health(&self) -> HealthState {
        self.read().health
    }

    /// Record a health transition, preserving the idle tracker's fields.
    pub fn write_health(
        &self,
        health: HealthState,
        cause: &str,
        now: i64,
    ) -> std::io::Result<LivenessStatus> {
        let mut value = match std::fs::read_to_string(&self.path) {
            Ok(text) => match serde_json::from_str::<Value>(&text) {
                Ok(v @ Value::Object(_)) => v,
                _ => Value::Object(Default::default()),
            },
            Err(_) => Value::Object(Default::default()),
        };
        let version = value
            .get("health_version")
            .and_then(Value::as_u64)
            .unwrap_or(0)
            + 1;
        if let Value::Object(map) = &mut value {
            map.insert("health".into(), Value::from(health.as_str()));
            map.insert("health_version".into(), Value::from(version));
            map.insert("health_cause".into(), Value::from(cause));
            map.insert("health_since".into(), Value::from(now));
        }

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&value)?)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!(health = health.as_str(), version, "Health written");
        Ok(LivenessStatus::decode(&value.to_string()))
    }
}

/// A channel endpoint waiting to hear that the agent is back
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingChannel {
    pub channel: String,
    #[serde(default)]
    pub endpoint: Option<String>,
}

/// Append-only record of rejected channels, flushed on recovery
#[derive(Debug, Clone)]
pub struct PendingChannels {
    path: PathBuf,
}

impl PendingChannels {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn record(&self, channel: &str, endpoint: Option<&str>) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let entry = PendingChannel {
            channel: channel.to_string(),
            endpoint: endpoint.map(str::to_string),
        };
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    /// Entries currently recorded (malformed lines skipped)
    pub fn list(&self) -> std::io::Result<Vec<PendingChannel>> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => Ok(Self::parse(&text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// Take every entry exactly once and leave the record empty.
    ///
    /// Duplicates collapse to one notification per channel/endpoint.
    pub fn drain(&self) -> std::io::Result<Vec<PendingChannel>> {
        let draining = self.path.with_extension("draining");
        match std::fs::rename(&self.path, &draining) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        }
        // Appends racing the rename land in a fresh file at `path`.
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let text = std::fs::read_to_string(&draining)?;
        std::fs::remove_file(&draining)?;

        let mut unique: Vec<PendingChannel> = Vec::new();
        for entry in Self::parse(&text) {
            if !unique.contains(&entry) {
                unique.push(entry);
            }
        }
        Ok(unique)
    }

    fn parse(text: &str) -> Vec<PendingChannel> {
        text.lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| match serde_json::from_str::<PendingChannel>(l) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!(line = %l, error = %e, "Skipping malformed pending-channel line");
                    None
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_is_healthy() {
        let dir = tempdir().unwrap();
        let file = LivenessFile::new(dir.path().join("status.json"));
        assert_eq!(file.health(), HealthState::Ok);
        assert_eq!(file.read().idle_seconds, None);
    }

    #[test]
    fn test_malformed_file_is_healthy() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("status.json");
        std::fs::write(&path, "{not json").unwrap();
        assert_eq!(LivenessFile::new(&path).health(), HealthState::Ok);

        std::fs::write(&path, r#"["recovering"]"#).unwrap();
        assert_eq!(LivenessFile::new(&path).health(), HealthState::Ok);

        std::fs::write(&path, r#"{"health": 7, "state": "dancing"}"#).unwrap();
        let status = LivenessFile::new(&path).read();
        assert_eq!(status.health, HealthState::Ok);
        assert_eq!(status.state, AgentState::Unknown);
    }

    #[test]
    fn test_decode_full_status() {
        let status = LivenessStatus::decode(
            r#"{"state":"idle","idle_seconds":45,"health":"recovering","last_check":"2026-01-01T00:00:00Z","source":"hook"}"#,
        );
        assert_eq!(status.state, AgentState::Idle);
        assert_eq!(status.idle_seconds, Some(45));
        assert_eq!(status.health, HealthState::Recovering);
        assert_eq!(status.source.as_deref(), Some("hook"));
    }

    #[test]
    fn test_write_health_preserves_tracker_fields() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("status.json");
        std::fs::write(&path, r#"{"state":"busy","idle_seconds":3,"source":"hook"}"#).unwrap();
        let file = LivenessFile::new(&path);

        let first = file.write_health(HealthState::Recovering, "probe timeout", 100).unwrap();
        assert_eq!(first.health_version, 1);
        let second = file.write_health(HealthState::Ok, "probe acked", 200).unwrap();
        assert_eq!(second.health_version, 2);

        let status = file.read();
        assert_eq!(status.health, HealthState::Ok);
        assert_eq!(status.state, AgentState::Busy);
        assert_eq!(status.idle_seconds, Some(3));
        assert_eq!(status.health_cause.as_deref(), Some("probe acked"));
        assert_eq!(status.health_since, Some(200));
    }

    #[test]
    fn test_pending_record_and_drain() {
        let dir = tempdir().unwrap();
        let pending = PendingChannels::new(dir.path().join("pending.jsonl"));
        assert!(pending.drain().unwrap().is_empty());

        pending.record("telegram", Some("42")).unwrap();
        pending.record("telegram", Some("42")).unwrap();
        pending.record("slack", None).unwrap();
        assert_eq!(pending.list().unwrap().len(), 3);

        let drained = pending.drain().unwrap();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].channel, "telegram");
        assert_eq!(drained[1].endpoint, None);

        assert!(pending.list().unwrap().is_empty());
        assert!(pending.drain().unwrap().is_empty());
    }

    #[test]
    fn test_pending_skips_bad_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pending.jsonl");
        std::fs::write(&path, "{\"channel\":\"a\"}\ngarbage\n\n{\"channel\":\"b\",\"endpoint\":\"1\"}\n").unwrap();
        let pending = PendingChannels::new(&path);
        let list = pending.list().unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[1].endpoint.as_deref(), Some("1"));
    }
}

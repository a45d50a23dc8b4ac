//! Gateway configuration
//!
//! Defaults, then `config.yaml` under the home directory, then environment
//! overrides.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::Priority;

/// Idle seconds required before a `require_idle` item may be injected,
/// per priority band. More urgent bands wait less.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdleThresholds {
    pub liveness: u64,
    pub urgent: u64,
    pub high: u64,
    pub normal: u64,
}

impl Default for IdleThresholds {
    fn default() -> Self {
        Self {
            liveness: 0,
            urgent: 3,
            high: 10,
            normal: 30,
        }
    }
}

impl IdleThresholds {
    pub fn for_priority(&self, priority: Priority) -> u64 {
        match priority {
            Priority::Liveness => self.liveness,
            Priority::Urgent => self.urgent,
            Priority::High => self.high,
            Priority::Normal => self.normal,
        }
    }
}

/// Gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Root directory for all state
    pub home: PathBuf,
    pub db_path: PathBuf,
    /// Liveness status file written by the idle tracker
    pub status_file: PathBuf,
    /// Line-delimited JSON of channels waiting for recovery
    pub pending_file: PathBuf,
    pub attachments_dir: PathBuf,
    pub ipc_socket: PathBuf,

    /// Payloads larger than this (bytes) spill to an attachment file
    pub spill_threshold_bytes: usize,
    /// Size of the preview kept in the table for spilled payloads (bytes)
    pub preview_bytes: usize,
    pub idle_thresholds: IdleThresholds,
    /// Reply command per channel; `{channel}` and `{endpoint}` are substituted.
    /// Leave the placeholders unquoted.
    pub reply_command_template: String,
    pub reply_commands: HashMap<String, String>,

    pub dispatch_interval_secs: u64,
    pub probe_interval_secs: u64,
    pub probe_deadline_secs: u64,
    pub verify_deadline_secs: u64,
    pub max_recovery_attempts: u32,
    pub down_probe_interval_secs: u64,
    pub sweep_interval_secs: u64,
    pub scheduler_interval_secs: u64,
    /// Messages running longer than this are reaped
    pub message_stale_secs: u64,
    /// `done` messages older than this (and already checkpointed) are pruned; 0 disables
    pub retention_days: u64,

    /// tmux session hosting the agent
    pub session_name: String,
    /// Command that launches the agent inside a fresh session
    pub session_command: String,
    /// Working directory for a fresh session
    pub session_cwd: Option<PathBuf>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self::with_home(default_home())
    }
}

/// `$TETHER_HOME` or `~/.tether`
pub fn default_home() -> PathBuf {
    if let Ok(home) = std::env::var("TETHER_HOME") {
        return PathBuf::from(home);
    }
    dirs::home_dir()
        .map(|h| h.join(".tether"))
        .unwrap_or_else(|| PathBuf::from(".tether"))
}

fn env_path(var: &str) -> Option<PathBuf> {
    std::env::var(var).ok().map(PathBuf::from)
}

fn env_u64(var: &str) -> Option<u64> {
    std::env::var(var).ok().and_then(|v| v.parse::<u64>().ok())
}

impl GatewayConfig {
    /// Defaults rooted at `home`
    pub fn with_home(home: PathBuf) -> Self {
        Self {
            db_path: home.join("gateway.db"),
            status_file: home.join("status.json"),
            pending_file: home.join("pending_channels.jsonl"),
            attachments_dir: home.join("attachments"),
            ipc_socket: home.join("tetherd.sock"),
            home,
            spill_threshold_bytes: 8 * 1024,
            preview_bytes: 1024,
            idle_thresholds: IdleThresholds::default(),
            reply_command_template: "{channel}-send {endpoint}".to_string(),
            reply_commands: HashMap::new(),
            dispatch_interval_secs: 2,
            probe_interval_secs: 300,
            probe_deadline_secs: 120,
            verify_deadline_secs: 60,
            max_recovery_attempts: 3,
            down_probe_interval_secs: 600,
            sweep_interval_secs: 5,
            scheduler_interval_secs: 10,
            message_stale_secs: 30 * 60,
            retention_days: 30,
            session_name: "agent".to_string(),
            session_command: "claude --continue".to_string(),
            session_cwd: None,
        }
    }

    /// Load `config.yaml` from the home directory (if any) and apply env overrides
    pub fn load() -> anyhow::Result<Self> {
        let home = default_home();
        let path = home.join("config.yaml");
        let mut config = if path.exists() {
            Self::from_file(&path, &home)?
        } else {
            Self::with_home(home)
        };
        config.apply_env();
        Ok(config)
    }

    /// Parse a YAML file; fields it omits keep their defaults for `home`,
    /// or for the file's own `home:` when it sets one
    pub fn from_file(path: &Path, home: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let value: serde_yaml::Value = serde_yaml::from_str(&content)?;
        let home = match value.get("home").and_then(serde_yaml::Value::as_str) {
            Some(h) => PathBuf::from(h),
            None => home.to_path_buf(),
        };
        let mut base = serde_yaml::to_value(Self::with_home(home))?;
        if let (serde_yaml::Value::Mapping(base_map), serde_yaml::Value::Mapping(overrides)) =
            (&mut base, value)
        {
            for (k, v) in overrides {
                base_map.insert(k, v);
            }
        } else {
            warn!(path = %path.display(), "Config is not a mapping, using defaults");
        }
        let config: Self = serde_yaml::from_value(base)?;
        info!(path = %path.display(), "Config loaded");
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Some(p) = env_path("TETHER_DB_PATH") {
            self.db_path = p;
        }
        if let Some(p) = env_path("TETHER_STATUS_FILE") {
            self.status_file = p;
        }
        if let Some(p) = env_path("TETHER_PENDING_FILE") {
            self.pending_file = p;
        }
        if let Some(p) = env_path("TETHER_IPC_SOCKET") {
            self.ipc_socket = p;
        }
        if let Ok(name) = std::env::var("TETHER_SESSION") {
            self.session_name = name;
        }
        if let Ok(cmd) = std::env::var("TETHER_SESSION_COMMAND") {
            self.session_command = cmd;
        }
        if let Some(p) = env_path("TETHER_SESSION_CWD") {
            self.session_cwd = Some(p);
        }
        if let Some(secs) = env_u64("TETHER_PROBE_INTERVAL_SECS") {
            self.probe_interval_secs = secs;
        }
        if let Some(bytes) = env_u64("TETHER_SPILL_THRESHOLD_BYTES") {
            self.spill_threshold_bytes = bytes as usize;
        }
    }

    /// Outbound command an agent should run to answer on `channel`
    pub fn reply_command(&self, channel: &str, endpoint: Option<&str>) -> String {
        self.template_for(channel)
            .replace("{channel}", channel)
            .replace("{endpoint}", endpoint.unwrap_or(""))
            .trim_end()
            .to_string()
    }

    /// Reply command as an `sh` script: `$2` is the channel, `$3` the
    /// endpoint. Values never pass through shell parsing.
    pub fn reply_script(&self, channel: &str) -> String {
        self.template_for(channel)
            .replace("{channel}", "\"$2\"")
            .replace("{endpoint}", "${3:+\"$3\"}")
            .trim_end()
            .to_string()
    }

    fn template_for(&self, channel: &str) -> &str {
        self.reply_commands
            .get(channel)
            .unwrap_or(&self.reply_command_template)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_rooted_at_home() {
        let config = GatewayConfig::with_home(PathBuf::from("/srv/tether"));
        assert_eq!(config.db_path, PathBuf::from("/srv/tether/gateway.db"));
        assert_eq!(config.status_file, PathBuf::from("/srv/tether/status.json"));
        assert!(config.idle_thresholds.urgent < config.idle_thresholds.high);
        assert!(config.idle_thresholds.high < config.idle_thresholds.normal);
    }

    #[test]
    fn test_from_file_overrides_some_fields() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "probe_interval_secs: 42\nsession_name: ops\nidle_thresholds:\n  normal: 90\n",
        )
        .unwrap();

        let config = GatewayConfig::from_file(&path, dir.path()).unwrap();
        assert_eq!(config.probe_interval_secs, 42);
        assert_eq!(config.session_name, "ops");
        assert_eq!(config.idle_thresholds.normal, 90);
        assert_eq!(config.idle_thresholds.urgent, 3);
        assert_eq!(config.db_path, dir.path().join("gateway.db"));
    }

    #[test]
    fn test_home_in_file_moves_derived_paths() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "home: /srv/agent\nipc_socket: /run/tetherd.sock\n",
        )
        .unwrap();

        let config = GatewayConfig::from_file(&path, dir.path()).unwrap();
        assert_eq!(config.home, PathBuf::from("/srv/agent"));
        assert_eq!(config.db_path, PathBuf::from("/srv/agent/gateway.db"));
        assert_eq!(config.status_file, PathBuf::from("/srv/agent/status.json"));
        assert_eq!(
            config.pending_file,
            PathBuf::from("/srv/agent/pending_channels.jsonl")
        );
        assert_eq!(config.attachments_dir, PathBuf::from("/srv/agent/attachments"));
        assert_eq!(config.ipc_socket, PathBuf::from("/run/tetherd.sock"));
    }

    #[test]
    fn test_reply_command() {
        let mut config = GatewayConfig::with_home(PathBuf::from("/tmp/t"));
        assert_eq!(
            config.reply_command("telegram", Some("123")),
            "telegram-send 123"
        );
        assert_eq!(config.reply_command("cli", None), "cli-send");

        config
            .reply_commands
            .insert("slack".to_string(), "slack-post --to {endpoint}".to_string());
        assert_eq!(
            config.reply_command("slack", Some("C01")),
            "slack-post --to C01"
        );
    }

    #[test]
    fn test_reply_script_uses_positional_parameters() {
        let mut config = GatewayConfig::with_home(PathBuf::from("/tmp/t"));
        assert_eq!(config.reply_script("telegram"), r#""$2"-send ${3:+"$3"}"#);

        config
            .reply_commands
            .insert("slack".to_string(), "slack-post --to {endpoint}".to_string());
        assert_eq!(config.reply_script("slack"), r#"slack-post --to ${3:+"$3"}"#);
    }
}

//! tmux-backed session host

use std::path::PathBuf;
use std::process::{Output, Stdio};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::SessionHost;
use crate::error::{GatewayError, Result};
use crate::liveness::{AgentState, LivenessFile};

/// Agent session living in a named tmux session
pub struct TmuxSession {
    name: String,
    command: String,
    cwd: Option<PathBuf>,
    status: LivenessFile,
}

impl TmuxSession {
    pub fn new(name: impl Into<String>, command: impl Into<String>, status: LivenessFile) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            cwd: None,
            status,
        }
    }

    /// Working directory for restarted sessions
    pub fn with_cwd(mut self, cwd: PathBuf) -> Self {
        self.cwd = Some(cwd);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn tmux(&self, args: &[&str]) -> Result<Output> {
        debug!(?args, "tmux");
        let output = Command::new("tmux")
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;
        Ok(output)
    }

    async fn tmux_ok(&self, args: &[&str]) -> Result<()> {
        let output = self.tmux(args).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(GatewayError::Session(format!(
                "tmux {} failed: {}",
                args.first().copied().unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

#[async_trait]
impl SessionHost for TmuxSession {
    async fn exists(&self) -> bool {
        match self.tmux(&["has-session", "-t", &self.name]).await {
            Ok(output) => output.status.success(),
            Err(e) => {
                warn!(session = %self.name, error = %e, "tmux unavailable");
                false
            }
        }
    }

    async fn inject(&self, text: &str) -> Result<()> {
        // Literal mode so the payload is never parsed as key names.
        self.tmux_ok(&["send-keys", "-t", &self.name, "-l", text])
            .await?;
        self.tmux_ok(&["send-keys", "-t", &self.name, "Enter"]).await?;
        debug!(session = %self.name, len = text.len(), "Injected");
        Ok(())
    }

    async fn idle_seconds(&self) -> Option<u64> {
        let status = self.status.read();
        match status.state {
            AgentState::Busy => Some(0),
            _ => status.idle_seconds,
        }
    }

    async fn terminate(&self) -> Result<()> {
        if !self.exists().await {
            return Ok(());
        }
        self.tmux_ok(&["kill-session", "-t", &self.name]).await?;
        info!(session = %self.name, "Session terminated");
        Ok(())
    }

    async fn restart(&self) -> Result<()> {
        if self.exists().await {
            self.terminate().await?;
        }
        let cwd = self
            .cwd
            .as_ref()
            .map(|p| p.to_string_lossy().to_string());
        let mut args = vec!["new-session", "-d", "-s", self.name.as_str()];
        if let Some(dir) = cwd.as_deref() {
            args.push("-c");
            args.push(dir);
        }
        args.push(self.command.as_str());
        self.tmux_ok(&args).await?;
        info!(session = %self.name, command = %self.command, "Session started");
        Ok(())
    }
}

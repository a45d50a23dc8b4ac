//! Channel notifier
//!
//! Channel send adapters are external. The gateway only needs "send this text
//! to that endpoint", which it gets by running the channel's reply command.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};

#[async_trait]
pub trait ChannelNotifier: Send + Sync {
    async fn notify(&self, channel: &str, endpoint: Option<&str>, text: &str) -> Result<()>;
}

/// Runs `<reply command> "<text>"` through `sh`. Channel, endpoint and text
/// reach the script as positional parameters only.
pub struct CommandNotifier {
    config: Arc<GatewayConfig>,
}

impl CommandNotifier {
    pub fn new(config: Arc<GatewayConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ChannelNotifier for CommandNotifier {
    async fn notify(&self, channel: &str, endpoint: Option<&str>, text: &str) -> Result<()> {
        let script = self.config.reply_script(channel);
        debug!(channel = %channel, endpoint = ?endpoint, script = %script, "Notifying channel");
        let output = Command::new("sh")
            .arg("-c")
            .arg(format!("{} \"$1\"", script))
            .arg("tether-notify")
            .arg(text)
            .arg(channel)
            .arg(endpoint.unwrap_or(""))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await?;
        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(channel = %channel, stderr = %stderr, "Reply command failed");
            Err(GatewayError::Session(format!(
                "reply command for {} exited with {}",
                channel, output.status
            )))
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_command_notifier_passes_text_as_argument() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("out.txt");
        let mut config = GatewayConfig::with_home(dir.path().to_path_buf());
        config.reply_commands.insert(
            "file".to_string(),
            format!("printf '%s|%s' {{endpoint}} > {}", out.display()),
        );
        let notifier = CommandNotifier::new(Arc::new(config));

        notifier
            .notify("file", Some("ep1"), "back online; $(echo pwned)")
            .await
            .unwrap();
        let written = std::fs::read_to_string(&out).unwrap();
        assert_eq!(written, "ep1|back online; $(echo pwned)");
    }

    #[tokio::test]
    async fn test_command_notifier_never_runs_endpoint_or_channel() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("out.txt");
        let marker = dir.path().join("marker");
        let mut config = GatewayConfig::with_home(dir.path().to_path_buf());
        config.reply_commands.insert(
            "file".to_string(),
            format!("printf '%s|%s' {{endpoint}} > {}", out.display()),
        );
        let notifier = CommandNotifier::new(Arc::new(config));

        let endpoint = format!("42; touch {} #", marker.display());
        notifier.notify("file", Some(&endpoint), "back").await.unwrap();
        assert!(!marker.exists());
        assert_eq!(
            std::fs::read_to_string(&out).unwrap(),
            format!("{}|back", endpoint)
        );

        // Unknown channel falls back to `{channel}-send`, which names no real command.
        let channel = format!("true; touch {}; echo", marker.display());
        assert!(notifier.notify(&channel, None, "back").await.is_err());
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_command_notifier_omits_missing_endpoint() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("out.txt");
        let mut config = GatewayConfig::with_home(dir.path().to_path_buf());
        config.reply_commands.insert(
            "file".to_string(),
            format!("printf '%s,' {{channel}} {{endpoint}} > {}", out.display()),
        );
        let notifier = CommandNotifier::new(Arc::new(config));

        notifier.notify("file", None, "hi").await.unwrap();
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "file,hi,");
    }
}

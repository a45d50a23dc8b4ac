//! Hosted agent session
//!
//! The gateway never talks to the agent directly. It injects text into the
//! interactive session hosting it and reads idleness from the status file.

mod tmux;

pub use tmux::TmuxSession;

use async_trait::async_trait;

use crate::error::Result;

/// Capability surface of the session hosting the agent
#[async_trait]
pub trait SessionHost: Send + Sync {
    /// Whether the session is currently present
    async fn exists(&self) -> bool;

    /// Type `text` into the session and submit it
    async fn inject(&self, text: &str) -> Result<()>;

    /// Seconds the agent has been idle; `None` when unknown
    async fn idle_seconds(&self) -> Option<u64>;

    /// Forcibly end the session
    async fn terminate(&self) -> Result<()>;

    /// Start a fresh session running the agent
    async fn restart(&self) -> Result<()>;
}

//! tetherd core
//!
//! Message gateway and control plane for a single long-running agent:
//! health-gated intake, serialized delivery, liveness probing with recovery,
//! and sync checkpoints, all backed by one SQLite store.

pub mod config;
pub mod core;
pub mod db;
pub mod error;
pub mod liveness;
pub mod notify;
pub mod session;
pub mod types;

pub use config::{GatewayConfig, IdleThresholds};
pub use crate::core::{
    AckResult, CheckpointManager, ControlPlane, CreateTaskRequest, Dispatcher, EnqueueRequest,
    Gateway, HeartbeatEngine, HeartbeatStatus, IntakeGate, Reaper, ReceiveOutcome, ReceiveRequest,
    Scheduler, SchedulerReport, SyncBoundary, TickOutcome,
};
pub use db::{AckOutcome, GatewayDB};
pub use error::{ErrorCode, GatewayError, Result};
pub use liveness::{
    AgentState, HealthState, LivenessFile, LivenessStatus, PendingChannel, PendingChannels,
};
pub use notify::{ChannelNotifier, CommandNotifier};
pub use session::{SessionHost, TmuxSession};
pub use types::*;

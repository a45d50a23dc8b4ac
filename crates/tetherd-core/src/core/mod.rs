//! Core module for tetherd
//!
//! - IntakeGate: admission control and payload spill
//! - Dispatcher: serialized delivery into the hosted session
//! - ControlPlane: out-of-band queue with ack deadlines
//! - HeartbeatEngine: liveness probing and recovery
//! - CheckpointManager: summarization boundaries and retention
//! - Scheduler / Reaper: time-based tasks and stale-run cleanup
//! - Gateway: owns all of the above

mod checkpoint;
mod control;
mod dispatcher;
mod heartbeat;
mod intake;
mod reaper;
mod scheduler;

pub use checkpoint::{CheckpointManager, SyncBoundary};
pub use control::{AckResult, ControlPlane, EnqueueRequest, CONTROL_ID_PLACEHOLDER};
pub use dispatcher::{Dispatcher, TickOutcome};
pub use heartbeat::{HeartbeatEngine, HeartbeatStatus, RECOVERY_NOTICE};
pub use intake::{IntakeGate, ReceiveOutcome, ReceiveRequest};
pub use reaper::Reaper;
pub use scheduler::{
    next_fire_after, parse_cron, CreateTaskRequest, Scheduler, SchedulerReport, SCHEDULER_CHANNEL,
};

use std::sync::Arc;

use tracing::info;

use crate::config::GatewayConfig;
use crate::db::GatewayDB;
use crate::error::Result;
use crate::notify::ChannelNotifier;
use crate::session::SessionHost;

/// Main coordinator wiring every component to one store
pub struct Gateway {
    db: Arc<GatewayDB>,
    config: Arc<GatewayConfig>,
    intake: Arc<IntakeGate>,
    dispatcher: Dispatcher,
    control: ControlPlane,
    heartbeat: HeartbeatEngine,
    checkpoints: CheckpointManager,
    scheduler: Scheduler,
    reaper: Reaper,
}

impl Gateway {
    /// Open the store under the configured home and build every component
    pub fn open(
        config: GatewayConfig,
        session: Arc<dyn SessionHost>,
        notifier: Arc<dyn ChannelNotifier>,
    ) -> Result<Self> {
        std::fs::create_dir_all(&config.home)?;
        if let Some(parent) = config.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Arc::new(GatewayDB::open(&config.db_path)?);
        info!(db = %config.db_path.display(), "Gateway store opened");
        Ok(Self::with_db(db, Arc::new(config), session, notifier))
    }

    pub fn with_db(
        db: Arc<GatewayDB>,
        config: Arc<GatewayConfig>,
        session: Arc<dyn SessionHost>,
        notifier: Arc<dyn ChannelNotifier>,
    ) -> Self {
        let intake = Arc::new(IntakeGate::new(db.clone(), config.clone()));
        Self {
            dispatcher: Dispatcher::new(db.clone(), config.clone(), session.clone()),
            control: ControlPlane::new(db.clone()),
            heartbeat: HeartbeatEngine::new(db.clone(), config.clone(), session, notifier),
            checkpoints: CheckpointManager::new(db.clone()),
            scheduler: Scheduler::new(db.clone(), intake.clone()),
            reaper: Reaper::new(db.clone(), config.message_stale_secs),
            intake,
            db,
            config,
        }
    }

    pub fn db(&self) -> &Arc<GatewayDB> {
        &self.db
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn intake(&self) -> &IntakeGate {
        &self.intake
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn control(&self) -> &ControlPlane {
        &self.control
    }

    pub fn heartbeat(&self) -> &HeartbeatEngine {
        &self.heartbeat
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn reaper(&self) -> &Reaper {
        &self.reaper
    }
}

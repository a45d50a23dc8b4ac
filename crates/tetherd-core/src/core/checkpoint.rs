//! Checkpoint manager
//!
//! An external summarizer declares "conversations up to id N are durably
//! summarized". Checkpoints partition the id space without gaps or overlap.

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::db::GatewayDB;
use crate::error::{GatewayError, Result};
use crate::types::{now_ms, Checkpoint};

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// Where summarization stands
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncBoundary {
    /// Messages with id greater than this are not yet summarized
    pub summarized_through: i64,
    pub latest_message_id: i64,
}

pub struct CheckpointManager {
    db: Arc<GatewayDB>,
}

impl CheckpointManager {
    pub fn new(db: Arc<GatewayDB>) -> Self {
        Self { db }
    }

    /// Record that everything up to `end_id` is summarized
    pub fn create(&self, end_id: i64, summary: Option<&str>) -> Result<Checkpoint> {
        match self.db.create_checkpoint(end_id, summary, now_ms())? {
            Some(checkpoint) => {
                info!(
                    id = checkpoint.id,
                    start = checkpoint.start_conversation_id,
                    end = checkpoint.end_conversation_id,
                    "Checkpoint created"
                );
                Ok(checkpoint)
            }
            None => {
                let start = self.unsummarized_after()? + 1;
                Err(GatewayError::InvalidArgs(format!(
                    "endId {} is before the next checkpoint start {}",
                    end_id, start
                )))
            }
        }
    }

    pub fn latest(&self) -> Result<Option<Checkpoint>> {
        Ok(self.db.latest_checkpoint()?)
    }

    /// Newest first
    pub fn list(&self, limit: Option<i64>) -> Result<Vec<Checkpoint>> {
        Ok(self.db.list_checkpoints(limit.unwrap_or(20).max(1))?)
    }

    /// Highest summarized id (0 before the first checkpoint)
    pub fn unsummarized_after(&self) -> Result<i64> {
        Ok(self
            .latest()?
            .map(|c| c.end_conversation_id)
            .unwrap_or(0))
    }

    pub fn boundary(&self) -> Result<SyncBoundary> {
        Ok(SyncBoundary {
            summarized_through: self.unsummarized_after()?,
            latest_message_id: self.db.max_message_id()?,
        })
    }

    /// Delete `done` messages older than the retention window, but only those
    /// already covered by a checkpoint. Returns the number removed.
    pub fn prune_retention(&self, retention_days: u64, now: i64) -> Result<usize> {
        if retention_days == 0 {
            return Ok(0);
        }
        let through = self.unsummarized_after()?;
        if through == 0 {
            return Ok(0);
        }
        let days = i64::try_from(retention_days).unwrap_or(i64::MAX);
        let before = now.saturating_sub(days.saturating_mul(DAY_MS));
        let removed = self.db.prune_done_messages(before, through)?;
        if removed > 0 {
            info!(removed, through, "Pruned summarized messages");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Direction, MessageStatus, NewMessage, Priority};

    fn manager() -> (CheckpointManager, Arc<GatewayDB>) {
        let db = Arc::new(GatewayDB::in_memory().unwrap());
        (CheckpointManager::new(db.clone()), db)
    }

    fn done_message(db: &GatewayDB, at: i64) -> i64 {
        db.insert_message(
            &NewMessage {
                direction: Direction::Out,
                channel: "cli".to_string(),
                endpoint: None,
                content: "x".to_string(),
                content_preview: None,
                attachment_path: None,
                priority: Priority::Normal,
                status: MessageStatus::Done,
                require_idle: false,
                task_id: None,
                available_at: at,
            },
            at,
        )
        .unwrap()
    }

    #[test]
    fn test_checkpoints_partition_ids() {
        let (mgr, _db) = manager();
        let ends = [5, 12, 13, 40];
        let mut expected_start = 1;
        for end in ends {
            let cp = mgr.create(end, None).unwrap();
            assert_eq!(cp.start_conversation_id, expected_start);
            assert_eq!(cp.end_conversation_id, end);
            expected_start = end + 1;
        }

        let listed = mgr.list(None).unwrap();
        assert_eq!(listed.len(), 4);
        assert!(listed.windows(2).all(|w| w[0].id > w[1].id));
        let mut ascending = listed.clone();
        ascending.reverse();
        for pair in ascending.windows(2) {
            assert_eq!(pair[1].start_conversation_id, pair[0].end_conversation_id + 1);
        }
        assert_eq!(mgr.unsummarized_after().unwrap(), 40);
    }

    #[test]
    fn test_end_before_start_is_invalid() {
        let (mgr, _db) = manager();
        assert!(matches!(mgr.create(0, None), Err(GatewayError::InvalidArgs(_))));
        mgr.create(10, Some("first ten")).unwrap();
        assert!(matches!(mgr.create(10, None), Err(GatewayError::InvalidArgs(_))));
        assert!(matches!(mgr.create(3, None), Err(GatewayError::InvalidArgs(_))));
        assert_eq!(
            mgr.latest().unwrap().unwrap().summary.as_deref(),
            Some("first ten")
        );
    }

    #[test]
    fn test_retention_only_prunes_checkpointed() {
        let (mgr, db) = manager();
        let old_a = done_message(&db, 0);
        let old_b = done_message(&db, 0);
        let recent = done_message(&db, 40 * DAY_MS);
        let now = 45 * DAY_MS;

        // Nothing summarized yet: nothing pruned.
        assert_eq!(mgr.prune_retention(30, now).unwrap(), 0);

        mgr.create(old_a, None).unwrap();
        assert_eq!(mgr.prune_retention(30, now).unwrap(), 1);
        assert!(db.get_message(old_a).unwrap().is_none());
        assert!(db.get_message(old_b).unwrap().is_some());

        mgr.create(recent, None).unwrap();
        assert_eq!(mgr.prune_retention(30, now).unwrap(), 1);
        assert!(db.get_message(recent).unwrap().is_some());
        assert_eq!(mgr.prune_retention(0, now).unwrap(), 0);

        let boundary = mgr.boundary().unwrap();
        assert_eq!(boundary.summarized_through, recent);
        assert_eq!(boundary.latest_message_id, recent);
    }
}

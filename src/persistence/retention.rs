//! Retention service for time-based data purge.
//!
//! Runs as a background task pruning checkpoints and signal snapshots older
//! than `retention_days`. The latest checkpoint of every session survives so
//! that it remains resumable, and so does the latest snapshot so that
//! snapshot numbering never restarts.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::checkpoint_repo::SqliteCheckpointRepo;
use super::db::Database;
use super::signal_repo::SignalHistoryRepo;
use crate::Result;

const PURGE_INTERVAL: Duration = Duration::from_secs(3600);

/// Rows removed by one purge pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeSummary {
    /// Checkpoints deleted.
    pub checkpoints: u64,
    /// Signal snapshots deleted.
    pub snapshots: u64,
}

/// Spawn the retention purge background task.
///
/// The task runs hourly until `cancel` fires.
#[must_use]
pub fn spawn_retention_task(
    db: Arc<Database>,
    retention_days: u32,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PURGE_INTERVAL);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("retention task shutting down");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(err) = purge(&db, retention_days).await {
                        error!(%err, "retention purge failed");
                    }
                }
            }
        }
    })
}

/// Run one purge pass.
///
/// # Errors
///
/// Returns `AppError::Db` if either delete fails.
pub async fn purge(db: &Arc<Database>, retention_days: u32) -> Result<PurgeSummary> {
    let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));

    let checkpoints = SqliteCheckpointRepo::new(Arc::clone(db))
        .prune_older_than(cutoff)
        .await?;
    let snapshots = SignalHistoryRepo::new(Arc::clone(db))
        .delete_older_than(cutoff)
        .await?;

    info!(retention_days, checkpoints, snapshots, "retention purge completed");
    Ok(PurgeSummary {
        checkpoints,
        snapshots,
    })
}

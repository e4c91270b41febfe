//! Checkpoint repository for `SQLite` persistence.
//!
//! Checkpoints are insert-only. The repository, not the caller, owns the
//! per-session `checkpoint_number` sequence: [`CheckpointRepository::save`]
//! computes and inserts the next number in one statement, and the
//! `UNIQUE (session_id, checkpoint_number)` constraint rejects anything
//! that slips past.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::models::checkpoint::{Checkpoint, CheckpointStats, CheckpointTrigger, NewCheckpoint};
use crate::{AppError, Result};

use super::db::Database;
use super::{parse_timestamp, schema, timestamp};

/// Boxed future returned by repository operations.
pub type RepoFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Persistence boundary consumed by the checkpoint manager and resume detector.
pub trait CheckpointRepository: Send + Sync {
    /// Prepare storage (idempotent).
    fn initialize(&self) -> RepoFuture<'_, ()>;

    /// Persist `checkpoint`, assigning the next number for its session.
    fn save<'a>(&'a self, checkpoint: &'a NewCheckpoint) -> RepoFuture<'a, Checkpoint>;

    /// Latest checkpoint for `session_id`, if any.
    fn get_most_recent<'a>(&'a self, session_id: &'a str) -> RepoFuture<'a, Option<Checkpoint>>;

    /// Number the next saved checkpoint of `session_id` would receive.
    fn get_next_checkpoint_number<'a>(&'a self, session_id: &'a str) -> RepoFuture<'a, u32>;

    /// All checkpoints of `session_id`, newest first.
    fn list_for_session<'a>(&'a self, session_id: &'a str) -> RepoFuture<'a, Vec<Checkpoint>>;

    /// Aggregate counts for `session_id`.
    fn stats<'a>(&'a self, session_id: &'a str) -> RepoFuture<'a, CheckpointStats>;

    /// Release storage resources.
    fn close(&self) -> RepoFuture<'_, ()>;
}

/// [`CheckpointRepository`] on `SQLite`.
#[derive(Clone)]
pub struct SqliteCheckpointRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct CheckpointRow {
    id: String,
    session_id: String,
    checkpoint_number: i64,
    trigger_kind: String,
    task_state: String,
    signals: String,
    user_preferences: String,
    created_at: String,
}

impl CheckpointRow {
    /// Convert a database row into the domain model.
    fn into_checkpoint(self) -> Result<Checkpoint> {
        let checkpoint_number = u32::try_from(self.checkpoint_number)
            .map_err(|e| AppError::Db(format!("invalid checkpoint_number: {e}")))?;
        let task_state = serde_json::from_str(&self.task_state)
            .map_err(|e| AppError::Db(format!("invalid task_state: {e}")))?;
        let signals = serde_json::from_str(&self.signals)
            .map_err(|e| AppError::Db(format!("invalid signals: {e}")))?;
        let user_preferences = serde_json::from_str(&self.user_preferences)
            .map_err(|e| AppError::Db(format!("invalid user_preferences: {e}")))?;

        Ok(Checkpoint {
            id: self.id,
            session_id: self.session_id,
            checkpoint_number,
            trigger: self.trigger_kind.parse()?,
            task_state,
            signals,
            user_preferences,
            created_at: parse_timestamp("created_at", &self.created_at)?,
        })
    }
}

const SELECT_COLUMNS: &str = "SELECT id, session_id, checkpoint_number, trigger_kind, task_state, \
     signals, user_preferences, created_at FROM checkpoint";

impl SqliteCheckpointRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    async fn save_inner(&self, checkpoint: &NewCheckpoint) -> Result<Checkpoint> {
        let id = Uuid::new_v4().to_string();
        let task_state = serde_json::to_string(&checkpoint.task_state)?;
        let signals = serde_json::to_string(&checkpoint.signals)?;
        let user_preferences = serde_json::to_string(&checkpoint.user_preferences)?;
        let created_at = timestamp(checkpoint.created_at);

        let number: i64 = sqlx::query_scalar(
            "INSERT INTO checkpoint (id, session_id, checkpoint_number, trigger_kind, task_state,
             signals, user_preferences, created_at)
             SELECT ?1, ?2, COALESCE(MAX(checkpoint_number), 0) + 1, ?3, ?4, ?5, ?6, ?7
             FROM checkpoint WHERE session_id = ?2
             RETURNING checkpoint_number",
        )
        .bind(&id)
        .bind(&checkpoint.session_id)
        .bind(checkpoint.trigger.as_str())
        .bind(&task_state)
        .bind(&signals)
        .bind(&user_preferences)
        .bind(&created_at)
        .fetch_one(self.db.as_ref())
        .await?;

        let checkpoint_number = u32::try_from(number)
            .map_err(|e| AppError::Db(format!("invalid checkpoint_number: {e}")))?;
        debug!(session_id = %checkpoint.session_id, checkpoint_number, "checkpoint row inserted");

        Ok(Checkpoint {
            id,
            session_id: checkpoint.session_id.clone(),
            checkpoint_number,
            trigger: checkpoint.trigger,
            task_state: checkpoint.task_state.clone(),
            signals: checkpoint.signals.clone(),
            user_preferences: checkpoint.user_preferences.clone(),
            created_at: checkpoint.created_at,
        })
    }

    async fn get_most_recent_inner(&self, session_id: &str) -> Result<Option<Checkpoint>> {
        let row: Option<CheckpointRow> = sqlx::query_as(&format!(
            "{SELECT_COLUMNS} WHERE session_id = ?1 ORDER BY checkpoint_number DESC LIMIT 1"
        ))
        .bind(session_id)
        .fetch_optional(self.db.as_ref())
        .await?;

        row.map(CheckpointRow::into_checkpoint).transpose()
    }

    async fn next_number_inner(&self, session_id: &str) -> Result<u32> {
        let next: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(checkpoint_number), 0) + 1 FROM checkpoint WHERE session_id = ?1",
        )
        .bind(session_id)
        .fetch_one(self.db.as_ref())
        .await?;

        u32::try_from(next).map_err(|e| AppError::Db(format!("invalid checkpoint_number: {e}")))
    }

    async fn list_inner(&self, session_id: &str) -> Result<Vec<Checkpoint>> {
        let rows: Vec<CheckpointRow> = sqlx::query_as(&format!(
            "{SELECT_COLUMNS} WHERE session_id = ?1 ORDER BY checkpoint_number DESC"
        ))
        .bind(session_id)
        .fetch_all(self.db.as_ref())
        .await?;

        rows.into_iter().map(CheckpointRow::into_checkpoint).collect()
    }

    async fn stats_inner(&self, session_id: &str) -> Result<CheckpointStats> {
        let (total, latest_number, first_at, latest_at): (
            i64,
            Option<i64>,
            Option<String>,
            Option<String>,
        ) = sqlx::query_as(
            "SELECT COUNT(*), MAX(checkpoint_number), MIN(created_at), MAX(created_at)
             FROM checkpoint WHERE session_id = ?1",
        )
        .bind(session_id)
        .fetch_one(self.db.as_ref())
        .await?;

        let per_trigger: Vec<(String, i64)> = sqlx::query_as(
            "SELECT trigger_kind, COUNT(*) FROM checkpoint WHERE session_id = ?1 GROUP BY trigger_kind",
        )
        .bind(session_id)
        .fetch_all(self.db.as_ref())
        .await?;

        let mut by_trigger = BTreeMap::new();
        for (kind, count) in per_trigger {
            let trigger: CheckpointTrigger = kind.parse()?;
            by_trigger.insert(trigger, to_u32("count", count)?);
        }

        Ok(CheckpointStats {
            session_id: session_id.to_owned(),
            total: to_u32("total", total)?,
            latest_number: latest_number.map(|n| to_u32("latest_number", n)).transpose()?,
            first_at: first_at
                .as_deref()
                .map(|raw| parse_timestamp("first_at", raw))
                .transpose()?,
            latest_at: latest_at
                .as_deref()
                .map(|raw| parse_timestamp("latest_at", raw))
                .transpose()?,
            by_trigger,
        })
    }

    /// Delete checkpoints created before `cutoff`, always keeping the latest
    /// checkpoint of each session so it stays resumable.
    ///
    /// Returns the number of rows deleted.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM checkpoint
             WHERE created_at < ?1
               AND checkpoint_number < (
                   SELECT MAX(latest.checkpoint_number) FROM checkpoint AS latest
                   WHERE latest.session_id = checkpoint.session_id)",
        )
        .bind(timestamp(cutoff))
        .execute(self.db.as_ref())
        .await?;
        Ok(result.rows_affected())
    }
}

fn to_u32(column: &str, value: i64) -> Result<u32> {
    u32::try_from(value).map_err(|e| AppError::Db(format!("invalid {column}: {e}")))
}

impl CheckpointRepository for SqliteCheckpointRepo {
    fn initialize(&self) -> RepoFuture<'_, ()> {
        Box::pin(async move { schema::bootstrap_schema(self.db.as_ref()).await })
    }

    fn save<'a>(&'a self, checkpoint: &'a NewCheckpoint) -> RepoFuture<'a, Checkpoint> {
        Box::pin(self.save_inner(checkpoint))
    }

    fn get_most_recent<'a>(&'a self, session_id: &'a str) -> RepoFuture<'a, Option<Checkpoint>> {
        Box::pin(self.get_most_recent_inner(session_id))
    }

    fn get_next_checkpoint_number<'a>(&'a self, session_id: &'a str) -> RepoFuture<'a, u32> {
        Box::pin(self.next_number_inner(session_id))
    }

    fn list_for_session<'a>(&'a self, session_id: &'a str) -> RepoFuture<'a, Vec<Checkpoint>> {
        Box::pin(self.list_inner(session_id))
    }

    fn stats<'a>(&'a self, session_id: &'a str) -> RepoFuture<'a, CheckpointStats> {
        Box::pin(self.stats_inner(session_id))
    }

    fn close(&self) -> RepoFuture<'_, ()> {
        Box::pin(async move {
            self.db.close().await;
            Ok(())
        })
    }
}

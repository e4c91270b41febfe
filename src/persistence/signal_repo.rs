//! Signal history repository for `SQLite` persistence.
//!
//! Append-only record of [`CrashSignals`] snapshots. Snapshot numbers are
//! 1-based and per-session monotonic, assigned inside the insert statement.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use tracing::info;
use uuid::Uuid;

use crate::models::signals::{CrashRisk, CrashSignals};
use crate::{AppError, Result};

use super::db::Database;
use super::{parse_timestamp, timestamp};

/// A stored signal snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignalSnapshot {
    /// Unique record identifier.
    pub id: String,
    /// Owning session.
    pub session_id: String,
    /// 1-based position within the session.
    pub snapshot_number: u32,
    /// The recorded signals.
    pub signals: CrashSignals,
    /// Insert timestamp.
    pub created_at: DateTime<Utc>,
}

/// Repository for signal snapshots.
#[derive(Clone)]
pub struct SignalHistoryRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct SnapshotRow {
    id: String,
    session_id: String,
    snapshot_number: i64,
    signals: String,
    created_at: String,
}

impl SnapshotRow {
    fn into_snapshot(self) -> Result<SignalSnapshot> {
        let snapshot_number = u32::try_from(self.snapshot_number)
            .map_err(|e| AppError::Db(format!("invalid snapshot_number: {e}")))?;
        let signals = serde_json::from_str(&self.signals)
            .map_err(|e| AppError::Db(format!("invalid signals: {e}")))?;

        Ok(SignalSnapshot {
            id: self.id,
            session_id: self.session_id,
            snapshot_number,
            signals,
            created_at: parse_timestamp("created_at", &self.created_at)?,
        })
    }
}

const SELECT_COLUMNS: &str =
    "SELECT id, session_id, snapshot_number, signals, created_at FROM signal_snapshot";

async fn insert_snapshot(
    conn: &mut SqliteConnection,
    session_id: &str,
    signals: &CrashSignals,
) -> Result<SignalSnapshot> {
    let id = Uuid::new_v4().to_string();
    let created_at = Utc::now();
    let payload = serde_json::to_string(signals)?;

    let number: i64 = sqlx::query_scalar(
        "INSERT INTO signal_snapshot (id, session_id, snapshot_number, crash_risk, signals, created_at)
         SELECT ?1, ?2, COALESCE(MAX(snapshot_number), 0) + 1, ?3, ?4, ?5
         FROM signal_snapshot WHERE session_id = ?2
         RETURNING snapshot_number",
    )
    .bind(&id)
    .bind(session_id)
    .bind(signals.crash_risk.as_str())
    .bind(&payload)
    .bind(timestamp(created_at))
    .fetch_one(&mut *conn)
    .await?;

    Ok(SignalSnapshot {
        id,
        session_id: session_id.to_owned(),
        snapshot_number: u32::try_from(number)
            .map_err(|e| AppError::Db(format!("invalid snapshot_number: {e}")))?,
        signals: signals.clone(),
        created_at,
    })
}

impl SignalHistoryRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Append one snapshot for `session_id`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert fails.
    pub async fn save_snapshot(
        &self,
        session_id: &str,
        signals: &CrashSignals,
    ) -> Result<SignalSnapshot> {
        let mut conn = self.db.acquire().await?;
        insert_snapshot(&mut conn, session_id, signals).await
    }

    /// Append several snapshots for `session_id` in one transaction.
    ///
    /// Either every snapshot is stored, numbered consecutively, or none is.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if any insert or the commit fails.
    pub async fn save_batch(
        &self,
        session_id: &str,
        batch: &[CrashSignals],
    ) -> Result<Vec<SignalSnapshot>> {
        let mut tx = self.db.begin().await?;
        let mut saved = Vec::with_capacity(batch.len());
        for signals in batch {
            saved.push(insert_snapshot(&mut tx, session_id, signals).await?);
        }
        tx.commit().await?;

        info!(session_id, count = saved.len(), "signal snapshot batch saved");
        Ok(saved)
    }

    /// All snapshots of `session_id`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get_session_snapshots(&self, session_id: &str) -> Result<Vec<SignalSnapshot>> {
        let rows: Vec<SnapshotRow> = sqlx::query_as(&format!(
            "{SELECT_COLUMNS} WHERE session_id = ?1 ORDER BY snapshot_number ASC"
        ))
        .bind(session_id)
        .fetch_all(self.db.as_ref())
        .await?;

        rows.into_iter().map(SnapshotRow::into_snapshot).collect()
    }

    /// Most recent snapshot of `session_id`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get_latest_snapshot(&self, session_id: &str) -> Result<Option<SignalSnapshot>> {
        let row: Option<SnapshotRow> = sqlx::query_as(&format!(
            "{SELECT_COLUMNS} WHERE session_id = ?1 ORDER BY snapshot_number DESC LIMIT 1"
        ))
        .bind(session_id)
        .fetch_optional(self.db.as_ref())
        .await?;

        row.map(SnapshotRow::into_snapshot).transpose()
    }

    /// Snapshots across all sessions classified as `risk`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get_snapshots_by_risk(&self, risk: CrashRisk) -> Result<Vec<SignalSnapshot>> {
        let rows: Vec<SnapshotRow> = sqlx::query_as(&format!(
            "{SELECT_COLUMNS} WHERE crash_risk = ?1 ORDER BY created_at ASC, snapshot_number ASC"
        ))
        .bind(risk.as_str())
        .fetch_all(self.db.as_ref())
        .await?;

        rows.into_iter().map(SnapshotRow::into_snapshot).collect()
    }

    /// Snapshots created within `[start, end]`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get_snapshots_in_time_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<SignalSnapshot>> {
        let rows: Vec<SnapshotRow> = sqlx::query_as(&format!(
            "{SELECT_COLUMNS} WHERE created_at >= ?1 AND created_at <= ?2 \
             ORDER BY created_at ASC, snapshot_number ASC"
        ))
        .bind(timestamp(start))
        .bind(timestamp(end))
        .fetch_all(self.db.as_ref())
        .await?;

        rows.into_iter().map(SnapshotRow::into_snapshot).collect()
    }

    /// Delete snapshots older than `retention_days`, keeping the latest
    /// snapshot of every session. Returns the number deleted.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn cleanup_old_snapshots(&self, retention_days: u32) -> Result<u64> {
        let cutoff = Utc::now() - Duration::days(i64::from(retention_days));
        self.delete_older_than(cutoff).await
    }

    /// Delete snapshots created before `cutoff`. Returns the number deleted.
    ///
    /// The latest snapshot of each session always survives; it anchors the
    /// session's numbering so later snapshots keep counting upward.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM signal_snapshot
             WHERE created_at < ?1
               AND snapshot_number < (
                   SELECT MAX(latest.snapshot_number) FROM signal_snapshot AS latest
                   WHERE latest.session_id = signal_snapshot.session_id)",
        )
        .bind(timestamp(cutoff))
        .execute(self.db.as_ref())
        .await?;
        Ok(result.rows_affected())
    }

    /// Delete every snapshot of `session_id`. Returns the number deleted.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn delete_session_snapshots(&self, session_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM signal_snapshot WHERE session_id = ?1")
            .bind(session_id)
            .execute(self.db.as_ref())
            .await?;
        Ok(result.rows_affected())
    }
}

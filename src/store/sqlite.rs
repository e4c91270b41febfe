//! Cross-process shared store on a `SQLite` file.
//!
//! Independent processes open the same database file. Every conditional
//! primitive is a single SQL statement, so `SQLite`'s write serialization
//! provides the atomicity: of N racing `set_if_absent` calls on one key,
//! exactly one changes a row.
//!
//! Expiry is stored as epoch milliseconds and enforced in each statement's
//! predicate; rows past their expiry are physically removed when touched.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::SqlitePool;

use super::{SharedStore, StoreFuture};
use crate::Result;

/// [`SharedStore`] backed by a shared `SQLite` database.
#[derive(Clone)]
pub struct SqliteStore {
    db: Arc<SqlitePool>,
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn expiry_millis(now: i64, ttl: Duration) -> i64 {
    now.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
}

impl SqliteStore {
    /// Wrap an open pool and create the key-value table if missing.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the DDL fails.
    pub async fn open(db: Arc<SqlitePool>) -> Result<Self> {
        sqlx::raw_sql(
            r"
CREATE TABLE IF NOT EXISTS kv_entry (
    key         TEXT PRIMARY KEY NOT NULL,
    value       TEXT NOT NULL,
    expires_at  INTEGER
);
CREATE INDEX IF NOT EXISTS idx_kv_entry_expires ON kv_entry(expires_at);
",
        )
        .execute(db.as_ref())
        .await?;
        Ok(Self { db })
    }

    /// Physically delete every expired row. Returns the number removed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` or `AppError::Unavailable` on failure.
    pub async fn purge_expired(&self) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM kv_entry WHERE expires_at IS NOT NULL AND expires_at <= ?1")
                .bind(now_millis())
                .execute(self.db.as_ref())
                .await?;
        Ok(result.rows_affected())
    }
}

impl SharedStore for SqliteStore {
    fn set_if_absent<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Duration,
    ) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let now = now_millis();
            let result = sqlx::query(
                "INSERT INTO kv_entry (key, value, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at
                 WHERE kv_entry.expires_at IS NOT NULL AND kv_entry.expires_at <= ?4",
            )
            .bind(key)
            .bind(value)
            .bind(expiry_millis(now, ttl))
            .bind(now)
            .execute(self.db.as_ref())
            .await?;
            Ok(result.rows_affected() == 1)
        })
    }

    fn compare_and_delete<'a>(&'a self, key: &'a str, expected: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let result = sqlx::query(
                "DELETE FROM kv_entry
                 WHERE key = ?1 AND value = ?2 AND (expires_at IS NULL OR expires_at > ?3)",
            )
            .bind(key)
            .bind(expected)
            .bind(now_millis())
            .execute(self.db.as_ref())
            .await?;
            Ok(result.rows_affected() == 1)
        })
    }

    fn compare_and_expire<'a>(
        &'a self,
        key: &'a str,
        expected: &'a str,
        ttl: Duration,
    ) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let now = now_millis();
            let result = sqlx::query(
                "UPDATE kv_entry SET expires_at = ?1
                 WHERE key = ?2 AND value = ?3 AND (expires_at IS NULL OR expires_at > ?4)",
            )
            .bind(expiry_millis(now, ttl))
            .bind(key)
            .bind(expected)
            .bind(now)
            .execute(self.db.as_ref())
            .await?;
            Ok(result.rows_affected() == 1)
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>> {
        Box::pin(async move {
            let value: Option<String> = sqlx::query_scalar(
                "SELECT value FROM kv_entry
                 WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
            )
            .bind(key)
            .bind(now_millis())
            .fetch_optional(self.db.as_ref())
            .await?;
            Ok(value)
        })
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Option<Duration>,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let expires_at = ttl.map(|ttl| expiry_millis(now_millis(), ttl));
            sqlx::query(
                "INSERT INTO kv_entry (key, value, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
            )
            .bind(key)
            .bind(value)
            .bind(expires_at)
            .execute(self.db.as_ref())
            .await?;
            Ok(())
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let now = now_millis();
            let live: Option<i64> = sqlx::query_scalar(
                "DELETE FROM kv_entry WHERE key = ?1
                 RETURNING CASE WHEN expires_at IS NULL OR expires_at > ?2 THEN 1 ELSE 0 END",
            )
            .bind(key)
            .bind(now)
            .fetch_optional(self.db.as_ref())
            .await?;
            Ok(live == Some(1))
        })
    }

    fn keys_with_prefix<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, Vec<String>> {
        Box::pin(async move {
            let keys: Vec<String> = sqlx::query_scalar(
                "SELECT key FROM kv_entry
                 WHERE substr(key, 1, length(?1)) = ?1 AND (expires_at IS NULL OR expires_at > ?2)
                 ORDER BY key",
            )
            .bind(prefix)
            .bind(now_millis())
            .fetch_all(self.db.as_ref())
            .await?;
            Ok(keys)
        })
    }
}

//! `SQLite` schema bootstrap logic.
//!
//! All table definitions use `CREATE TABLE IF NOT EXISTS`, so they are safe to
//! re-run on every startup.

use sqlx::SqlitePool;

use crate::Result;

/// Apply the checkpoint and signal history tables.
///
/// The `UNIQUE (session_id, <number>)` constraints back the per-session
/// sequence invariants: a racing insert that computed a stale number fails
/// instead of duplicating.
///
/// # Errors
///
/// Returns `AppError::Db` if any DDL statement fails.
pub async fn bootstrap_schema(pool: &SqlitePool) -> Result<()> {
    let ddl = r"
CREATE TABLE IF NOT EXISTS checkpoint (
    id                TEXT PRIMARY KEY NOT NULL,
    session_id        TEXT NOT NULL,
    checkpoint_number INTEGER NOT NULL,
    trigger_kind      TEXT NOT NULL CHECK(trigger_kind IN ('tool_call_interval','time_interval','danger_zone','warning_zone','manual')),
    task_state        TEXT NOT NULL,
    signals           TEXT NOT NULL,
    user_preferences  TEXT NOT NULL,
    created_at        TEXT NOT NULL,
    UNIQUE (session_id, checkpoint_number)
);

CREATE TABLE IF NOT EXISTS signal_snapshot (
    id              TEXT PRIMARY KEY NOT NULL,
    session_id      TEXT NOT NULL,
    snapshot_number INTEGER NOT NULL,
    crash_risk      TEXT NOT NULL CHECK(crash_risk IN ('safe','warning','danger')),
    signals         TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    UNIQUE (session_id, snapshot_number)
);

CREATE INDEX IF NOT EXISTS idx_checkpoint_created ON checkpoint(created_at);
CREATE INDEX IF NOT EXISTS idx_snapshot_risk ON signal_snapshot(crash_risk);
CREATE INDEX IF NOT EXISTS idx_snapshot_created ON signal_snapshot(created_at);
";

    sqlx::raw_sql(ddl).execute(pool).await?;
    Ok(())
}

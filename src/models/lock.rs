//! Distributed lock record.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// A lock this process acquired and has not yet released.
///
/// The shared store only holds `resource -> owner_token` with a TTL; the
/// remaining fields are the acquiring process's own bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lock {
    /// Protected resource name.
    pub resource: String,
    /// Opaque ownership proof.
    pub owner_token: String,
    /// When the lock was acquired (or last extended).
    pub acquired_at: DateTime<Utc>,
    /// Expiry applied at acquisition or the last extension.
    pub ttl: Duration,
}

//! Crash events, recovery lifecycle events, and persisted restart state.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A crash observed by the supervision layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CrashEvent {
    /// Process id of the crashed session, when known.
    pub pid: Option<u32>,
    /// When the crash was observed.
    pub timestamp: DateTime<Utc>,
    /// Free-form attributes (worker id, chat id, detector).
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl CrashEvent {
    /// Crash event observed now with the given metadata.
    #[must_use]
    pub fn now(pid: Option<u32>, metadata: BTreeMap<String, String>) -> Self {
        Self {
            pid,
            timestamp: Utc::now(),
            metadata,
        }
    }
}

/// Lifecycle events emitted by the recovery logic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryEvent {
    /// A crash was handed to the recovery logic.
    CrashDetected {
        /// The crash being handled.
        event: CrashEvent,
    },
    /// A restart attempt is starting.
    RestartInitiated {
        /// 1-based attempt within the current restart window.
        attempt: u32,
        /// Chat the restart targets.
        chat_url: Option<String>,
    },
    /// The restart attempt succeeded.
    RestartCompleted {
        /// Attempt that succeeded.
        attempt: u32,
        /// Pid of the relaunched session, when known.
        pid: Option<u32>,
    },
    /// The restart attempt failed or was refused.
    RestartFailed {
        /// Attempt that failed (0 when refused before attempting).
        attempt: u32,
        /// Why it failed.
        reason: String,
    },
}

/// Minimal recovery state persisted to a JSON document between runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecoveryState {
    /// Chat the supervised session was working in.
    #[serde(default)]
    pub current_chat_url: Option<String>,
    /// Restarts within the current window.
    #[serde(default)]
    pub restart_count: u32,
    /// Start of the current restart window.
    #[serde(default)]
    pub window_started_at: Option<DateTime<Utc>>,
    /// Most recent restart attempt.
    #[serde(default)]
    pub last_restart_at: Option<DateTime<Utc>>,
    /// Restarts over the lifetime of the state file.
    #[serde(default)]
    pub total_restarts: u64,
}

//! Worker liveness record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Work status reported by the worker itself.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Waiting for work.
    Idle,
    /// Executing a task.
    Busy,
    /// Declared crashed by a supervisor.
    Crashed,
}

/// Liveness classification maintained by the registry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkerHealth {
    /// Heartbeats arriving within the timeout.
    Healthy,
    /// Heartbeat gap exceeded the timeout.
    Crashed,
}

/// Mutable registration fields supplied by the worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerInfo {
    /// Chat session the worker drives.
    pub chat_id: String,
    /// Initial status.
    pub status: WorkerStatus,
    /// Task in hand at registration, if any.
    pub current_task: Option<String>,
}

impl WorkerInfo {
    /// Idle worker for the given chat.
    #[must_use]
    pub fn idle(chat_id: impl Into<String>) -> Self {
        Self {
            chat_id: chat_id.into(),
            status: WorkerStatus::Idle,
            current_task: None,
        }
    }
}

/// One registered worker as stored in the shared store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Worker {
    /// Unique worker identifier.
    pub worker_id: String,
    /// Chat session the worker drives.
    pub chat_id: String,
    /// Reported work status.
    pub status: WorkerStatus,
    /// Registry-derived liveness.
    pub health: WorkerHealth,
    /// First registration time; preserved across re-registration.
    pub registered_at: DateTime<Utc>,
    /// Last heartbeat time.
    pub last_heartbeat: DateTime<Utc>,
    /// Task currently assigned.
    pub current_task: Option<String>,
}

impl Worker {
    /// Whether the heartbeat gap at `now` exceeds `timeout`.
    #[must_use]
    pub fn heartbeat_expired(&self, now: DateTime<Utc>, timeout: chrono::Duration) -> bool {
        now - self.last_heartbeat > timeout
    }
}

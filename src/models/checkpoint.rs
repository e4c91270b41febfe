//! Checkpoint model for resumable session snapshots.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::signals::CrashSignals;
use crate::AppError;

/// Condition that caused a checkpoint to be taken.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointTrigger {
    /// Enough tool calls accumulated since the previous checkpoint.
    ToolCallInterval,
    /// Enough wall-clock time elapsed since the previous checkpoint.
    TimeInterval,
    /// Risk classified as danger.
    DangerZone,
    /// Risk classified as warning.
    WarningZone,
    /// Explicit request.
    Manual,
}

impl CheckpointTrigger {
    /// Stable storage representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ToolCallInterval => "tool_call_interval",
            Self::TimeInterval => "time_interval",
            Self::DangerZone => "danger_zone",
            Self::WarningZone => "warning_zone",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for CheckpointTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckpointTrigger {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tool_call_interval" => Ok(Self::ToolCallInterval),
            "time_interval" => Ok(Self::TimeInterval),
            "danger_zone" => Ok(Self::DangerZone),
            "warning_zone" => Ok(Self::WarningZone),
            "manual" => Ok(Self::Manual),
            other => Err(AppError::Db(format!("invalid checkpoint trigger: {other}"))),
        }
    }
}

/// Progress of the operation a session is working through.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskProgress {
    /// Steps already finished.
    #[serde(default)]
    pub completed_steps: Vec<String>,
    /// Step in flight when the checkpoint was taken.
    #[serde(default)]
    pub current_step: Option<String>,
    /// Steps still to do.
    #[serde(default)]
    pub next_steps: Vec<String>,
    /// Rough completion estimate.
    #[serde(default)]
    pub percent_complete: Option<u8>,
}

/// Task state captured by a checkpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskState {
    /// Short description of the operation.
    pub operation: String,
    /// Progress through the operation.
    #[serde(default)]
    pub progress: TaskProgress,
    /// Free-form context notes for whoever resumes.
    #[serde(default)]
    pub context: Option<String>,
    /// Files the session was touching.
    #[serde(default)]
    pub active_files: Vec<String>,
}

/// A persisted, numbered snapshot of session state. Never mutated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    /// Repository-assigned record identifier.
    pub id: String,
    /// Owning session.
    pub session_id: String,
    /// 1-based, gap-free sequence number within the session.
    pub checkpoint_number: u32,
    /// Why this checkpoint was taken.
    pub trigger: CheckpointTrigger,
    /// Task state at checkpoint time.
    pub task_state: TaskState,
    /// Signal snapshot at checkpoint time.
    pub signals: CrashSignals,
    /// Opaque user preferences carried across resumes.
    pub user_preferences: serde_json::Value,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// Checkpoint content before the repository assigns id and number.
#[derive(Debug, Clone, PartialEq)]
pub struct NewCheckpoint {
    /// Owning session.
    pub session_id: String,
    /// Why this checkpoint is being taken.
    pub trigger: CheckpointTrigger,
    /// Task state to persist.
    pub task_state: TaskState,
    /// Signal snapshot to embed.
    pub signals: CrashSignals,
    /// Opaque user preferences.
    pub user_preferences: serde_json::Value,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// Aggregate view of a session's checkpoint history.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckpointStats {
    /// Session the stats describe.
    pub session_id: String,
    /// Number of stored checkpoints.
    pub total: u32,
    /// Highest checkpoint number, if any.
    pub latest_number: Option<u32>,
    /// Timestamp of the first stored checkpoint.
    pub first_at: Option<DateTime<Utc>>,
    /// Timestamp of the latest stored checkpoint.
    pub latest_at: Option<DateTime<Utc>>,
    /// Count per trigger.
    pub by_trigger: BTreeMap<CheckpointTrigger, u32>,
}

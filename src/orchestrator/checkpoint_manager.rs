//! Checkpoint trigger evaluation and creation.
//!
//! [`evaluate_trigger`] is the pure, order-sensitive decision: danger zone,
//! then warning zone, then the tool-call interval, then the time interval.
//! [`CheckpointManager`] feeds it the collector's current signals and the
//! time since its last checkpoint, and persists checkpoints through a
//! [`CheckpointRepository`], which owns checkpoint numbering.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::CheckpointConfig;
use crate::models::checkpoint::{
    Checkpoint, CheckpointStats, CheckpointTrigger, NewCheckpoint, TaskState,
};
use crate::models::signals::{CrashRisk, CrashSignals};
use crate::persistence::checkpoint_repo::CheckpointRepository;
use crate::persistence::signal_repo::SignalHistoryRepo;
use crate::Result;

use super::signal_collector::SignalCollector;

/// Result of [`CheckpointManager::should_trigger_checkpoint`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerDecision {
    /// Whether a checkpoint is due.
    pub should_trigger: bool,
    /// The first matching trigger, if any.
    pub reason: Option<CheckpointTrigger>,
    /// Risk zone at evaluation time.
    pub risk: CrashRisk,
}

/// Caller-supplied checkpoint content.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointInput {
    /// Owning session.
    pub session_id: String,
    /// Task state to persist.
    pub task_state: TaskState,
    /// Opaque preferences carried across resumes.
    pub user_preferences: serde_json::Value,
}

/// Result of [`CheckpointManager::auto_checkpoint`].
#[derive(Debug, Clone, PartialEq)]
pub struct AutoCheckpointOutcome {
    /// Whether a checkpoint was written.
    pub created: bool,
    /// The written checkpoint.
    pub checkpoint: Option<Checkpoint>,
    /// Trigger that fired.
    pub reason: Option<CheckpointTrigger>,
}

impl AutoCheckpointOutcome {
    fn skipped() -> Self {
        Self {
            created: false,
            checkpoint: None,
            reason: None,
        }
    }
}

/// First matching checkpoint trigger for `signals`, given the time elapsed
/// since the previous checkpoint.
#[must_use]
pub fn evaluate_trigger(
    signals: &CrashSignals,
    config: &CheckpointConfig,
    since_last_checkpoint: chrono::Duration,
) -> Option<CheckpointTrigger> {
    match signals.crash_risk {
        CrashRisk::Danger => return Some(CheckpointTrigger::DangerZone),
        CrashRisk::Warning => return Some(CheckpointTrigger::WarningZone),
        CrashRisk::Safe => {}
    }
    if signals.tool_calls_since_checkpoint >= config.tool_call_interval {
        return Some(CheckpointTrigger::ToolCallInterval);
    }
    if since_last_checkpoint >= config.time_interval() {
        return Some(CheckpointTrigger::TimeInterval);
    }
    None
}

/// Decides when to checkpoint and writes checkpoints.
pub struct CheckpointManager {
    config: CheckpointConfig,
    collector: Arc<SignalCollector>,
    repo: Arc<dyn CheckpointRepository>,
    history: Option<SignalHistoryRepo>,
    last_checkpoint_at: Mutex<DateTime<Utc>>,
}

impl CheckpointManager {
    /// Create a manager; the time interval counts from now.
    #[must_use]
    pub fn new(
        config: CheckpointConfig,
        collector: Arc<SignalCollector>,
        repo: Arc<dyn CheckpointRepository>,
    ) -> Self {
        Self {
            config,
            collector,
            repo,
            history: None,
            last_checkpoint_at: Mutex::new(Utc::now()),
        }
    }

    /// Also record each checkpoint's signals in the signal history.
    #[must_use]
    pub fn with_signal_history(mut self, history: SignalHistoryRepo) -> Self {
        self.history = Some(history);
        self
    }

    /// When the last checkpoint was written (or the manager created).
    #[must_use]
    pub fn last_checkpoint_at(&self) -> DateTime<Utc> {
        *self
            .last_checkpoint_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn mark_checkpointed(&self, at: DateTime<Utc>) {
        *self
            .last_checkpoint_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = at;
        self.collector.reset_checkpoint_counter();
    }

    /// Whether a checkpoint is due now.
    #[must_use]
    pub fn should_trigger_checkpoint(&self) -> TriggerDecision {
        self.should_trigger_checkpoint_at(Utc::now())
    }

    /// Whether a checkpoint is due at `now`.
    #[must_use]
    pub fn should_trigger_checkpoint_at(&self, now: DateTime<Utc>) -> TriggerDecision {
        let signals = self.collector.get_signals_at(now);
        let reason = evaluate_trigger(&signals, &self.config, now - self.last_checkpoint_at());
        TriggerDecision {
            should_trigger: reason.is_some(),
            reason,
            risk: signals.crash_risk,
        }
    }

    /// Write a checkpoint carrying the current signals.
    ///
    /// On success the tool-call counter and the time interval restart.
    ///
    /// # Errors
    ///
    /// Propagates repository failures; nothing is reset in that case.
    pub async fn create_checkpoint(
        &self,
        input: &CheckpointInput,
        trigger: CheckpointTrigger,
    ) -> Result<Checkpoint> {
        let span = info_span!(
            "create_checkpoint",
            session_id = %input.session_id,
            trigger = %trigger
        );
        self.create_inner(input, trigger, Utc::now())
            .instrument(span)
            .await
    }

    async fn create_inner(
        &self,
        input: &CheckpointInput,
        trigger: CheckpointTrigger,
        now: DateTime<Utc>,
    ) -> Result<Checkpoint> {
        let signals = self.collector.get_signals_at(now);
        let new = NewCheckpoint {
            session_id: input.session_id.clone(),
            trigger,
            task_state: input.task_state.clone(),
            signals,
            user_preferences: input.user_preferences.clone(),
            created_at: now,
        };

        let checkpoint = self.repo.save(&new).await?;
        self.mark_checkpointed(now);
        info!(
            checkpoint_number = checkpoint.checkpoint_number,
            risk = %checkpoint.signals.crash_risk,
            "checkpoint created"
        );

        if let Some(history) = &self.history {
            if let Err(err) = history
                .save_snapshot(&checkpoint.session_id, &checkpoint.signals)
                .await
            {
                warn!(%err, "failed to record signal snapshot for checkpoint");
            }
        }

        Ok(checkpoint)
    }

    /// Evaluate the triggers and checkpoint if one fires.
    ///
    /// Without a trigger nothing is written or reset.
    ///
    /// # Errors
    ///
    /// Propagates repository failures: a checkpoint that could not be
    /// persisted is reported, never skipped silently.
    pub async fn auto_checkpoint(&self, input: &CheckpointInput) -> Result<AutoCheckpointOutcome> {
        let now = Utc::now();
        let decision = self.should_trigger_checkpoint_at(now);
        let Some(trigger) = decision.reason else {
            debug!(session_id = %input.session_id, risk = %decision.risk, "no checkpoint trigger");
            return Ok(AutoCheckpointOutcome::skipped());
        };

        let span = info_span!(
            "auto_checkpoint",
            session_id = %input.session_id,
            trigger = %trigger
        );
        let checkpoint = self
            .create_inner(input, trigger, now)
            .instrument(span)
            .await?;

        Ok(AutoCheckpointOutcome {
            created: true,
            checkpoint: Some(checkpoint),
            reason: Some(trigger),
        })
    }

    /// Checkpoint history summary for `session_id`.
    ///
    /// # Errors
    ///
    /// Propagates repository failures.
    pub async fn get_checkpoint_stats(&self, session_id: &str) -> Result<CheckpointStats> {
        self.repo.stats(session_id).await
    }
}

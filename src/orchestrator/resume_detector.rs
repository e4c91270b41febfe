//! Resume-after-interruption detection and resume prompt rendering.
//!
//! A session start is a resume when its session already has a checkpoint.
//! The interruption reason comes from the risk zone of the latest known
//! signals: the checkpoint's embedded snapshot, or a signal-history
//! snapshot recorded after it when one exists. Confidence grows with the
//! number of independent risk factors that agree.

use std::fmt::Write as _;
use std::sync::Arc;

use tracing::{info, info_span, warn, Instrument};

use crate::models::checkpoint::Checkpoint;
use crate::models::resume::{InterruptionReason, ResumeDetection, ResumePrompt};
use crate::models::signals::{CrashRisk, CrashSignals};
use crate::persistence::checkpoint_repo::CheckpointRepository;
use crate::persistence::signal_repo::SignalHistoryRepo;
use crate::Result;

const CONFIDENCE_PER_FACTOR: f64 = 0.1;
const MAX_CONFIDENCE: f64 = 0.95;

/// Interruption reason and confidence implied by `signals`.
#[must_use]
#[allow(clippy::cast_precision_loss)] // a handful of factors
pub fn classify_interruption(signals: &CrashSignals) -> (InterruptionReason, f64) {
    let (reason, base) = match signals.crash_risk {
        CrashRisk::Danger => (InterruptionReason::CrashImminent, 0.6),
        CrashRisk::Warning => (InterruptionReason::ElevatedRisk, 0.4),
        CrashRisk::Safe => (InterruptionReason::ManualOrNormal, 0.3),
    };
    let confidence = base + CONFIDENCE_PER_FACTOR * signals.risk_factors.len() as f64;
    (reason, confidence.min(MAX_CONFIDENCE))
}

/// Decides whether a session start is a resume.
pub struct ResumeDetector {
    repo: Arc<dyn CheckpointRepository>,
    history: Option<SignalHistoryRepo>,
}

impl ResumeDetector {
    /// Detector reading checkpoints only.
    #[must_use]
    pub fn new(repo: Arc<dyn CheckpointRepository>) -> Self {
        Self {
            repo,
            history: None,
        }
    }

    /// Also consult the signal history for snapshots newer than the checkpoint.
    #[must_use]
    pub fn with_signal_history(mut self, history: SignalHistoryRepo) -> Self {
        self.history = Some(history);
        self
    }

    /// Inspect the checkpoint history of `session_id`.
    ///
    /// # Errors
    ///
    /// Propagates checkpoint repository failures. Signal-history failures
    /// are logged and the checkpoint's own snapshot is used instead.
    pub async fn check_resume(&self, session_id: &str) -> Result<ResumeDetection> {
        self.check_inner(session_id)
            .instrument(info_span!("check_resume", session_id))
            .await
    }

    async fn check_inner(&self, session_id: &str) -> Result<ResumeDetection> {
        let Some(checkpoint) = self.repo.get_most_recent(session_id).await? else {
            info!("no checkpoint, fresh start");
            return Ok(ResumeDetection {
                should_resume: false,
                last_checkpoint: None,
                interruption_reason: InterruptionReason::None,
                confidence: 0.0,
            });
        };

        let newer = self.newer_snapshot(&checkpoint).await;
        let (reason, confidence) =
            classify_interruption(newer.as_ref().unwrap_or(&checkpoint.signals));

        info!(
            checkpoint_number = checkpoint.checkpoint_number,
            reason = reason.describe(),
            confidence,
            from_history = newer.is_some(),
            "resume detected"
        );
        Ok(ResumeDetection {
            should_resume: true,
            last_checkpoint: Some(checkpoint),
            interruption_reason: reason,
            confidence,
        })
    }

    async fn newer_snapshot(&self, checkpoint: &Checkpoint) -> Option<CrashSignals> {
        let history = self.history.as_ref()?;
        match history.get_latest_snapshot(&checkpoint.session_id).await {
            Ok(Some(snapshot)) if snapshot.created_at > checkpoint.created_at => {
                Some(snapshot.signals)
            }
            Ok(_) => None,
            Err(err) => {
                warn!(%err, "signal history unavailable, using checkpoint signals");
                None
            }
        }
    }
}

/// Render a resume summary from `checkpoint`. Pure formatting.
///
/// The likely cause is classified from the checkpoint's own signals. Use
/// [`resume_prompt_for`] to render with the cause a detection settled on,
/// which may come from a newer signal-history snapshot.
#[must_use]
pub fn generate_resume_prompt(checkpoint: &Checkpoint) -> ResumePrompt {
    let (reason, _) = classify_interruption(&checkpoint.signals);
    render_prompt(checkpoint, reason)
}

/// Render the resume summary for `detection`, using its interruption reason.
///
/// Returns `None` when there is no checkpoint to resume from.
#[must_use]
pub fn resume_prompt_for(detection: &ResumeDetection) -> Option<ResumePrompt> {
    detection
        .last_checkpoint
        .as_ref()
        .map(|checkpoint| render_prompt(checkpoint, detection.interruption_reason))
}

fn render_prompt(checkpoint: &Checkpoint, reason: InterruptionReason) -> ResumePrompt {
    let state = &checkpoint.task_state;
    let progress_state = &state.progress;

    let mut situation = format!(
        "Resuming session {} from checkpoint #{} ({}) taken at {}. Likely cause: {}.",
        checkpoint.session_id,
        checkpoint.checkpoint_number,
        checkpoint.trigger,
        checkpoint.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
        reason.describe(),
    );
    if !checkpoint.signals.risk_factors.is_empty() {
        let _ = write!(
            situation,
            " Risk factors: {}.",
            checkpoint.signals.risk_factors.join("; ")
        );
    }

    let mut progress = format!("Operation: {}.", state.operation);
    if !progress_state.completed_steps.is_empty() {
        let _ = write!(
            progress,
            " Completed: {}.",
            progress_state.completed_steps.join(", ")
        );
    }
    if let Some(step) = &progress_state.current_step {
        let _ = write!(progress, " In progress: {step}.");
    }
    if let Some(percent) = progress_state.percent_complete {
        let _ = write!(progress, " About {percent}% complete.");
    }

    let context = state
        .context
        .clone()
        .unwrap_or_else(|| "No additional context recorded.".to_owned());

    let mut next_steps = progress_state.next_steps.clone();
    if next_steps.is_empty() {
        if let Some(step) = &progress_state.current_step {
            next_steps.push(format!("Finish: {step}"));
        }
    }

    let mut text = String::new();
    let _ = writeln!(text, "## Resume\n\n{situation}\n");
    let _ = writeln!(text, "### Progress\n\n{progress}\n");
    let _ = writeln!(text, "### Context\n\n{context}\n");
    text.push_str("### Next steps\n\n");
    if next_steps.is_empty() {
        text.push_str("None recorded.\n");
    } else {
        for (i, step) in next_steps.iter().enumerate() {
            let _ = writeln!(text, "{}. {step}", i + 1);
        }
    }
    text.push_str("\n### Active files\n\n");
    if state.active_files.is_empty() {
        text.push_str("None recorded.\n");
    } else {
        for file in &state.active_files {
            let _ = writeln!(text, "- {file}");
        }
    }

    ResumePrompt {
        situation,
        progress,
        context,
        next_steps,
        active_files: state.active_files.clone(),
        text,
    }
}

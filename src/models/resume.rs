//! Resume detection result and rendered resume prompt.

use serde::{Deserialize, Serialize};

use super::checkpoint::Checkpoint;

/// Why the previous session most likely stopped.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InterruptionReason {
    /// No checkpoint exists; nothing was interrupted.
    None,
    /// Danger-zone signals: a crash was likely imminent.
    CrashImminent,
    /// Warning-zone signals: risk was elevated.
    ElevatedRisk,
    /// Safe signals: manual stop or normal interruption.
    ManualOrNormal,
}

impl InterruptionReason {
    /// Short human-readable explanation.
    #[must_use]
    pub fn describe(self) -> &'static str {
        match self {
            Self::None => "no previous checkpoint",
            Self::CrashImminent => "crash likely imminent",
            Self::ElevatedRisk => "risk was elevated",
            Self::ManualOrNormal => "manual or normal interruption",
        }
    }
}

/// Outcome of [`ResumeDetector::check_resume`](crate::orchestrator::resume_detector::ResumeDetector::check_resume).
#[derive(Debug, Clone, PartialEq)]
pub struct ResumeDetection {
    /// Whether the new session start should offer to restore.
    pub should_resume: bool,
    /// Most recent checkpoint, if any.
    pub last_checkpoint: Option<Checkpoint>,
    /// Classified interruption reason.
    pub interruption_reason: InterruptionReason,
    /// Strength of the classification (0.0..=1.0).
    pub confidence: f64,
}

/// Structured resume summary rendered from a checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResumePrompt {
    /// What happened.
    pub situation: String,
    /// Where the work stood.
    pub progress: String,
    /// Context notes.
    pub context: String,
    /// What to do next.
    pub next_steps: Vec<String>,
    /// Files in play.
    pub active_files: Vec<String>,
    /// Full rendered text.
    pub text: String,
}

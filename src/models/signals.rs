//! Crash-signal snapshot and risk-zone thresholds.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::AppError;

/// Risk zone derived from threshold comparisons over rolling windows.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CrashRisk {
    /// No thresholds crossed.
    Safe,
    /// At least one warning or a single danger threshold crossed.
    Warning,
    /// Context exhausted or two or more danger thresholds crossed.
    Danger,
}

impl CrashRisk {
    /// Stable storage representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Safe => "safe",
            Self::Warning => "warning",
            Self::Danger => "danger",
        }
    }
}

impl fmt::Display for CrashRisk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CrashRisk {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "safe" => Ok(Self::Safe),
            "warning" => Ok(Self::Warning),
            "danger" => Ok(Self::Danger),
            other => Err(AppError::Db(format!("invalid crash risk: {other}"))),
        }
    }
}

/// Direction of tool-call latency over the recent sample window.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LatencyTrend {
    /// Latency is rising.
    Increasing,
    /// Latency is falling.
    Decreasing,
    /// No meaningful slope, or too few samples.
    Stable,
}

/// Point-in-time derived view of a session's health.
///
/// Never stored as live state: it is recomputed from the collector's
/// rolling windows on every read and only persisted as an embedded
/// snapshot (inside a checkpoint or the signal history).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CrashSignals {
    /// Fraction of the context window consumed (0.0..=1.0+).
    pub context_window_usage: f64,
    /// Estimated tokens consumed so far.
    pub total_tokens: u64,
    /// Messages observed in the session.
    pub message_count: u32,
    /// Recent message rate.
    pub messages_per_minute: f64,
    /// Minutes since the collector started.
    pub session_duration_minutes: f64,
    /// Tool calls observed in the session.
    pub tool_call_count: u32,
    /// Tool calls since the last checkpoint.
    pub tool_calls_since_checkpoint: u32,
    /// Failure fraction over the recent tool outcomes (0.0..=1.0).
    pub tool_failure_rate: f64,
    /// Failed tool calls in a row, reset by any success.
    pub consecutive_failures: u32,
    /// Latency direction over the last samples.
    pub latency_trend: LatencyTrend,
    /// Mean latency over the retained samples.
    pub average_latency_ms: f64,
    /// Classified risk zone.
    pub crash_risk: CrashRisk,
    /// Human-readable contributing factors.
    pub risk_factors: Vec<String>,
    /// When the snapshot was computed.
    pub captured_at: DateTime<Utc>,
}

/// One tier of risk thresholds (warning or danger).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct RiskThresholds {
    /// Context window fraction.
    pub context_window_usage: f64,
    /// Total messages.
    pub message_count: u32,
    /// Session age in minutes.
    pub session_duration_minutes: u32,
    /// Tool calls since the last checkpoint.
    pub tool_calls_since_checkpoint: u32,
    /// Tool failure fraction.
    pub tool_failure_rate: f64,
}

impl RiskThresholds {
    /// Default warning tier.
    #[must_use]
    pub fn warning() -> Self {
        Self {
            context_window_usage: 0.60,
            message_count: 35,
            session_duration_minutes: 60,
            tool_calls_since_checkpoint: 10,
            tool_failure_rate: 0.15,
        }
    }

    /// Default danger tier.
    #[must_use]
    pub fn danger() -> Self {
        Self {
            context_window_usage: 0.75,
            message_count: 50,
            session_duration_minutes: 90,
            tool_calls_since_checkpoint: 15,
            tool_failure_rate: 0.20,
        }
    }

    /// Number of thresholds in this tier that `signals` reaches.
    #[must_use]
    pub fn exceeded_count(&self, signals: &CrashSignals) -> usize {
        [
            signals.context_window_usage >= self.context_window_usage,
            signals.message_count >= self.message_count,
            signals.session_duration_minutes >= f64::from(self.session_duration_minutes),
            signals.tool_calls_since_checkpoint >= self.tool_calls_since_checkpoint,
            signals.tool_failure_rate >= self.tool_failure_rate,
        ]
        .into_iter()
        .filter(|hit| *hit)
        .count()
    }
}

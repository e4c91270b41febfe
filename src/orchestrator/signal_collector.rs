//! Rolling crash-signal collection and risk classification.
//!
//! The collector keeps running counters plus bounded windows of recent
//! observations and derives a [`CrashSignals`] snapshot on demand. Windows
//! hold the most recent message token estimates (20), message timestamps
//! (20), tool outcomes (50) and tool latencies (20).
//!
//! Classification and risk factors are two independent derivations over
//! the same snapshot: [`classify`] compares against both threshold tiers,
//! [`risk_factors`] lists what exceeds the danger tier.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::SignalConfig;
use crate::models::signals::{CrashRisk, CrashSignals, LatencyTrend, RiskThresholds};
use crate::{AppError, Result};

const MESSAGE_TOKEN_WINDOW: usize = 20;
const MESSAGE_TIME_WINDOW: usize = 20;
const TOOL_OUTCOME_WINDOW: usize = 50;
const LATENCY_WINDOW: usize = 20;

/// Samples used for the latency slope.
const TREND_SAMPLES: usize = 10;
/// Below this many samples the trend is `Stable`.
const TREND_MIN_SAMPLES: usize = 5;
const TREND_SLOPE_THRESHOLD: f64 = 0.1;

const CONSECUTIVE_FAILURE_FACTOR: u32 = 3;

/// Approximate characters per token for the token estimate.
const CHARS_PER_TOKEN: usize = 4;
/// Fixed framing cost charged per message.
const MESSAGE_OVERHEAD_TOKENS: u64 = 4;

/// Author of a chat message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    /// Human operator.
    User,
    /// The agent.
    Assistant,
    /// System prompt or injected instructions.
    System,
    /// Tool output echoed into the conversation.
    Tool,
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
            Self::Tool => "tool",
        })
    }
}

/// Outcome of one tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolResult {
    /// The call succeeded with this output.
    Success(String),
    /// The call failed with this error.
    Failure(String),
}

impl ToolResult {
    fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    fn text(&self) -> &str {
        match self {
            Self::Success(text) | Self::Failure(text) => text,
        }
    }
}

/// Deterministic token estimate for `text`: one token per four characters,
/// rounded up.
#[must_use]
pub fn estimate_tokens(text: &str) -> u64 {
    let chars = text.chars().count();
    u64::try_from(chars.div_ceil(CHARS_PER_TOKEN)).unwrap_or(u64::MAX)
}

struct CollectorState {
    started_at: DateTime<Utc>,
    total_tokens: u64,
    message_count: u32,
    tool_call_count: u32,
    tool_calls_since_checkpoint: u32,
    consecutive_failures: u32,
    message_tokens: VecDeque<u64>,
    message_times: VecDeque<DateTime<Utc>>,
    tool_outcomes: VecDeque<bool>,
    latencies: VecDeque<f64>,
    last_risk: CrashRisk,
}

fn push_bounded<T>(window: &mut VecDeque<T>, capacity: usize, value: T) {
    if window.len() == capacity {
        window.pop_front();
    }
    window.push_back(value);
}

// Window lengths and millisecond spans are far below f64 precision limits.
#[allow(clippy::cast_precision_loss)]
impl CollectorState {
    fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            total_tokens: 0,
            message_count: 0,
            tool_call_count: 0,
            tool_calls_since_checkpoint: 0,
            consecutive_failures: 0,
            message_tokens: VecDeque::with_capacity(MESSAGE_TOKEN_WINDOW),
            message_times: VecDeque::with_capacity(MESSAGE_TIME_WINDOW),
            tool_outcomes: VecDeque::with_capacity(TOOL_OUTCOME_WINDOW),
            latencies: VecDeque::with_capacity(LATENCY_WINDOW),
            last_risk: CrashRisk::Safe,
        }
    }

    fn messages_per_minute(&self) -> f64 {
        let (Some(first), Some(last)) = (self.message_times.front(), self.message_times.back())
        else {
            return 0.0;
        };
        let span_ms = (*last - *first).num_milliseconds();
        if self.message_times.len() < 2 || span_ms <= 0 {
            return 0.0;
        }
        (self.message_times.len() - 1) as f64 / (span_ms as f64 / 60_000.0)
    }

    fn tool_failure_rate(&self) -> f64 {
        if self.tool_outcomes.is_empty() {
            return 0.0;
        }
        let failures = self.tool_outcomes.iter().filter(|ok| !**ok).count();
        failures as f64 / self.tool_outcomes.len() as f64
    }

    fn average_latency(&self) -> f64 {
        if self.latencies.is_empty() {
            return 0.0;
        }
        self.latencies.iter().sum::<f64>() / self.latencies.len() as f64
    }
}

/// Least-squares slope over the last samples of `latencies`.
///
/// Fewer than five samples is `Stable` by definition.
#[must_use]
#[allow(clippy::cast_precision_loss)] // at most ten points
pub fn latency_trend(latencies: &[f64]) -> LatencyTrend {
    let recent = &latencies[latencies.len().saturating_sub(TREND_SAMPLES)..];
    if recent.len() < TREND_MIN_SAMPLES {
        return LatencyTrend::Stable;
    }

    let n = recent.len() as f64;
    let mean_x = (n - 1.0) / 2.0;
    let mean_y = recent.iter().sum::<f64>() / n;

    let mut numerator = 0.0;
    let mut denominator = 0.0;
    for (i, y) in recent.iter().enumerate() {
        let dx = i as f64 - mean_x;
        numerator += dx * (y - mean_y);
        denominator += dx * dx;
    }
    let slope = numerator / denominator;

    if slope > TREND_SLOPE_THRESHOLD {
        LatencyTrend::Increasing
    } else if slope < -TREND_SLOPE_THRESHOLD {
        LatencyTrend::Decreasing
    } else {
        LatencyTrend::Stable
    }
}

/// Classify `signals` into a risk zone.
///
/// Context exhaustion at the danger tier wins outright. Otherwise two or
/// more danger thresholds give `Danger`; one danger or any warning
/// threshold gives `Warning`.
#[must_use]
pub fn classify(
    signals: &CrashSignals,
    warning: &RiskThresholds,
    danger: &RiskThresholds,
) -> CrashRisk {
    if signals.context_window_usage >= danger.context_window_usage {
        return CrashRisk::Danger;
    }

    let danger_count = danger.exceeded_count(signals);
    let warning_count = warning.exceeded_count(signals);

    if danger_count >= 2 {
        CrashRisk::Danger
    } else if danger_count >= 1 || warning_count >= 1 {
        CrashRisk::Warning
    } else {
        CrashRisk::Safe
    }
}

/// Human-readable risk factors of `signals` against the danger tier.
#[must_use]
pub fn risk_factors(signals: &CrashSignals, danger: &RiskThresholds) -> Vec<String> {
    let mut factors = Vec::new();

    if signals.context_window_usage > danger.context_window_usage {
        factors.push(format!(
            "context window {:.0}% used (limit {:.0}%)",
            signals.context_window_usage * 100.0,
            danger.context_window_usage * 100.0
        ));
    }
    if signals.message_count > danger.message_count {
        factors.push(format!(
            "{} messages in session (limit {})",
            signals.message_count, danger.message_count
        ));
    }
    if signals.tool_failure_rate > danger.tool_failure_rate {
        factors.push(format!(
            "tool failure rate {:.0}% (limit {:.0}%)",
            signals.tool_failure_rate * 100.0,
            danger.tool_failure_rate * 100.0
        ));
    }
    if signals.consecutive_failures >= CONSECUTIVE_FAILURE_FACTOR {
        factors.push(format!(
            "{} consecutive tool failures",
            signals.consecutive_failures
        ));
    }
    if signals.latency_trend == LatencyTrend::Increasing {
        factors.push("tool latency increasing".to_owned());
    }

    factors
}

/// Per-session signal aggregator.
///
/// Safe to share between tasks; all methods are synchronous and hold the
/// internal lock only for the duration of the call.
pub struct SignalCollector {
    config: SignalConfig,
    state: Mutex<CollectorState>,
}

impl SignalCollector {
    /// Collector whose session clock starts now.
    #[must_use]
    pub fn new(config: SignalConfig) -> Self {
        Self::started_at(config, Utc::now())
    }

    /// Collector whose session clock started at `started_at`.
    #[must_use]
    pub fn started_at(config: SignalConfig, started_at: DateTime<Utc>) -> Self {
        Self {
            config,
            state: Mutex::new(CollectorState::new(started_at)),
        }
    }

    /// Thresholds and capacity in use.
    #[must_use]
    pub fn config(&self) -> &SignalConfig {
        &self.config
    }

    fn state(&self) -> MutexGuard<'_, CollectorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a chat message.
    pub fn on_message(&self, content: &str, role: MessageRole) {
        self.on_message_at(content, role, Utc::now());
    }

    /// Record a chat message observed at `at`.
    pub fn on_message_at(&self, content: &str, role: MessageRole, at: DateTime<Utc>) {
        let tokens = estimate_tokens(content) + MESSAGE_OVERHEAD_TOKENS;
        let mut state = self.state();
        state.message_count = state.message_count.saturating_add(1);
        state.total_tokens = state.total_tokens.saturating_add(tokens);
        push_bounded(&mut state.message_tokens, MESSAGE_TOKEN_WINDOW, tokens);
        push_bounded(&mut state.message_times, MESSAGE_TIME_WINDOW, at);
        debug!(%role, tokens, total_tokens = state.total_tokens, "message recorded");
    }

    /// Record a tool call.
    ///
    /// Arguments and result text count towards token usage.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidArgument` for an empty tool name or a
    /// negative or non-finite latency.
    pub fn on_tool_call(
        &self,
        tool: &str,
        args: &serde_json::Value,
        result: &ToolResult,
        latency_ms: f64,
    ) -> Result<()> {
        if tool.trim().is_empty() {
            return Err(AppError::InvalidArgument("tool name must not be empty".into()));
        }
        if !latency_ms.is_finite() || latency_ms < 0.0 {
            return Err(AppError::InvalidArgument(format!(
                "tool latency must be a non-negative number, got {latency_ms}"
            )));
        }

        let tokens = estimate_tokens(&args.to_string()) + estimate_tokens(result.text());
        let success = result.is_success();

        let mut state = self.state();
        state.tool_call_count = state.tool_call_count.saturating_add(1);
        state.tool_calls_since_checkpoint = state.tool_calls_since_checkpoint.saturating_add(1);
        state.total_tokens = state.total_tokens.saturating_add(tokens);
        if success {
            state.consecutive_failures = 0;
        } else {
            state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        }
        push_bounded(&mut state.tool_outcomes, TOOL_OUTCOME_WINDOW, success);
        push_bounded(&mut state.latencies, LATENCY_WINDOW, latency_ms);

        debug!(
            tool,
            success,
            latency_ms,
            consecutive_failures = state.consecutive_failures,
            "tool call recorded"
        );
        Ok(())
    }

    /// Current signal snapshot.
    #[must_use]
    pub fn get_signals(&self) -> CrashSignals {
        self.get_signals_at(Utc::now())
    }

    /// Signal snapshot evaluated at `now`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)] // token counts stay far below 2^52
    pub fn get_signals_at(&self, now: DateTime<Utc>) -> CrashSignals {
        let mut state = self.state();

        let context_window_usage =
            state.total_tokens as f64 / self.config.context_window_tokens.max(1) as f64;
        let session_duration_minutes =
            (now - state.started_at).num_milliseconds().max(0) as f64 / 60_000.0;
        let latencies: Vec<f64> = state.latencies.iter().copied().collect();

        let mut signals = CrashSignals {
            context_window_usage,
            total_tokens: state.total_tokens,
            message_count: state.message_count,
            messages_per_minute: state.messages_per_minute(),
            session_duration_minutes,
            tool_call_count: state.tool_call_count,
            tool_calls_since_checkpoint: state.tool_calls_since_checkpoint,
            tool_failure_rate: state.tool_failure_rate(),
            consecutive_failures: state.consecutive_failures,
            latency_trend: latency_trend(&latencies),
            average_latency_ms: state.average_latency(),
            crash_risk: CrashRisk::Safe,
            risk_factors: Vec::new(),
            captured_at: now,
        };
        signals.crash_risk = classify(&signals, &self.config.warning, &self.config.danger);
        signals.risk_factors = risk_factors(&signals, &self.config.danger);

        if signals.crash_risk != state.last_risk {
            let previous = state.last_risk;
            state.last_risk = signals.crash_risk;
            if signals.crash_risk == CrashRisk::Danger {
                warn!(%previous, risk = %signals.crash_risk, factors = ?signals.risk_factors, "crash risk changed");
            } else {
                info!(%previous, risk = %signals.crash_risk, "crash risk changed");
            }
        }

        signals
    }

    /// Mean token estimate over the recent message window.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn average_message_tokens(&self) -> f64 {
        let state = self.state();
        if state.message_tokens.is_empty() {
            return 0.0;
        }
        state.message_tokens.iter().sum::<u64>() as f64 / state.message_tokens.len() as f64
    }

    /// Tool calls recorded since the last checkpoint.
    #[must_use]
    pub fn tool_calls_since_checkpoint(&self) -> u32 {
        self.state().tool_calls_since_checkpoint
    }

    /// Restart the tool-calls-since-checkpoint counter.
    pub fn reset_checkpoint_counter(&self) {
        self.state().tool_calls_since_checkpoint = 0;
    }
}

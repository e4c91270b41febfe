//! Global configuration parsing and validation.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::models::signals::RiskThresholds;
use crate::{AppError, Result};

/// Distributed lock defaults.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct LockConfig {
    /// TTL applied when the caller does not pass one.
    #[serde(default = "default_lock_ttl")]
    pub default_ttl_seconds: u64,
    /// Delay between acquisition attempts while waiting.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
    /// Key namespace for lock entries in the shared store.
    #[serde(default = "default_lock_prefix")]
    pub key_prefix: String,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_ttl_seconds: default_lock_ttl(),
            retry_delay_ms: default_retry_delay(),
            key_prefix: default_lock_prefix(),
        }
    }
}

fn default_lock_ttl() -> u64 {
    30
}

fn default_retry_delay() -> u64 {
    50
}

fn default_lock_prefix() -> String {
    "lock:".into()
}

/// Worker liveness settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct HeartbeatConfig {
    /// How often a worker refreshes its heartbeat.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_seconds: u64,
    /// Gap after which a worker is classified crashed.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_seconds: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_heartbeat_interval(),
            timeout_seconds: default_heartbeat_timeout(),
        }
    }
}

fn default_heartbeat_interval() -> u64 {
    10
}

fn default_heartbeat_timeout() -> u64 {
    30
}

/// Signal collection and risk classification settings.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct SignalConfig {
    /// Context window capacity in tokens.
    #[serde(default = "default_context_window")]
    pub context_window_tokens: u64,
    /// Warning tier thresholds.
    #[serde(default = "RiskThresholds::warning")]
    pub warning: RiskThresholds,
    /// Danger tier thresholds.
    #[serde(default = "RiskThresholds::danger")]
    pub danger: RiskThresholds,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            context_window_tokens: default_context_window(),
            warning: RiskThresholds::warning(),
            danger: RiskThresholds::danger(),
        }
    }
}

fn default_context_window() -> u64 {
    200_000
}

/// Checkpoint cadence.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct CheckpointConfig {
    /// Tool calls between interval checkpoints.
    #[serde(default = "default_tool_call_interval")]
    pub tool_call_interval: u32,
    /// Seconds between time-based checkpoints.
    #[serde(default = "default_time_interval")]
    pub time_interval_seconds: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            tool_call_interval: default_tool_call_interval(),
            time_interval_seconds: default_time_interval(),
        }
    }
}

impl CheckpointConfig {
    /// Time interval as a `chrono` duration.
    #[must_use]
    pub fn time_interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.time_interval_seconds).unwrap_or(i64::MAX))
    }
}

fn default_tool_call_interval() -> u32 {
    5
}

fn default_time_interval() -> u64 {
    600
}

/// Crash recovery policy.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RecoveryConfig {
    /// Restarts allowed within one window.
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    /// Length of the restart-counting window.
    #[serde(default = "default_restart_window")]
    pub restart_window_seconds: u64,
    /// Pause before relaunching.
    #[serde(default = "default_restart_delay")]
    pub restart_delay_seconds: u64,
    /// Relaunch command; the chat URL is appended as the final argument.
    #[serde(default)]
    pub restart_command: Vec<String>,
    /// How often the supervisor scans for crashed workers.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_restarts: default_max_restarts(),
            restart_window_seconds: default_restart_window(),
            restart_delay_seconds: default_restart_delay(),
            restart_command: Vec::new(),
            poll_interval_seconds: default_poll_interval(),
        }
    }
}

fn default_max_restarts() -> u32 {
    3
}

fn default_restart_window() -> u64 {
    3600
}

fn default_restart_delay() -> u64 {
    5
}

fn default_poll_interval() -> u64 {
    10
}

fn default_store_path() -> PathBuf {
    PathBuf::from(".chat-fleet/store.db")
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".chat-fleet/history.db")
}

fn default_recovery_state_path() -> PathBuf {
    PathBuf::from(".chat-fleet/recovery-state.json")
}

fn default_retention_days() -> u32 {
    30
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Coordination store shared by every process of the fleet.
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,
    /// Checkpoint and signal history database.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// JSON document holding restart counters.
    #[serde(default = "default_recovery_state_path")]
    pub recovery_state_path: PathBuf,
    /// Days before checkpoints and snapshots are purged.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Lock defaults.
    #[serde(default)]
    pub lock: LockConfig,
    /// Heartbeat settings.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    /// Risk thresholds.
    #[serde(default)]
    pub signals: SignalConfig,
    /// Checkpoint cadence.
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    /// Restart policy.
    #[serde(default)]
    pub recovery: RecoveryConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            store_path: default_store_path(),
            db_path: default_db_path(),
            recovery_state_path: default_recovery_state_path(),
            retention_days: default_retention_days(),
            lock: LockConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            signals: SignalConfig::default(),
            checkpoint: CheckpointConfig::default(),
            recovery: RecoveryConfig::default(),
        }
    }
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Heartbeat refresh interval.
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat.interval_seconds)
    }

    /// Heartbeat gap tolerated before a worker is crashed.
    #[must_use]
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat.timeout_seconds)
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` describing the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat.timeout_seconds == 0 {
            return Err(AppError::Config(
                "heartbeat.timeout_seconds must be greater than zero".into(),
            ));
        }

        if self.heartbeat.interval_seconds >= self.heartbeat.timeout_seconds {
            return Err(AppError::Config(
                "heartbeat.interval_seconds must be below heartbeat.timeout_seconds".into(),
            ));
        }

        if self.checkpoint.tool_call_interval == 0 {
            return Err(AppError::Config(
                "checkpoint.tool_call_interval must be greater than zero".into(),
            ));
        }

        if self.signals.context_window_tokens == 0 {
            return Err(AppError::Config(
                "signals.context_window_tokens must be greater than zero".into(),
            ));
        }

        for (tier, thresholds) in [
            ("warning", &self.signals.warning),
            ("danger", &self.signals.danger),
        ] {
            for (name, ratio) in [
                ("context_window_usage", thresholds.context_window_usage),
                ("tool_failure_rate", thresholds.tool_failure_rate),
            ] {
                if ratio.is_nan() || ratio <= 0.0 || ratio > 1.0 {
                    return Err(AppError::Config(format!(
                        "signals.{tier}.{name} must be in (0, 1], got {ratio}"
                    )));
                }
            }
        }

        let warning = &self.signals.warning;
        let danger = &self.signals.danger;
        if warning.context_window_usage > danger.context_window_usage
            || warning.message_count > danger.message_count
            || warning.session_duration_minutes > danger.session_duration_minutes
            || warning.tool_calls_since_checkpoint > danger.tool_calls_since_checkpoint
            || warning.tool_failure_rate > danger.tool_failure_rate
        {
            return Err(AppError::Config(
                "signals.warning thresholds must not exceed signals.danger thresholds".into(),
            ));
        }

        Ok(())
    }
}

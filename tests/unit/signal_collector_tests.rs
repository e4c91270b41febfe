//! Unit tests for signal collection and risk classification.

use chat_fleet::config::SignalConfig;
use chat_fleet::models::signals::{CrashRisk, LatencyTrend};
use chat_fleet::orchestrator::signal_collector::{MessageRole, SignalCollector, ToolResult};
use chat_fleet::AppError;
use chrono::{Duration, Utc};
use serde_json::json;

fn record_calls(collector: &SignalCollector, count: u32, fails: impl Fn(u32) -> bool) {
    for i in 0..count {
        let result = if fails(i) {
            ToolResult::Failure("permission denied".into())
        } else {
            ToolResult::Success("ok".into())
        };
        collector
            .on_tool_call("read_file", &json!({"path": "src/lib.rs"}), &result, 120.0)
            .expect("record tool call");
    }
}

// ── Token accounting ────────────────────────────────────

#[test]
fn tokens_count_messages_and_tool_io() {
    let collector = SignalCollector::new(SignalConfig::default());

    collector.on_message("hello world", MessageRole::User);
    assert_eq!(collector.get_signals().total_tokens, 7);

    collector
        .on_tool_call(
            "search",
            &json!({"q": "x"}),
            &ToolResult::Success("abcdefgh".into()),
            10.0,
        )
        .expect("record");
    let signals = collector.get_signals();
    assert_eq!(signals.total_tokens, 12);
    assert_eq!(signals.message_count, 1);
    assert_eq!(signals.tool_call_count, 1);
}

#[test]
fn average_message_tokens_uses_recent_window() {
    let collector = SignalCollector::new(SignalConfig::default());
    assert!(collector.average_message_tokens().abs() < f64::EPSILON);

    let long = "x".repeat(400);
    for _ in 0..5 {
        collector.on_message(&long, MessageRole::Assistant);
    }
    for _ in 0..20 {
        collector.on_message("abcd", MessageRole::User);
    }

    assert!((collector.average_message_tokens() - 5.0).abs() < f64::EPSILON);
    assert_eq!(collector.get_signals().message_count, 25);
}

#[test]
fn messages_per_minute_from_timestamps() {
    let start = Utc::now();
    let collector = SignalCollector::started_at(SignalConfig::default(), start);
    for i in 0..3 {
        collector.on_message_at("hi", MessageRole::User, start + Duration::seconds(30 * i));
    }

    let signals = collector.get_signals_at(start + Duration::minutes(1));
    assert!((signals.messages_per_minute - 2.0).abs() < 1e-9);
}

// ── Classification ──────────────────────────────────────

#[test]
fn fresh_session_is_safe() {
    let collector = SignalCollector::new(SignalConfig::default());
    record_calls(&collector, 3, |_| false);

    let signals = collector.get_signals();
    assert_eq!(signals.crash_risk, CrashRisk::Safe);
    assert!(signals.risk_factors.is_empty());
    assert!(signals.tool_failure_rate.abs() < f64::EPSILON);
}

#[test]
fn high_failure_rate_with_many_calls_is_danger() {
    let collector = SignalCollector::new(SignalConfig::default());
    record_calls(&collector, 100, |i| i % 4 == 0);

    let signals = collector.get_signals();
    assert_eq!(signals.tool_calls_since_checkpoint, 100);
    assert!((signals.tool_failure_rate - 0.24).abs() < 1e-9);
    assert_eq!(signals.crash_risk, CrashRisk::Danger);
    assert_eq!(
        signals.risk_factors,
        vec!["tool failure rate 24% (limit 20%)".to_owned()]
    );
}

#[test]
fn single_danger_threshold_is_warning() {
    let collector = SignalCollector::new(SignalConfig::default());
    record_calls(&collector, 100, |i| i % 6 == 0);

    let signals = collector.get_signals();
    assert!((signals.tool_failure_rate - 0.16).abs() < 1e-9);
    assert_eq!(signals.crash_risk, CrashRisk::Warning);
}

#[test]
fn context_exhaustion_alone_is_danger() {
    let config = SignalConfig {
        context_window_tokens: 100,
        ..SignalConfig::default()
    };
    let collector = SignalCollector::new(config);
    collector.on_message(&"x".repeat(400), MessageRole::Tool);

    let signals = collector.get_signals();
    assert!(signals.context_window_usage > 1.0);
    assert_eq!(signals.crash_risk, CrashRisk::Danger);
    assert_eq!(
        signals.risk_factors,
        vec!["context window 104% used (limit 75%)".to_owned()]
    );
}

#[test]
fn long_session_reaches_warning() {
    let start = Utc::now();
    let collector = SignalCollector::started_at(SignalConfig::default(), start);

    let early = collector.get_signals_at(start + Duration::minutes(30));
    assert_eq!(early.crash_risk, CrashRisk::Safe);

    let late = collector.get_signals_at(start + Duration::minutes(90));
    assert!((late.session_duration_minutes - 90.0).abs() < 1e-9);
    assert_eq!(late.crash_risk, CrashRisk::Warning);
}

#[test]
fn consecutive_failures_and_latency_trend_are_factors() {
    let collector = SignalCollector::new(SignalConfig::default());
    for i in 0..10 {
        collector
            .on_tool_call(
                "run_tests",
                &json!({}),
                &ToolResult::Failure("timeout".into()),
                f64::from(i + 1) * 100.0,
            )
            .expect("record");
    }

    let signals = collector.get_signals();
    assert_eq!(signals.consecutive_failures, 10);
    assert_eq!(signals.latency_trend, LatencyTrend::Increasing);
    assert!((signals.average_latency_ms - 550.0).abs() < 1e-9);
    assert!(signals
        .risk_factors
        .contains(&"10 consecutive tool failures".to_owned()));
    assert!(signals
        .risk_factors
        .contains(&"tool latency increasing".to_owned()));
}

#[test]
fn success_resets_consecutive_failures() {
    let collector = SignalCollector::new(SignalConfig::default());
    record_calls(&collector, 4, |i| i < 3);
    assert_eq!(collector.get_signals().consecutive_failures, 0);
}

#[test]
fn outcome_window_forgets_old_failures() {
    let collector = SignalCollector::new(SignalConfig::default());
    record_calls(&collector, 100, |i| i < 50);

    let signals = collector.get_signals();
    assert!(signals.tool_failure_rate.abs() < f64::EPSILON);
    assert_eq!(signals.tool_call_count, 100);
}

// ── Checkpoint counter ──────────────────────────────────

#[test]
fn reset_checkpoint_counter_keeps_totals() {
    let collector = SignalCollector::new(SignalConfig::default());
    record_calls(&collector, 7, |_| false);
    assert_eq!(collector.tool_calls_since_checkpoint(), 7);

    collector.reset_checkpoint_counter();

    let signals = collector.get_signals();
    assert_eq!(signals.tool_calls_since_checkpoint, 0);
    assert_eq!(signals.tool_call_count, 7);
}

// ── Validation ──────────────────────────────────────────

#[test]
fn invalid_tool_calls_are_rejected_without_recording() {
    let collector = SignalCollector::new(SignalConfig::default());
    let ok = ToolResult::Success(String::new());

    assert!(matches!(
        collector.on_tool_call("", &json!({}), &ok, 1.0),
        Err(AppError::InvalidArgument(_))
    ));
    assert!(matches!(
        collector.on_tool_call("grep", &json!({}), &ok, -1.0),
        Err(AppError::InvalidArgument(_))
    ));
    assert!(matches!(
        collector.on_tool_call("grep", &json!({}), &ok, f64::NAN),
        Err(AppError::InvalidArgument(_))
    ));
    assert_eq!(collector.get_signals().tool_call_count, 0);
}

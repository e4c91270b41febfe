//! Integration tests for resume detection against stored checkpoints.

use std::sync::Arc;

use chat_fleet::config::SignalConfig;
use chat_fleet::models::checkpoint::{CheckpointTrigger, NewCheckpoint, TaskState};
use chat_fleet::models::resume::InterruptionReason;
use chat_fleet::models::signals::{CrashRisk, CrashSignals};
use chat_fleet::orchestrator::resume_detector::{
    generate_resume_prompt, resume_prompt_for, ResumeDetector,
};
use chat_fleet::orchestrator::signal_collector::SignalCollector;
use chat_fleet::persistence::checkpoint_repo::{CheckpointRepository, SqliteCheckpointRepo};
use chat_fleet::persistence::db::{self, Database};
use chat_fleet::persistence::signal_repo::SignalHistoryRepo;
use chrono::{Duration, Utc};
use serde_json::json;

fn signals(risk: CrashRisk, factors: &[&str]) -> CrashSignals {
    let mut signals = SignalCollector::new(SignalConfig::default()).get_signals();
    signals.crash_risk = risk;
    signals.risk_factors = factors.iter().map(|f| (*f).to_owned()).collect();
    signals
}

async fn setup() -> (Arc<Database>, Arc<SqliteCheckpointRepo>) {
    let pool = Arc::new(db::connect_memory().await.expect("memory db"));
    let repo = Arc::new(SqliteCheckpointRepo::new(Arc::clone(&pool)));
    (pool, repo)
}

async fn save_checkpoint(
    repo: &SqliteCheckpointRepo,
    session_id: &str,
    signals: CrashSignals,
    age: Duration,
) {
    repo.save(&NewCheckpoint {
        session_id: session_id.into(),
        trigger: CheckpointTrigger::WarningZone,
        task_state: TaskState {
            operation: "write release notes".into(),
            ..TaskState::default()
        },
        signals,
        user_preferences: json!({}),
        created_at: Utc::now() - age,
    })
    .await
    .expect("save checkpoint");
}

#[tokio::test]
async fn no_checkpoint_means_fresh_start() {
    let (_pool, repo) = setup().await;
    let detector = ResumeDetector::new(repo);

    let detection = detector.check_resume("s1").await.expect("check");

    assert!(!detection.should_resume);
    assert!(detection.last_checkpoint.is_none());
    assert!(resume_prompt_for(&detection).is_none());
    assert_eq!(detection.interruption_reason, InterruptionReason::None);
    assert!(detection.confidence.abs() < f64::EPSILON);
}

#[tokio::test]
async fn danger_checkpoint_means_crash_imminent() {
    let (_pool, repo) = setup().await;
    save_checkpoint(
        &repo,
        "s1",
        signals(CrashRisk::Danger, &["a", "b"]),
        Duration::minutes(1),
    )
    .await;
    let detector = ResumeDetector::new(Arc::clone(&repo) as Arc<dyn CheckpointRepository>);

    let detection = detector.check_resume("s1").await.expect("check");

    assert!(detection.should_resume);
    assert_eq!(detection.interruption_reason, InterruptionReason::CrashImminent);
    assert!((detection.confidence - 0.8).abs() < 1e-9);
    let checkpoint = detection.last_checkpoint.expect("checkpoint");
    assert_eq!(checkpoint.checkpoint_number, 1);

    let prompt = generate_resume_prompt(&checkpoint);
    assert!(prompt.situation.contains("crash likely imminent"));
    assert!(prompt.progress.starts_with("Operation: write release notes."));
}

#[tokio::test]
async fn latest_checkpoint_is_used() {
    let (_pool, repo) = setup().await;
    save_checkpoint(&repo, "s1", signals(CrashRisk::Danger, &[]), Duration::minutes(5)).await;
    save_checkpoint(&repo, "s1", signals(CrashRisk::Safe, &[]), Duration::minutes(1)).await;
    let detector = ResumeDetector::new(Arc::clone(&repo) as Arc<dyn CheckpointRepository>);

    let detection = detector.check_resume("s1").await.expect("check");

    assert_eq!(detection.interruption_reason, InterruptionReason::ManualOrNormal);
    assert_eq!(
        detection.last_checkpoint.expect("checkpoint").checkpoint_number,
        2
    );
}

#[tokio::test]
async fn newer_history_snapshot_overrides_checkpoint_signals() {
    let (pool, repo) = setup().await;
    save_checkpoint(&repo, "s1", signals(CrashRisk::Safe, &[]), Duration::minutes(10)).await;
    let history = SignalHistoryRepo::new(Arc::clone(&pool));
    history
        .save_snapshot("s1", &signals(CrashRisk::Warning, &["x"]))
        .await
        .expect("snapshot");

    let detector = ResumeDetector::new(Arc::clone(&repo) as Arc<dyn CheckpointRepository>)
        .with_signal_history(history);
    let detection = detector.check_resume("s1").await.expect("check");

    assert_eq!(detection.interruption_reason, InterruptionReason::ElevatedRisk);
    assert!((detection.confidence - 0.5).abs() < 1e-9);

    let prompt = resume_prompt_for(&detection).expect("prompt");
    assert!(prompt
        .situation
        .contains(InterruptionReason::ElevatedRisk.describe()));
    let checkpoint = detection.last_checkpoint.as_ref().expect("checkpoint");
    assert!(generate_resume_prompt(checkpoint)
        .situation
        .contains(InterruptionReason::ManualOrNormal.describe()));
}

#[tokio::test]
async fn older_history_snapshot_is_ignored() {
    let (pool, repo) = setup().await;
    let history = SignalHistoryRepo::new(Arc::clone(&pool));
    history
        .save_snapshot("s1", &signals(CrashRisk::Danger, &[]))
        .await
        .expect("snapshot");
    // Checkpoint stamped after the snapshot.
    save_checkpoint(&repo, "s1", signals(CrashRisk::Safe, &[]), -Duration::minutes(1)).await;

    let detector = ResumeDetector::new(Arc::clone(&repo) as Arc<dyn CheckpointRepository>)
        .with_signal_history(history);
    let detection = detector.check_resume("s1").await.expect("check");

    assert_eq!(detection.interruption_reason, InterruptionReason::ManualOrNormal);
}

#[tokio::test]
async fn sessions_are_independent() {
    let (_pool, repo) = setup().await;
    save_checkpoint(&repo, "s1", signals(CrashRisk::Danger, &[]), Duration::minutes(1)).await;
    let detector = ResumeDetector::new(Arc::clone(&repo) as Arc<dyn CheckpointRepository>);

    assert!(!detector.check_resume("s2").await.expect("check").should_resume);
}

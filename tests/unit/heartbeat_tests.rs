//! Unit tests for the background heartbeat ticker.

use std::sync::Arc;
use std::time::Duration;

use chat_fleet::coordination::{HeartbeatTicker, WorkerRegistry};
use chat_fleet::models::worker::{WorkerHealth, WorkerInfo};
use chat_fleet::store::{MemoryStore, SharedStore};
use tokio_util::sync::CancellationToken;

fn registry(timeout: Duration) -> Arc<WorkerRegistry> {
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    Arc::new(WorkerRegistry::new(store, timeout))
}

#[tokio::test]
async fn ticker_beats_until_stopped() {
    let registry = registry(Duration::from_secs(5));
    registry
        .register("w1", WorkerInfo::idle("chat-a"))
        .await
        .expect("register");

    let mut handle = HeartbeatTicker::new(
        Arc::clone(&registry),
        "w1",
        Duration::from_millis(20),
        CancellationToken::new(),
    )
    .spawn();
    assert_eq!(handle.worker_id(), "w1");

    tokio::time::sleep(Duration::from_millis(110)).await;
    handle.stop().await;

    let beats = handle.beats();
    assert!(beats >= 2, "expected several beats, got {beats}");
    assert_eq!(handle.failures(), 0);
    assert!(handle.is_stopped());

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(handle.beats(), beats, "no beats after stop");
}

#[tokio::test]
async fn ticker_keeps_worker_healthy_past_timeout() {
    let registry = registry(Duration::from_millis(150));
    registry
        .register("w1", WorkerInfo::idle("chat-a"))
        .await
        .expect("register");

    let mut handle = HeartbeatTicker::new(
        Arc::clone(&registry),
        "w1",
        Duration::from_millis(30),
        CancellationToken::new(),
    )
    .spawn();

    tokio::time::sleep(Duration::from_millis(300)).await;
    let worker = registry
        .get_worker("w1")
        .await
        .expect("get")
        .expect("registered");
    assert_eq!(worker.health, WorkerHealth::Healthy);

    handle.stop().await;
}

#[tokio::test]
async fn unregistered_worker_counts_failures() {
    let registry = registry(Duration::from_secs(5));
    let mut handle = HeartbeatTicker::new(
        Arc::clone(&registry),
        "ghost",
        Duration::from_millis(20),
        CancellationToken::new(),
    )
    .spawn();

    tokio::time::sleep(Duration::from_millis(70)).await;
    handle.stop().await;

    assert_eq!(handle.beats(), 0);
    assert!(handle.failures() >= 1);
    assert!(registry.get_worker("ghost").await.expect("get").is_none());
}

#[tokio::test]
async fn stop_is_idempotent() {
    let registry = registry(Duration::from_secs(5));
    let mut handle = HeartbeatTicker::new(
        registry,
        "w1",
        Duration::from_millis(20),
        CancellationToken::new(),
    )
    .spawn();

    handle.stop().await;
    handle.stop().await;
    assert!(handle.is_stopped());
}

#[tokio::test]
async fn parent_cancellation_stops_ticker() {
    let registry = registry(Duration::from_secs(5));
    registry
        .register("w1", WorkerInfo::idle("chat-a"))
        .await
        .expect("register");
    let parent = CancellationToken::new();

    let mut handle = HeartbeatTicker::new(
        Arc::clone(&registry),
        "w1",
        Duration::from_millis(20),
        parent.child_token(),
    )
    .spawn();

    tokio::time::sleep(Duration::from_millis(50)).await;
    parent.cancel();
    tokio::time::sleep(Duration::from_millis(30)).await;
    let beats = handle.beats();
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(handle.beats(), beats);

    handle.stop().await;
}

//! Unit tests for the worker registry and its lazy crash detection.

use std::sync::Arc;
use std::time::Duration;

use chat_fleet::coordination::WorkerRegistry;
use chat_fleet::models::worker::{WorkerHealth, WorkerInfo, WorkerStatus};
use chat_fleet::store::{MemoryStore, SharedStore};
use chat_fleet::AppError;

fn registry(timeout: Duration) -> (Arc<MemoryStore>, WorkerRegistry) {
    let store = Arc::new(MemoryStore::new());
    let registry = WorkerRegistry::new(Arc::clone(&store) as Arc<dyn SharedStore>, timeout);
    (store, registry)
}

fn busy(chat_id: &str, task: &str) -> WorkerInfo {
    WorkerInfo {
        chat_id: chat_id.into(),
        status: WorkerStatus::Busy,
        current_task: Some(task.into()),
    }
}

// ── Registration ────────────────────────────────────────

#[tokio::test]
async fn register_creates_healthy_worker() {
    let (_store, registry) = registry(Duration::from_secs(30));

    let worker = registry
        .register("w1", WorkerInfo::idle("chat-a"))
        .await
        .expect("register");

    assert_eq!(worker.worker_id, "w1");
    assert_eq!(worker.chat_id, "chat-a");
    assert_eq!(worker.status, WorkerStatus::Idle);
    assert_eq!(worker.health, WorkerHealth::Healthy);
    assert_eq!(worker.registered_at, worker.last_heartbeat);

    let stored = registry
        .get_worker("w1")
        .await
        .expect("get")
        .expect("registered");
    assert_eq!(stored, worker);
}

#[tokio::test]
async fn reregistration_preserves_registered_at() {
    let (_store, registry) = registry(Duration::from_secs(30));
    let first = registry
        .register("w1", WorkerInfo::idle("chat-a"))
        .await
        .expect("register");

    tokio::time::sleep(Duration::from_millis(10)).await;
    let second = registry
        .register("w1", busy("chat-b", "index repo"))
        .await
        .expect("re-register");

    assert_eq!(second.registered_at, first.registered_at);
    assert!(second.last_heartbeat > first.last_heartbeat);
    assert_eq!(second.chat_id, "chat-b");
    assert_eq!(second.status, WorkerStatus::Busy);
    assert_eq!(second.current_task.as_deref(), Some("index repo"));
}

#[tokio::test]
async fn unregister_removes_record() {
    let (_store, registry) = registry(Duration::from_secs(30));
    registry
        .register("w1", WorkerInfo::idle("chat-a"))
        .await
        .expect("register");

    assert!(registry.unregister("w1").await.expect("unregister"));
    assert!(!registry.unregister("w1").await.expect("unregister again"));
    assert!(registry.get_worker("w1").await.expect("get").is_none());
}

#[tokio::test]
async fn blank_worker_id_is_rejected() {
    let (_store, registry) = registry(Duration::from_secs(30));
    assert!(matches!(
        registry.register(" ", WorkerInfo::idle("c")).await,
        Err(AppError::InvalidArgument(_))
    ));
    assert!(matches!(
        registry.heartbeat("").await,
        Err(AppError::InvalidArgument(_))
    ));
}

// ── Heartbeats and crash detection ──────────────────────

#[tokio::test]
async fn heartbeat_for_unknown_worker_is_noop() {
    let (_store, registry) = registry(Duration::from_secs(30));
    assert!(!registry.heartbeat("ghost").await.expect("heartbeat"));
    assert!(registry.list_workers().await.expect("list").is_empty());
}

#[tokio::test]
async fn heartbeat_advances_last_heartbeat() {
    let (_store, registry) = registry(Duration::from_secs(30));
    let worker = registry
        .register("w1", WorkerInfo::idle("chat-a"))
        .await
        .expect("register");

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(registry.heartbeat("w1").await.expect("heartbeat"));

    let refreshed = registry
        .get_worker("w1")
        .await
        .expect("get")
        .expect("registered");
    assert!(refreshed.last_heartbeat > worker.last_heartbeat);
}

#[tokio::test]
async fn missed_heartbeats_mark_worker_crashed() {
    let (_store, registry) = registry(Duration::from_millis(100));
    registry
        .register("stale", WorkerInfo::idle("chat-a"))
        .await
        .expect("register");

    tokio::time::sleep(Duration::from_millis(200)).await;
    registry
        .register("fresh", WorkerInfo::idle("chat-b"))
        .await
        .expect("register");

    let crashed = registry.get_crashed_workers().await.expect("crashed");
    assert_eq!(crashed.len(), 1);
    assert_eq!(crashed[0].worker_id, "stale");

    // Detection is persisted, not just reported.
    let workers = registry.list_workers().await.expect("list");
    let ids: Vec<&str> = workers.iter().map(|w| w.worker_id.as_str()).collect();
    assert_eq!(ids, vec!["fresh", "stale"]);
    assert_eq!(workers[1].health, WorkerHealth::Crashed);
}

#[tokio::test]
async fn heartbeat_revives_crashed_worker() {
    let (_store, registry) = registry(Duration::from_millis(100));
    registry
        .register("w1", WorkerInfo::idle("chat-a"))
        .await
        .expect("register");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(registry.get_crashed_workers().await.expect("crashed").len(), 1);
    registry
        .update_status("w1", WorkerStatus::Crashed, None)
        .await
        .expect("status");

    assert!(registry.heartbeat("w1").await.expect("heartbeat"));

    let worker = registry
        .get_worker("w1")
        .await
        .expect("get")
        .expect("registered");
    assert_eq!(worker.health, WorkerHealth::Healthy);
    assert_eq!(worker.status, WorkerStatus::Idle);
    assert!(registry.get_crashed_workers().await.expect("crashed").is_empty());
}

// ── Status and health ───────────────────────────────────

#[tokio::test]
async fn update_status_task_semantics() {
    let (_store, registry) = registry(Duration::from_secs(30));
    registry
        .register("w1", WorkerInfo::idle("chat-a"))
        .await
        .expect("register");

    registry
        .update_status("w1", WorkerStatus::Busy, Some("build".into()))
        .await
        .expect("busy");
    let worker = registry.get_worker("w1").await.expect("get").expect("w1");
    assert_eq!(worker.status, WorkerStatus::Busy);
    assert_eq!(worker.current_task.as_deref(), Some("build"));

    // A status change without a task keeps the current one...
    registry
        .update_status("w1", WorkerStatus::Crashed, None)
        .await
        .expect("crashed");
    let worker = registry.get_worker("w1").await.expect("get").expect("w1");
    assert_eq!(worker.current_task.as_deref(), Some("build"));

    // ...except going idle, which clears it.
    registry
        .update_status("w1", WorkerStatus::Idle, None)
        .await
        .expect("idle");
    let worker = registry.get_worker("w1").await.expect("get").expect("w1");
    assert_eq!(worker.status, WorkerStatus::Idle);
    assert!(worker.current_task.is_none());
}

#[tokio::test]
async fn updates_on_unknown_worker_return_false() {
    let (_store, registry) = registry(Duration::from_secs(30));
    assert!(!registry
        .update_status("ghost", WorkerStatus::Busy, None)
        .await
        .expect("status"));
    assert!(!registry
        .update_health("ghost", WorkerHealth::Crashed)
        .await
        .expect("health"));
}

#[tokio::test]
async fn update_health_is_persisted() {
    let (_store, registry) = registry(Duration::from_secs(30));
    registry
        .register("w1", WorkerInfo::idle("chat-a"))
        .await
        .expect("register");

    assert!(registry
        .update_health("w1", WorkerHealth::Crashed)
        .await
        .expect("health"));
    let crashed = registry.get_crashed_workers().await.expect("crashed");
    assert_eq!(crashed.len(), 1);
}

// ── Shutdown and failures ───────────────────────────────

#[tokio::test]
async fn shutdown_unregisters_own_workers_only() {
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let mine = WorkerRegistry::new(Arc::clone(&store), Duration::from_secs(30));
    let theirs = WorkerRegistry::new(Arc::clone(&store), Duration::from_secs(30));

    mine.register("a", WorkerInfo::idle("c1")).await.expect("register");
    mine.register("b", WorkerInfo::idle("c2")).await.expect("register");
    theirs.register("z", WorkerInfo::idle("c3")).await.expect("register");

    assert_eq!(mine.shutdown().await, 2);
    let remaining = theirs.list_workers().await.expect("list");
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].worker_id, "z");
    assert_eq!(mine.shutdown().await, 0);
}

#[tokio::test]
async fn store_outage_surfaces_as_unavailable() {
    let (store, registry) = registry(Duration::from_secs(30));
    registry
        .register("w1", WorkerInfo::idle("chat-a"))
        .await
        .expect("register");
    store.disconnect();

    assert!(matches!(
        registry.heartbeat("w1").await,
        Err(AppError::Unavailable(_))
    ));
    assert!(matches!(
        registry.list_workers().await,
        Err(AppError::Unavailable(_))
    ));
    assert_eq!(registry.shutdown().await, 0);
}

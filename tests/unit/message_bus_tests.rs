//! Unit tests for the message bus over the in-memory store.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chat_fleet::coordination::{BusMessage, Handler, MessageBus};
use chat_fleet::store::{MemoryStore, PubSub};
use chat_fleet::AppError;
use serde_json::json;

fn bus() -> (Arc<MemoryStore>, MessageBus) {
    let store = Arc::new(MemoryStore::new());
    let bus = MessageBus::new(Arc::clone(&store) as Arc<dyn PubSub>);
    (store, bus)
}

fn recording(sink: &Arc<Mutex<Vec<BusMessage>>>) -> Handler {
    let sink = Arc::clone(sink);
    Arc::new(move |msg: &BusMessage| {
        sink.lock().expect("sink lock").push(msg.clone());
        Ok(())
    })
}

/// Wait until `check` holds or the deadline passes.
async fn eventually(check: impl Fn() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

// ── Delivery ────────────────────────────────────────────

#[tokio::test]
async fn published_message_reaches_handler() {
    let (_store, bus) = bus();
    let sink = Arc::new(Mutex::new(Vec::new()));
    bus.subscribe("fleet:events", recording(&sink))
        .await
        .expect("subscribe");

    let receivers = bus
        .publish("fleet:events", &json!({"kind": "checkpoint", "n": 3}))
        .await
        .expect("publish");
    assert_eq!(receivers, 1);

    assert!(eventually(|| sink.lock().expect("lock").len() == 1).await);
    let received = sink.lock().expect("lock")[0].clone();
    assert_eq!(received.channel, "fleet:events");
    assert_eq!(received.payload["n"], 3);
    assert_eq!(bus.delivered(), 1);
}

#[tokio::test]
async fn glob_pattern_receives_matching_channels() {
    let (_store, bus) = bus();
    let sink = Arc::new(Mutex::new(Vec::new()));
    bus.subscribe("worker:*", recording(&sink))
        .await
        .expect("subscribe");

    bus.publish("worker:crashed", &json!(1)).await.expect("publish");
    bus.publish("lock:released", &json!(2)).await.expect("publish");
    bus.publish("worker:joined", &json!(3)).await.expect("publish");

    assert!(eventually(|| sink.lock().expect("lock").len() == 2).await);
    let channels: Vec<String> = sink
        .lock()
        .expect("lock")
        .iter()
        .map(|m| m.channel.clone())
        .collect();
    assert_eq!(channels, vec!["worker:crashed", "worker:joined"]);
}

#[tokio::test]
async fn handlers_share_one_pattern_subscription() {
    let (_store, bus) = bus();
    let first = Arc::new(Mutex::new(Vec::new()));
    let second = Arc::new(Mutex::new(Vec::new()));
    bus.subscribe("c", recording(&first)).await.expect("subscribe");
    bus.subscribe("c", recording(&second)).await.expect("subscribe");

    assert_eq!(bus.patterns(), vec!["c"]);
    assert_eq!(bus.publish("c", &json!(null)).await.expect("publish"), 1);

    assert!(eventually(|| bus.delivered() == 2).await);
    assert_eq!(first.lock().expect("lock").len(), 1);
    assert_eq!(second.lock().expect("lock").len(), 1);
}

// ── Failure isolation ───────────────────────────────────

#[tokio::test]
async fn failing_and_panicking_handlers_do_not_block_others() {
    let (_store, bus) = bus();
    let sink = Arc::new(Mutex::new(Vec::new()));

    let failing: Handler = Arc::new(|_msg: &BusMessage| {
        Err(AppError::InvalidArgument("rejected".into()))
    });
    let panicking: Handler =
        Arc::new(|_msg: &BusMessage| -> chat_fleet::Result<()> { panic!("handler bug") });

    bus.subscribe("c", failing).await.expect("subscribe");
    bus.subscribe("c", panicking).await.expect("subscribe");
    bus.subscribe("c", recording(&sink)).await.expect("subscribe");

    bus.publish("c", &json!("one")).await.expect("publish");
    bus.publish("c", &json!("two")).await.expect("publish");

    assert!(eventually(|| sink.lock().expect("lock").len() == 2).await);
    assert!(eventually(|| bus.delivery_failures() == 4).await);
    assert_eq!(bus.delivered(), 2);
}

#[tokio::test]
async fn undecodable_payload_counts_as_failure() {
    let (store, bus) = bus();
    let sink = Arc::new(Mutex::new(Vec::new()));
    bus.subscribe("c", recording(&sink)).await.expect("subscribe");

    store.publish("c", "not json").await.expect("raw publish");
    bus.publish("c", &json!({"ok": true})).await.expect("publish");

    assert!(eventually(|| sink.lock().expect("lock").len() == 1).await);
    assert_eq!(bus.delivery_failures(), 1);
}

// ── Subscription lifecycle ──────────────────────────────

#[tokio::test]
async fn unsubscribe_last_handler_closes_pattern() {
    let (_store, bus) = bus();
    let sink = Arc::new(Mutex::new(Vec::new()));
    let a = bus.subscribe("c", recording(&sink)).await.expect("subscribe");
    let b = bus.subscribe("c", recording(&sink)).await.expect("subscribe");

    assert!(bus.unsubscribe(a));
    assert_eq!(bus.patterns(), vec!["c"]);
    assert!(!bus.unsubscribe(a));

    assert!(bus.unsubscribe(b));
    assert!(bus.patterns().is_empty());

    bus.publish("c", &json!(1)).await.expect("publish");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(sink.lock().expect("lock").is_empty());
}

#[tokio::test]
async fn empty_pattern_is_rejected() {
    let (_store, bus) = bus();
    let sink = Arc::new(Mutex::new(Vec::new()));
    let result = bus.subscribe("", recording(&sink)).await;
    assert!(matches!(result, Err(AppError::InvalidArgument(_))));
}

#[tokio::test]
async fn malformed_pattern_is_rejected_before_subscribing() {
    let (_store, bus) = bus();
    let sink = Arc::new(Mutex::new(Vec::new()));
    let result = bus.subscribe("fleet:[events", recording(&sink)).await;
    assert!(matches!(result, Err(AppError::InvalidArgument(_))));
    assert!(bus.patterns().is_empty());
}

#[tokio::test]
async fn single_char_pattern_receives_matching_channels() {
    let (_store, bus) = bus();
    let sink = Arc::new(Mutex::new(Vec::new()));
    bus.subscribe("chat:?", recording(&sink))
        .await
        .expect("subscribe");

    bus.publish("chat:12", &json!(1)).await.expect("publish");
    bus.publish("chat:7", &json!(2)).await.expect("publish");

    assert!(eventually(|| sink.lock().expect("lock").len() == 1).await);
    tokio::time::sleep(Duration::from_millis(30)).await;
    let channels: Vec<String> = sink
        .lock()
        .expect("lock")
        .iter()
        .map(|m| m.channel.clone())
        .collect();
    assert_eq!(channels, vec!["chat:7"]);
}

#[tokio::test]
async fn shutdown_is_idempotent_and_closes_bus() {
    let (_store, bus) = bus();
    let sink = Arc::new(Mutex::new(Vec::new()));
    bus.subscribe("a", recording(&sink)).await.expect("subscribe");
    bus.subscribe("b", recording(&sink)).await.expect("subscribe");

    assert_eq!(bus.shutdown().await, 2);
    assert_eq!(bus.shutdown().await, 0);
    assert!(bus.patterns().is_empty());

    assert!(matches!(
        bus.subscribe("a", recording(&sink)).await,
        Err(AppError::Unavailable(_))
    ));
    assert!(matches!(
        bus.publish("a", &json!(1)).await,
        Err(AppError::Unavailable(_))
    ));
}

#[tokio::test]
async fn store_outage_fails_publish() {
    let (store, bus) = bus();
    store.disconnect();
    assert!(matches!(
        bus.publish("c", &json!(1)).await,
        Err(AppError::Unavailable(_))
    ));
}

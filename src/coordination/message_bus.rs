//! Event bus over the shared store's publish/subscribe channel.
//!
//! Handlers are registered per channel pattern. Each pattern holds one store
//! subscription and one dispatch task that calls every handler of that
//! pattern in turn. A handler returning an error or panicking is counted
//! and logged; delivery continues with the next handler.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::store::{compile_pattern, PubSub, StoreMessage};
use crate::{AppError, Result};

/// A decoded bus message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BusMessage {
    /// Channel it was published on.
    pub channel: String,
    /// JSON payload.
    pub payload: serde_json::Value,
}

/// Message handler. Must not block.
pub type Handler = Arc<dyn Fn(&BusMessage) -> Result<()> + Send + Sync>;

/// Identifies one handler registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct PatternListener {
    handlers: Vec<(SubscriptionId, Handler)>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

type Listeners = Arc<Mutex<HashMap<String, PatternListener>>>;

#[derive(Default)]
struct DeliveryStats {
    delivered: AtomicU64,
    failures: AtomicU64,
}

/// Publish/subscribe bus with per-handler failure isolation.
pub struct MessageBus {
    pubsub: Arc<dyn PubSub>,
    listeners: Listeners,
    stats: Arc<DeliveryStats>,
    next_id: AtomicU64,
    cancel: CancellationToken,
    closed: AtomicBool,
}

fn lock(listeners: &Listeners) -> MutexGuard<'_, HashMap<String, PatternListener>> {
    listeners.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MessageBus {
    /// Create a bus over `pubsub`.
    #[must_use]
    pub fn new(pubsub: Arc<dyn PubSub>) -> Self {
        Self {
            pubsub,
            listeners: Arc::new(Mutex::new(HashMap::new())),
            stats: Arc::new(DeliveryStats::default()),
            next_id: AtomicU64::new(1),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(AppError::Unavailable("message bus is shut down".into()))
        } else {
            Ok(())
        }
    }

    /// Register `handler` for a channel or glob pattern.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidArgument` for an empty or malformed pattern,
    /// and `AppError::Unavailable` after [`shutdown`](Self::shutdown) or
    /// when the store subscription fails.
    pub async fn subscribe(&self, pattern: &str, handler: Handler) -> Result<SubscriptionId> {
        self.ensure_open()?;
        compile_pattern(pattern)?;
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));

        if let Some(listener) = lock(&self.listeners).get_mut(pattern) {
            listener.handlers.push((id, handler));
            debug!(pattern, "handler added to existing subscription");
            return Ok(id);
        }

        let rx = self.pubsub.subscribe(pattern).await?;

        let mut listeners = lock(&self.listeners);
        if let Some(listener) = listeners.get_mut(pattern) {
            // Another caller subscribed the pattern while we awaited; drop our receiver.
            listener.handlers.push((id, handler));
            return Ok(id);
        }

        let cancel = self.cancel.child_token();
        let task = tokio::spawn(
            dispatch_loop(
                pattern.to_owned(),
                rx,
                Arc::clone(&self.listeners),
                Arc::clone(&self.stats),
                cancel.clone(),
            )
            .instrument(info_span!("bus_dispatch", pattern)),
        );
        listeners.insert(
            pattern.to_owned(),
            PatternListener {
                handlers: vec![(id, handler)],
                cancel,
                task: Some(task),
            },
        );
        info!(pattern, "subscribed");
        Ok(id)
    }

    /// Remove one handler. The pattern's store subscription is dropped
    /// with its last handler. Returns `false` for an unknown id.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = lock(&self.listeners);
        let Some(pattern) = listeners
            .iter()
            .find(|(_, listener)| listener.handlers.iter().any(|(hid, _)| *hid == id))
            .map(|(pattern, _)| pattern.clone())
        else {
            return false;
        };

        if let Some(listener) = listeners.get_mut(&pattern) {
            listener.handlers.retain(|(hid, _)| *hid != id);
            if listener.handlers.is_empty() {
                listener.cancel.cancel();
                listeners.remove(&pattern);
                debug!(pattern, "last handler removed, subscription closed");
            }
        }
        true
    }

    /// Publish a JSON payload on `channel`. Returns the number of store
    /// subscriptions reached (any process).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Unavailable` after shutdown or when the store
    /// cannot be reached.
    pub async fn publish(&self, channel: &str, payload: &serde_json::Value) -> Result<usize> {
        self.ensure_open()?;
        let raw = serde_json::to_string(payload)?;
        let receivers = self.pubsub.publish(channel, &raw).await?;
        debug!(channel, receivers, "bus message published");
        Ok(receivers)
    }

    /// Handler invocations that returned `Ok`.
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.stats.delivered.load(Ordering::Relaxed)
    }

    /// Handler invocations that failed, plus undecodable payloads.
    #[must_use]
    pub fn delivery_failures(&self) -> u64 {
        self.stats.failures.load(Ordering::Relaxed)
    }

    /// Patterns with at least one handler.
    #[must_use]
    pub fn patterns(&self) -> Vec<String> {
        let mut patterns: Vec<String> = lock(&self.listeners).keys().cloned().collect();
        patterns.sort();
        patterns
    }

    /// Close every subscription and wait for the dispatch tasks.
    ///
    /// Idempotent. Returns how many subscriptions were closed.
    pub async fn shutdown(&self) -> usize {
        if self.closed.swap(true, Ordering::SeqCst) {
            return 0;
        }
        self.cancel.cancel();

        let tasks: Vec<(String, Option<JoinHandle<()>>)> = lock(&self.listeners)
            .drain()
            .map(|(pattern, mut listener)| (pattern, listener.task.take()))
            .collect();
        let closed = tasks.len();

        for (pattern, task) in tasks {
            if let Some(task) = task {
                if let Err(err) = task.await {
                    warn!(pattern, %err, "dispatch task ended abnormally");
                }
            }
        }

        info!(closed, "message bus shut down");
        closed
    }
}

impl Drop for MessageBus {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn dispatch_loop(
    pattern: String,
    mut rx: mpsc::UnboundedReceiver<StoreMessage>,
    listeners: Listeners,
    stats: Arc<DeliveryStats>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            () = cancel.cancelled() => break,
            message = rx.recv() => message,
        };
        let Some(message) = message else {
            debug!("store subscription closed");
            break;
        };
        deliver(&pattern, message, &listeners, &stats);
    }
}

fn deliver(pattern: &str, message: StoreMessage, listeners: &Listeners, stats: &DeliveryStats) {
    let payload = match serde_json::from_str(&message.payload) {
        Ok(payload) => payload,
        Err(err) => {
            stats.failures.fetch_add(1, Ordering::Relaxed);
            warn!(channel = %message.channel, %err, "undecodable bus payload dropped");
            return;
        }
    };
    let message = BusMessage {
        channel: message.channel,
        payload,
    };

    // Snapshot so handlers run without the registry lock held.
    let handlers: Vec<(SubscriptionId, Handler)> = lock(listeners)
        .get(pattern)
        .map(|listener| listener.handlers.clone())
        .unwrap_or_default();

    for (id, handler) in handlers {
        match catch_unwind(AssertUnwindSafe(|| handler(&message))) {
            Ok(Ok(())) => {
                stats.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(err)) => {
                stats.failures.fetch_add(1, Ordering::Relaxed);
                warn!(channel = %message.channel, subscription = id.0, %err, "handler failed");
            }
            Err(_) => {
                stats.failures.fetch_add(1, Ordering::Relaxed);
                error!(channel = %message.channel, subscription = id.0, "handler panicked");
            }
        }
    }
}

//! Periodic heartbeat driver for one worker.
//!
//! [`HeartbeatTicker::spawn`] starts a background task that calls
//! [`WorkerRegistry::heartbeat`] every interval until stopped. The returned
//! [`HeartbeatHandle`] cancels the task on drop; [`HeartbeatHandle::stop`]
//! cancels and waits, and is a no-op once the ticker has stopped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::worker_registry::WorkerRegistry;

/// Builder for a worker heartbeat task.
pub struct HeartbeatTicker {
    registry: Arc<WorkerRegistry>,
    worker_id: String,
    interval: Duration,
    cancel: CancellationToken,
}

#[derive(Default)]
struct TickCounters {
    beats: AtomicU64,
    failures: AtomicU64,
}

impl HeartbeatTicker {
    /// Construct a ticker (does not start it yet).
    #[must_use]
    pub fn new(
        registry: Arc<WorkerRegistry>,
        worker_id: impl Into<String>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            registry,
            worker_id: worker_id.into(),
            interval,
            cancel,
        }
    }

    /// Spawn the heartbeat loop and return a handle for stopping it.
    #[must_use]
    pub fn spawn(self) -> HeartbeatHandle {
        let counters = Arc::new(TickCounters::default());
        let cancel_for_handle = self.cancel.clone();
        let span = info_span!("heartbeat", worker_id = %self.worker_id);

        let join_handle = tokio::spawn(
            Self::run(
                self.registry,
                self.worker_id.clone(),
                self.interval,
                self.cancel,
                Arc::clone(&counters),
            )
            .instrument(span),
        );

        HeartbeatHandle {
            worker_id: self.worker_id,
            counters,
            join_handle: Some(join_handle),
            cancel: cancel_for_handle,
        }
    }

    async fn run(
        registry: Arc<WorkerRegistry>,
        worker_id: String,
        interval: Duration,
        cancel: CancellationToken,
        counters: Arc<TickCounters>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("heartbeat ticker cancelled");
                    return;
                }
                _ = ticker.tick() => {}
            }

            match registry.heartbeat(&worker_id).await {
                Ok(true) => {
                    counters.beats.fetch_add(1, Ordering::Relaxed);
                }
                Ok(false) => {
                    counters.failures.fetch_add(1, Ordering::Relaxed);
                    warn!("heartbeat skipped: worker not registered");
                }
                Err(err) => {
                    counters.failures.fetch_add(1, Ordering::Relaxed);
                    warn!(%err, "heartbeat failed");
                }
            }
        }
    }
}

/// Handle returned from [`HeartbeatTicker::spawn`].
pub struct HeartbeatHandle {
    worker_id: String,
    counters: Arc<TickCounters>,
    join_handle: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Drop for HeartbeatHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl HeartbeatHandle {
    /// Worker this ticker refreshes.
    #[must_use]
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Successful heartbeats so far.
    #[must_use]
    pub fn beats(&self) -> u64 {
        self.counters.beats.load(Ordering::Relaxed)
    }

    /// Heartbeats that failed or found no registration.
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.counters.failures.load(Ordering::Relaxed)
    }

    /// Whether [`stop`](Self::stop) has completed.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.join_handle.is_none()
    }

    /// Stop the ticker and wait for the task to exit.
    ///
    /// Stopping an already-stopped ticker does nothing.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.join_handle.take() {
            if let Err(err) = handle.await {
                warn!(worker_id = %self.worker_id, %err, "heartbeat task ended abnormally");
            }
            info!(worker_id = %self.worker_id, beats = self.beats(), "heartbeat ticker stopped");
        }
    }
}

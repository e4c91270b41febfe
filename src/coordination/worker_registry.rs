//! Worker liveness registry with lazy, pull-based crash detection.
//!
//! Each worker is one JSON record under `worker:<id>` in the shared store.
//! There is no background sweep: every read compares `last_heartbeat` with
//! the heartbeat timeout and persists a `healthy -> crashed` transition on
//! the spot. Detection latency is therefore bounded by how often some
//! process reads the registry (for the supervisor, its crash-watch poll
//! interval), not by a timer here.
//!
//! Heartbeat, health and status updates are read-modify-write on the
//! record. A worker is the only writer of its own heartbeat, so the race
//! that matters is heartbeat vs. a reader flipping health to crashed; the
//! next heartbeat restores `healthy`.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::models::worker::{Worker, WorkerHealth, WorkerInfo, WorkerStatus};
use crate::store::SharedStore;
use crate::{AppError, Result};

const KEY_PREFIX: &str = "worker:";

/// Registry of fleet workers backed by a [`SharedStore`].
pub struct WorkerRegistry {
    store: Arc<dyn SharedStore>,
    heartbeat_timeout: chrono::Duration,
    /// Workers registered through this instance, for [`shutdown`](Self::shutdown).
    registered: Mutex<HashSet<String>>,
}

fn validate_worker_id(worker_id: &str) -> Result<()> {
    if worker_id.trim().is_empty() {
        return Err(AppError::InvalidArgument(
            "worker id must be a non-empty, non-whitespace string".into(),
        ));
    }
    Ok(())
}

fn key(worker_id: &str) -> String {
    format!("{KEY_PREFIX}{worker_id}")
}

impl WorkerRegistry {
    /// Create a registry classifying workers as crashed after `heartbeat_timeout`.
    #[must_use]
    pub fn new(store: Arc<dyn SharedStore>, heartbeat_timeout: Duration) -> Self {
        Self {
            store,
            heartbeat_timeout: chrono::Duration::from_std(heartbeat_timeout)
                .unwrap_or(chrono::Duration::MAX),
            registered: Mutex::new(HashSet::new()),
        }
    }

    /// Heartbeat gap tolerated before a worker is classified crashed.
    #[must_use]
    pub fn heartbeat_timeout(&self) -> chrono::Duration {
        self.heartbeat_timeout
    }

    fn registered(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.registered.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn read(&self, worker_id: &str) -> Result<Option<Worker>> {
        match self.store.get(&key(worker_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn write(&self, worker: &Worker) -> Result<()> {
        let raw = serde_json::to_string(worker)?;
        self.store.set(&key(&worker.worker_id), &raw, None).await
    }

    /// Apply heartbeat-timeout detection at `now`, persisting a transition.
    async fn detect(&self, mut worker: Worker, now: DateTime<Utc>) -> Result<Worker> {
        if worker.health == WorkerHealth::Healthy
            && worker.heartbeat_expired(now, self.heartbeat_timeout)
        {
            worker.health = WorkerHealth::Crashed;
            self.write(&worker).await?;
            warn!(
                worker_id = %worker.worker_id,
                chat_id = %worker.chat_id,
                last_heartbeat = %worker.last_heartbeat,
                "heartbeat timeout exceeded, worker marked crashed"
            );
        }
        Ok(worker)
    }

    /// Register or refresh a worker.
    ///
    /// Re-registration preserves `registered_at` and refreshes the mutable
    /// fields, the heartbeat and health.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidArgument` for a blank id and
    /// `AppError::Unavailable` if the store is unreachable.
    pub async fn register(&self, worker_id: &str, info: WorkerInfo) -> Result<Worker> {
        validate_worker_id(worker_id)?;
        let span = info_span!("worker_register", worker_id, chat_id = %info.chat_id);
        async {
            let now = Utc::now();
            let registered_at = self
                .read(worker_id)
                .await?
                .map_or(now, |existing| existing.registered_at);

            let worker = Worker {
                worker_id: worker_id.to_owned(),
                chat_id: info.chat_id,
                status: info.status,
                health: WorkerHealth::Healthy,
                registered_at,
                last_heartbeat: now,
                current_task: info.current_task,
            };
            self.write(&worker).await?;
            self.registered().insert(worker_id.to_owned());

            info!("worker registered");
            Ok::<_, AppError>(worker)
        }
        .instrument(span)
        .await
    }

    /// Remove a worker record. Returns `false` if it did not exist.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Unavailable` if the store is unreachable.
    pub async fn unregister(&self, worker_id: &str) -> Result<bool> {
        validate_worker_id(worker_id)?;
        let removed = self.store.delete(&key(worker_id)).await?;
        self.registered().remove(worker_id);
        if removed {
            info!(worker_id, "worker unregistered");
        }
        Ok(removed)
    }

    /// Refresh the heartbeat of `worker_id`.
    ///
    /// A no-op returning `false` if the worker is not registered. A worker
    /// previously classified crashed becomes healthy again.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Unavailable` if the store is unreachable.
    pub async fn heartbeat(&self, worker_id: &str) -> Result<bool> {
        validate_worker_id(worker_id)?;
        let Some(mut worker) = self.read(worker_id).await? else {
            debug!(worker_id, "heartbeat for unknown worker ignored");
            return Ok(false);
        };

        worker.last_heartbeat = worker.last_heartbeat.max(Utc::now());
        if worker.health == WorkerHealth::Crashed {
            info!(worker_id, "worker recovered after missed heartbeats");
            worker.health = WorkerHealth::Healthy;
            if worker.status == WorkerStatus::Crashed {
                worker.status = WorkerStatus::Idle;
            }
        }
        self.write(&worker).await?;
        Ok(true)
    }

    /// Look up one worker, applying crash detection.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Unavailable` if the store is unreachable.
    pub async fn get_worker(&self, worker_id: &str) -> Result<Option<Worker>> {
        validate_worker_id(worker_id)?;
        match self.read(worker_id).await? {
            Some(worker) => Ok(Some(self.detect(worker, Utc::now()).await?)),
            None => Ok(None),
        }
    }

    /// Every registered worker ordered by id, applying crash detection.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Unavailable` if the store is unreachable.
    pub async fn list_workers(&self) -> Result<Vec<Worker>> {
        let now = Utc::now();
        let keys = self.store.keys_with_prefix(KEY_PREFIX).await?;
        let mut workers = Vec::with_capacity(keys.len());

        for key in keys {
            // Unregistered between the listing and the read.
            let Some(raw) = self.store.get(&key).await? else {
                continue;
            };
            let worker: Worker = serde_json::from_str(&raw)?;
            workers.push(self.detect(worker, now).await?);
        }
        Ok(workers)
    }

    /// Workers whose heartbeat gap exceeds the timeout.
    ///
    /// Newly detected workers are marked crashed as a side effect.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Unavailable` if the store is unreachable.
    pub async fn get_crashed_workers(&self) -> Result<Vec<Worker>> {
        let crashed: Vec<Worker> = self
            .list_workers()
            .instrument(info_span!("worker_crash_scan"))
            .await?
            .into_iter()
            .filter(|worker| worker.health == WorkerHealth::Crashed)
            .collect();

        if !crashed.is_empty() {
            debug!(count = crashed.len(), "crashed workers found");
        }
        Ok(crashed)
    }

    /// Set the health of `worker_id`. Returns `false` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Unavailable` if the store is unreachable.
    pub async fn update_health(&self, worker_id: &str, health: WorkerHealth) -> Result<bool> {
        validate_worker_id(worker_id)?;
        let Some(mut worker) = self.read(worker_id).await? else {
            return Ok(false);
        };
        worker.health = health;
        self.write(&worker).await?;
        debug!(worker_id, ?health, "worker health updated");
        Ok(true)
    }

    /// Set the status of `worker_id`, attaching `task` when given.
    ///
    /// Moving to `Idle` without a task clears the current task; other
    /// statuses keep it. Returns `false` if the worker does not exist.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Unavailable` if the store is unreachable.
    pub async fn update_status(
        &self,
        worker_id: &str,
        status: WorkerStatus,
        task: Option<String>,
    ) -> Result<bool> {
        validate_worker_id(worker_id)?;
        let Some(mut worker) = self.read(worker_id).await? else {
            return Ok(false);
        };

        worker.status = status;
        match task {
            Some(task) => worker.current_task = Some(task),
            None if status == WorkerStatus::Idle => worker.current_task = None,
            None => {}
        }
        self.write(&worker).await?;
        debug!(worker_id, ?status, task = ?worker.current_task, "worker status updated");
        Ok(true)
    }

    /// Unregister every worker registered through this instance.
    ///
    /// Best-effort: failures are logged and the rest still attempted.
    /// Returns how many records were removed.
    pub async fn shutdown(&self) -> usize {
        let ids: Vec<String> = self.registered().drain().collect();
        let mut removed = 0;

        for worker_id in ids {
            match self.store.delete(&key(&worker_id)).await {
                Ok(true) => removed += 1,
                Ok(false) => debug!(worker_id, "worker already unregistered"),
                Err(err) => warn!(worker_id, %err, "failed to unregister worker"),
            }
        }

        info!(removed, "worker registry shut down");
        removed
    }
}

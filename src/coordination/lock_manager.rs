//! Distributed exclusive locks with owner tokens and TTL expiry.
//!
//! A lock is a single shared-store key (`<prefix><resource>`) whose value is
//! a fresh random owner token. Acquisition is one atomic set-if-absent;
//! release and extension are compare-and-delete / compare-and-expire on the
//! token, so a caller whose lock expired and was re-acquired elsewhere can
//! neither release nor extend the new owner's lock.
//!
//! Expiry is the store's TTL. The only timer here is the retry delay while
//! waiting for a contended lock, bounded by a deadline measured from the
//! first attempt.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::LockConfig;
use crate::models::lock::Lock;
use crate::store::SharedStore;
use crate::{AppError, Result};

/// Options for [`LockManager::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquireOptions {
    /// Expiry of the lock once acquired.
    pub ttl: Duration,
    /// How long to keep retrying; zero means a single attempt.
    pub timeout: Duration,
    /// Pause between attempts.
    pub retry_delay: Duration,
}

impl Default for AcquireOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            timeout: Duration::ZERO,
            retry_delay: Duration::from_millis(50),
        }
    }
}

impl AcquireOptions {
    /// Defaults taken from configuration.
    #[must_use]
    pub fn from_config(config: &LockConfig) -> Self {
        Self {
            ttl: Duration::from_secs(config.default_ttl_seconds),
            timeout: Duration::ZERO,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
        }
    }

    /// Override the TTL.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Override the acquisition timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Override the retry delay.
    #[must_use]
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }
}

/// Distributed lock primitive over a [`SharedStore`].
pub struct LockManager {
    store: Arc<dyn SharedStore>,
    key_prefix: String,
    /// Locks acquired through this instance, for [`release_all`](Self::release_all).
    held: Mutex<HashMap<String, Lock>>,
}

fn validate_resource(resource: &str) -> Result<()> {
    if resource.trim().is_empty() {
        return Err(AppError::InvalidArgument(
            "lock resource must be a non-empty, non-whitespace string".into(),
        ));
    }
    Ok(())
}

impl LockManager {
    /// Create a manager using the `lock:` key namespace.
    #[must_use]
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self::with_prefix(store, "lock:")
    }

    /// Create a manager with a custom key namespace.
    #[must_use]
    pub fn with_prefix(store: Arc<dyn SharedStore>, key_prefix: impl Into<String>) -> Self {
        Self {
            store,
            key_prefix: key_prefix.into(),
            held: Mutex::new(HashMap::new()),
        }
    }

    fn key(&self, resource: &str) -> String {
        format!("{}{resource}", self.key_prefix)
    }

    fn held(&self) -> std::sync::MutexGuard<'_, HashMap<String, Lock>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Try to acquire `resource`, retrying until `options.timeout` elapses.
    ///
    /// Returns the owner token on success and `None` on contention or
    /// timeout.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidArgument` for a blank resource (before any
    /// store access) and `AppError::Unavailable` if the store is unreachable.
    pub async fn acquire(&self, resource: &str, options: AcquireOptions) -> Result<Option<String>> {
        validate_resource(resource)?;
        let span = info_span!("lock_acquire", resource, ttl_secs = options.ttl.as_secs_f64());
        self.acquire_with_retry(resource, options)
            .instrument(span)
            .await
    }

    async fn acquire_with_retry(
        &self,
        resource: &str,
        options: AcquireOptions,
    ) -> Result<Option<String>> {
        let key = self.key(resource);
        let token = Uuid::new_v4().to_string();
        let deadline = Instant::now() + options.timeout;
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            if self.store.set_if_absent(&key, &token, options.ttl).await? {
                self.held().insert(
                    resource.to_owned(),
                    Lock {
                        resource: resource.to_owned(),
                        owner_token: token.clone(),
                        acquired_at: Utc::now(),
                        ttl: options.ttl,
                    },
                );
                info!(attempts, "lock acquired");
                return Ok(Some(token));
            }

            let now = Instant::now();
            if options.timeout.is_zero() || now >= deadline {
                debug!(attempts, "lock not acquired");
                return Ok(None);
            }
            tokio::time::sleep(options.retry_delay.min(deadline - now)).await;
        }
    }

    /// Release `resource` if `token` still owns it.
    ///
    /// Returns `false`, leaving any lock untouched, when the token does not
    /// match or the lock is gone.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidArgument` for a blank resource and
    /// `AppError::Unavailable` if the store is unreachable.
    pub async fn release(&self, resource: &str, token: &str) -> Result<bool> {
        validate_resource(resource)?;
        let released = self
            .store
            .compare_and_delete(&self.key(resource), token)
            .await?;

        {
            let mut held = self.held();
            if held
                .get(resource)
                .is_some_and(|lock| lock.owner_token == token)
            {
                held.remove(resource);
            }
        }

        if released {
            info!(resource, "lock released");
        } else {
            debug!(resource, "release refused: token mismatch or lock expired");
        }
        Ok(released)
    }

    /// Reset the expiry of `resource` to `now + ttl` if `token` still owns it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidArgument` for a blank resource and
    /// `AppError::Unavailable` if the store is unreachable.
    pub async fn extend(&self, resource: &str, token: &str, ttl: Duration) -> Result<bool> {
        validate_resource(resource)?;
        let extended = self
            .store
            .compare_and_expire(&self.key(resource), token, ttl)
            .await?;

        if extended {
            if let Some(lock) = self.held().get_mut(resource) {
                if lock.owner_token == token {
                    lock.acquired_at = Utc::now();
                    lock.ttl = ttl;
                }
            }
            debug!(resource, ttl_secs = ttl.as_secs_f64(), "lock extended");
        }
        Ok(extended)
    }

    /// Whether any owner currently holds `resource`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidArgument` for a blank resource and
    /// `AppError::Unavailable` if the store is unreachable.
    pub async fn is_held(&self, resource: &str) -> Result<bool> {
        Ok(self.get_owner(resource).await?.is_some())
    }

    /// Current owner token of `resource`, if held.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidArgument` for a blank resource and
    /// `AppError::Unavailable` if the store is unreachable.
    pub async fn get_owner(&self, resource: &str) -> Result<Option<String>> {
        validate_resource(resource)?;
        self.store.get(&self.key(resource)).await
    }

    /// Locks acquired through this instance and not yet released.
    #[must_use]
    pub fn held_locks(&self) -> Vec<Lock> {
        let mut locks: Vec<Lock> = self.held().values().cloned().collect();
        locks.sort_by(|a, b| a.resource.cmp(&b.resource));
        locks
    }

    /// Release every lock acquired through this instance.
    ///
    /// Best-effort: a failed release is logged and the remaining locks are
    /// still attempted. Returns how many were actually released.
    pub async fn release_all(&self) -> usize {
        let locks: Vec<Lock> = self.held().drain().map(|(_, lock)| lock).collect();
        let mut released = 0;

        for lock in locks {
            match self
                .store
                .compare_and_delete(&self.key(&lock.resource), &lock.owner_token)
                .await
            {
                Ok(true) => released += 1,
                Ok(false) => debug!(resource = %lock.resource, "lock already expired or taken"),
                Err(err) => warn!(resource = %lock.resource, %err, "failed to release lock"),
            }
        }

        info!(released, "released all held locks");
        released
    }

    /// Run `f` while holding `resource`.
    ///
    /// Returns `Ok(None)` without running `f` if the lock was not acquired.
    /// A failure to release afterwards is logged; the lock then lapses by TTL.
    ///
    /// # Errors
    ///
    /// Propagates acquisition errors.
    pub async fn with_lock<F, Fut, T>(
        &self,
        resource: &str,
        options: AcquireOptions,
        f: F,
    ) -> Result<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let Some(token) = self.acquire(resource, options).await? else {
            return Ok(None);
        };

        let output = f().await;

        if let Err(err) = self.release(resource, &token).await {
            warn!(resource, %err, "failed to release lock after critical section");
        }
        Ok(Some(output))
    }
}

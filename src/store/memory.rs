//! In-process shared store.
//!
//! Backs single-process deployments and tests. Entries expire lazily: an
//! expired entry is treated as absent by every operation and swept the next
//! time its key is touched. No internal lock is held across an `.await`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use super::{compile_pattern, PubSub, SharedStore, StoreFuture, StoreMessage};
use crate::{AppError, Result};

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

struct Subscription {
    pattern: String,
    matcher: glob::Pattern,
    tx: mpsc::UnboundedSender<StoreMessage>,
}

/// In-memory [`SharedStore`] and [`PubSub`] implementation.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    subscriptions: Mutex<Vec<Subscription>>,
    disconnected: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate connection loss: every operation fails with `Unavailable`.
    pub fn disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }

    /// Restore the connection after [`disconnect`](Self::disconnect).
    pub fn reconnect(&self) {
        self.disconnected.store(false, Ordering::SeqCst);
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.disconnected.load(Ordering::SeqCst) {
            Err(AppError::Unavailable("memory store disconnected".into()))
        } else {
            Ok(())
        }
    }

    fn entries(&self) -> Result<MutexGuard<'_, HashMap<String, Entry>>> {
        self.ensure_connected()?;
        self.entries
            .lock()
            .map_err(|_| AppError::Unavailable("memory store poisoned".into()))
    }

    /// Remove `key` if expired and return whether a live entry remains.
    fn sweep(map: &mut HashMap<String, Entry>, key: &str, now: Instant) -> bool {
        match map.get(key) {
            Some(entry) if entry.is_live(now) => true,
            Some(_) => {
                map.remove(key);
                false
            }
            None => false,
        }
    }

    fn set_if_absent_sync(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut map = self.entries()?;
        let now = Instant::now();
        if Self::sweep(&mut map, key, now) {
            return Ok(false);
        }
        map.insert(
            key.to_owned(),
            Entry {
                value: value.to_owned(),
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }

    fn compare_and_delete_sync(&self, key: &str, expected: &str) -> Result<bool> {
        let mut map = self.entries()?;
        let now = Instant::now();
        if !Self::sweep(&mut map, key, now) {
            return Ok(false);
        }
        if map.get(key).is_some_and(|entry| entry.value == expected) {
            map.remove(key);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn compare_and_expire_sync(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool> {
        let mut map = self.entries()?;
        let now = Instant::now();
        if !Self::sweep(&mut map, key, now) {
            return Ok(false);
        }
        match map.get_mut(key) {
            Some(entry) if entry.value == expected => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn get_sync(&self, key: &str) -> Result<Option<String>> {
        let mut map = self.entries()?;
        if Self::sweep(&mut map, key, Instant::now()) {
            Ok(map.get(key).map(|entry| entry.value.clone()))
        } else {
            Ok(None)
        }
    }

    fn set_sync(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut map = self.entries()?;
        let now = Instant::now();
        map.insert(
            key.to_owned(),
            Entry {
                value: value.to_owned(),
                expires_at: ttl.map(|ttl| now + ttl),
            },
        );
        Ok(())
    }

    fn delete_sync(&self, key: &str) -> Result<bool> {
        let mut map = self.entries()?;
        let live = Self::sweep(&mut map, key, Instant::now());
        map.remove(key);
        Ok(live)
    }

    fn keys_with_prefix_sync(&self, prefix: &str) -> Result<Vec<String>> {
        let mut map = self.entries()?;
        let now = Instant::now();
        map.retain(|_, entry| entry.is_live(now));
        let mut keys: Vec<String> = map
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn publish_sync(&self, channel: &str, payload: &str) -> Result<usize> {
        self.ensure_connected()?;
        let mut subs = self
            .subscriptions
            .lock()
            .map_err(|_| AppError::Unavailable("memory store poisoned".into()))?;

        // Closed receivers mean the subscriber went away.
        subs.retain(|sub| !sub.tx.is_closed());

        let mut delivered = 0;
        for sub in subs.iter() {
            if sub.matcher.matches(channel) {
                let message = StoreMessage {
                    channel: channel.to_owned(),
                    pattern: sub.pattern.clone(),
                    payload: payload.to_owned(),
                };
                if sub.tx.send(message).is_ok() {
                    delivered += 1;
                }
            }
        }
        debug!(channel, delivered, "published");
        Ok(delivered)
    }

    fn subscribe_sync(&self, pattern: &str) -> Result<mpsc::UnboundedReceiver<StoreMessage>> {
        self.ensure_connected()?;
        let matcher = compile_pattern(pattern)?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscriptions
            .lock()
            .map_err(|_| AppError::Unavailable("memory store poisoned".into()))?
            .push(Subscription {
                pattern: pattern.to_owned(),
                matcher,
                tx,
            });
        Ok(rx)
    }
}

impl SharedStore for MemoryStore {
    fn set_if_absent<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Duration,
    ) -> StoreFuture<'a, bool> {
        Box::pin(async move { self.set_if_absent_sync(key, value, ttl) })
    }

    fn compare_and_delete<'a>(&'a self, key: &'a str, expected: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move { self.compare_and_delete_sync(key, expected) })
    }

    fn compare_and_expire<'a>(
        &'a self,
        key: &'a str,
        expected: &'a str,
        ttl: Duration,
    ) -> StoreFuture<'a, bool> {
        Box::pin(async move { self.compare_and_expire_sync(key, expected, ttl) })
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>> {
        Box::pin(async move { self.get_sync(key) })
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Option<Duration>,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move { self.set_sync(key, value, ttl) })
    }

    fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move { self.delete_sync(key) })
    }

    fn keys_with_prefix<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, Vec<String>> {
        Box::pin(async move { self.keys_with_prefix_sync(prefix) })
    }
}

impl PubSub for MemoryStore {
    fn publish<'a>(&'a self, channel: &'a str, payload: &'a str) -> StoreFuture<'a, usize> {
        Box::pin(async move { self.publish_sync(channel, payload) })
    }

    fn subscribe<'a>(
        &'a self,
        pattern: &'a str,
    ) -> StoreFuture<'a, mpsc::UnboundedReceiver<StoreMessage>> {
        Box::pin(async move { self.subscribe_sync(pattern) })
    }
}

//! Shared key-value store abstraction.
//!
//! Every coordination primitive is built on [`SharedStore`]: a networked
//! key-value store offering atomic set-if-absent, compare-and-delete,
//! compare-and-extend and key expiration. Atomicity is the store's job;
//! callers never coordinate among themselves.
//!
//! [`PubSub`] is the broadcast side used by the message bus. Delivery is
//! per-message to every matching subscriber, not exactly-once.

pub mod memory;
pub mod sqlite;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::{AppError, Result};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Boxed future returned by store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Atomic key-value operations with TTL.
///
/// Connection failures surface as
/// [`AppError::Unavailable`](crate::AppError::Unavailable); they are never
/// folded into a `false`/`None` result.
pub trait SharedStore: Send + Sync {
    /// Set `key` to `value` with `ttl` only if no live entry exists.
    ///
    /// Returns `true` when this call created the entry.
    fn set_if_absent<'a>(&'a self, key: &'a str, value: &'a str, ttl: Duration)
        -> StoreFuture<'a, bool>;

    /// Delete `key` only if its live value equals `expected`.
    fn compare_and_delete<'a>(&'a self, key: &'a str, expected: &'a str) -> StoreFuture<'a, bool>;

    /// Reset the TTL of `key` to `ttl` only if its live value equals `expected`.
    fn compare_and_expire<'a>(
        &'a self,
        key: &'a str,
        expected: &'a str,
        ttl: Duration,
    ) -> StoreFuture<'a, bool>;

    /// Read the live value of `key`.
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>>;

    /// Unconditionally write `key`, optionally expiring after `ttl`.
    fn set<'a>(&'a self, key: &'a str, value: &'a str, ttl: Option<Duration>)
        -> StoreFuture<'a, ()>;

    /// Delete `key`. Returns `true` if a live entry was removed.
    fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool>;

    /// List live keys starting with `prefix`, sorted.
    fn keys_with_prefix<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, Vec<String>>;
}

/// A message received from a channel subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreMessage {
    /// Concrete channel the message was published on.
    pub channel: String,
    /// Pattern of the subscription that matched.
    pub pattern: String,
    /// Raw payload.
    pub payload: String,
}

/// Publish/subscribe side of the shared store.
pub trait PubSub: Send + Sync {
    /// Publish `payload` on `channel`. Returns the number of subscriptions reached.
    fn publish<'a>(&'a self, channel: &'a str, payload: &'a str) -> StoreFuture<'a, usize>;

    /// Subscribe to a channel or glob pattern (see [`compile_pattern`]).
    ///
    /// Dropping the receiver unsubscribes. A malformed pattern fails with
    /// [`AppError::InvalidArgument`](crate::AppError::InvalidArgument).
    fn subscribe<'a>(
        &'a self,
        pattern: &'a str,
    ) -> StoreFuture<'a, mpsc::UnboundedReceiver<StoreMessage>>;
}

/// Compile a subscription pattern.
///
/// Patterns use glob syntax: `*` spans any run of characters, `?` matches
/// one character and `[..]` a character class. A pattern without
/// metacharacters only matches the identical channel.
///
/// # Errors
///
/// Returns `AppError::InvalidArgument` for an empty or malformed pattern.
pub fn compile_pattern(pattern: &str) -> Result<glob::Pattern> {
    if pattern.is_empty() {
        return Err(AppError::InvalidArgument(
            "subscription pattern must not be empty".into(),
        ));
    }
    glob::Pattern::new(pattern)
        .map_err(|err| AppError::InvalidArgument(format!("invalid pattern {pattern:?}: {err}")))
}

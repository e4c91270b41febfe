//! Fleet coordination primitives built on the shared store.
//!
//! Covers distributed locking, worker liveness tracking, periodic
//! heartbeats and the pub/sub event bus.

pub mod heartbeat;
pub mod lock_manager;
pub mod message_bus;
pub mod worker_registry;

pub use heartbeat::{HeartbeatHandle, HeartbeatTicker};
pub use lock_manager::{AcquireOptions, LockManager};
pub use message_bus::{BusMessage, Handler, MessageBus, SubscriptionId};
pub use worker_registry::WorkerRegistry;

//! Parallel Watcher - distributed scatter-gather completion tracking
//!
//! Workers in any process report partial results of a fan-out job into a
//! shared key-value store; a watcher loop notices when every expected part of
//! a group has arrived and calls the handlers registered for its type.
//!
//! - Group lifecycle (create, confirm, expire, complete, reap) in the store
//! - Polling watcher with per-group error isolation
//! - Local handler registry keyed by group type

pub mod config;
pub mod error;
pub mod group;
pub mod metrics;
pub mod registry;
pub mod storage;
pub mod tracker;
pub mod watcher;

pub use config::{DispatchMode, WatcherConfig};
pub use error::{Result, WatcherError};
pub use group::{GroupState, GroupStore, TaskResult};
pub use registry::{CallbackRegistry, HandlerId, HandlerResult};
pub use storage::{KvStore, MemoryStore, RedisStore};
pub use tracker::Tracker;
pub use watcher::{ShutdownSignal, TickSummary, Watcher, WatcherHandle};

/// Default namespace for group keys
pub const DEFAULT_KEY_PREFIX: &str = "parallel-watcher";

/// Default delay between watcher ticks in milliseconds
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

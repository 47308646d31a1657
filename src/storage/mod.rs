//! Shared key-value store adapters
//!
//! The tracker keeps no state of its own: every group lives in a hash record
//! of the shared store, and everything it needs from the store is the small
//! contract in [`KvStore`].

pub mod memory;
pub mod redis;
pub mod resp;

pub use memory::MemoryStore;
pub use redis::{RedisStore, StoreUrl};

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

use crate::error::Result;

/// Operations the tracker needs from the shared store
///
/// Implementations must be usable from many tasks at once; the store itself
/// is the only synchronization point between producers, reporters and
/// watchers.
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    /// Set fields of the hash at `key` in one step, creating the hash if needed
    async fn hset(&self, key: &str, fields: &[(&str, &str)]) -> Result<()>;

    /// Set a field only if it is absent. Returns true if the value was written.
    async fn hset_nx(&self, key: &str, field: &str, value: &str) -> Result<bool>;

    /// Remove one field. Returns true if this call removed an existing field.
    async fn hdel(&self, key: &str, field: &str) -> Result<bool>;

    /// Read every field of the hash at `key` (empty if the key does not exist)
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;

    /// Expire `key` after `ttl`. Returns false if the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Remaining time to live, `None` if the key is missing or never expires
    async fn ttl(&self, key: &str) -> Result<Option<Duration>>;

    /// Delete `key`. Returns true if this call removed an existing key.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// List every live key starting with `prefix`
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;
}

#[async_trait]
impl<T: KvStore + ?Sized> KvStore for std::sync::Arc<T> {
    async fn hset(&self, key: &str, fields: &[(&str, &str)]) -> Result<()> {
        (**self).hset(key, fields).await
    }

    async fn hset_nx(&self, key: &str, field: &str, value: &str) -> Result<bool> {
        (**self).hset_nx(key, field, value).await
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool> {
        (**self).hdel(key, field).await
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        (**self).hgetall(key).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        (**self).expire(key, ttl).await
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        (**self).ttl(key).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        (**self).delete(key).await
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        (**self).keys_with_prefix(prefix).await
    }
}

//! In-process store
//!
//! Hash records with lazy expiry, for tests and single-process embedding.
//! Expiry uses the tokio clock so paused-time tests can step over TTLs.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::KvStore;
use crate::error::Result;

#[derive(Debug, Default)]
struct Record {
    fields: HashMap<String, String>,
    expires_at: Option<Instant>,
}

impl Record {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-memory hash store shared between clones
#[derive(Clone, Default)]
pub struct MemoryStore {
    records: Arc<Mutex<HashMap<String, Record>>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.records
            .lock()
            .values()
            .filter(|r| !r.is_expired(now))
            .count()
    }

    /// True if no live keys remain
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `key` currently exists
    pub fn contains_key(&self, key: &str) -> bool {
        let now = Instant::now();
        self.records
            .lock()
            .get(key)
            .is_some_and(|r| !r.is_expired(now))
    }

    /// Drop expired records
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|_, r| !r.is_expired(now));
        before - records.len()
    }

    fn with_live<R>(&self, key: &str, f: impl FnOnce(Option<&mut Record>) -> R) -> R {
        let now = Instant::now();
        let mut records = self.records.lock();
        if records.get(key).is_some_and(|r| r.is_expired(now)) {
            records.remove(key);
        }
        f(records.get_mut(key))
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn hset(&self, key: &str, fields: &[(&str, &str)]) -> Result<()> {
        let now = Instant::now();
        let mut records = self.records.lock();
        let record = records.entry(key.to_string()).or_default();
        if record.is_expired(now) {
            *record = Record::default();
        }
        for (field, value) in fields {
            record.fields.insert(field.to_string(), value.to_string());
        }
        Ok(())
    }

    async fn hset_nx(&self, key: &str, field: &str, value: &str) -> Result<bool> {
        let now = Instant::now();
        let mut records = self.records.lock();
        let record = records.entry(key.to_string()).or_default();
        if record.is_expired(now) {
            *record = Record::default();
        }
        if record.fields.contains_key(field) {
            return Ok(false);
        }
        record.fields.insert(field.to_string(), value.to_string());
        Ok(true)
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool> {
        let now = Instant::now();
        let mut records = self.records.lock();
        let Some(record) = records.get_mut(key) else {
            return Ok(false);
        };
        if record.is_expired(now) {
            records.remove(key);
            return Ok(false);
        }
        let removed = record.fields.remove(field).is_some();
        // Like Redis, a hash with no fields left stops existing.
        if record.fields.is_empty() {
            records.remove(key);
        }
        Ok(removed)
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        Ok(self.with_live(key, |r| r.map(|r| r.fields.clone()).unwrap_or_default()))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        Ok(self.with_live(key, |r| match r {
            Some(record) => {
                record.expires_at = Some(Instant::now() + ttl);
                true
            }
            None => false,
        }))
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let now = Instant::now();
        Ok(self.with_live(key, |r| {
            r.and_then(|r| r.expires_at)
                .map(|at| at.saturating_duration_since(now))
        }))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let now = Instant::now();
        Ok(self
            .records
            .lock()
            .remove(key)
            .is_some_and(|r| !r.is_expired(now)))
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let now = Instant::now();
        let mut records = self.records.lock();
        records.retain(|_, r| !r.is_expired(now));
        Ok(records
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

//! Group store
//!
//! Maps group operations onto the shared store: one hash record per live
//! group at `<prefix>:<group_id>`, holding `count`, `type` and one field per
//! confirmed task. The record expires `ttl` after creation; confirmations
//! never refresh it.

pub mod record;

pub use record::{
    decode, is_reserved, CompletedGroup, GroupState, TaskResult, FIELD_COUNT, FIELD_TYPE,
};

use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, WatcherError};
use crate::storage::KvStore;

/// Group operations over a shared store
pub struct GroupStore<S> {
    store: S,
    prefix: String,
}

impl<S: KvStore> GroupStore<S> {
    /// Create a group store rooted at `prefix`
    pub fn new(store: S, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    /// Namespaced store key for a group
    pub fn key(&self, group_id: &str) -> String {
        format!("{}:{}", self.prefix, group_id)
    }

    /// Group id of a namespaced key, if the key belongs to this namespace
    pub fn group_id_from_key<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(self.prefix.as_str())?
            .strip_prefix(':')
            .filter(|id| !id.is_empty())
    }

    /// Key namespace
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Underlying store
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Start a new group expecting `count` results, expiring after `ttl`
    pub async fn create(&self, group_type: &str, count: u64, ttl: Duration) -> Result<String> {
        if group_type.is_empty() {
            return Err(WatcherError::InvalidGroup {
                reason: "type must not be empty".into(),
            });
        }
        if count == 0 {
            return Err(WatcherError::InvalidGroup {
                reason: "count must be positive".into(),
            });
        }
        if ttl.as_secs() == 0 {
            return Err(WatcherError::InvalidGroup {
                reason: "ttl must be at least one second".into(),
            });
        }

        let group_id = Uuid::new_v4().to_string();
        let key = self.key(&group_id);
        let count = count.to_string();

        // Both reserved fields land in one write so a watcher never sees
        // half a group and reaps it as corrupt.
        self.store
            .hset(&key, &[(FIELD_COUNT, count.as_str()), (FIELD_TYPE, group_type)])
            .await?;

        // A record without expiry could sit pending forever; never leave one.
        let expired = self.store.expire(&key, ttl).await;
        if !matches!(expired, Ok(true)) {
            if let Err(e) = self.store.delete(&key).await {
                warn!("Failed to remove group {} after expiry was not set: {}", group_id, e);
            }
            return Err(match expired {
                Err(e) => e,
                Ok(_) => WatcherError::Store {
                    message: format!("group {} vanished before its expiry was set", group_id),
                },
            });
        }

        info!(
            "Created group {} type={} count={} ttl={:?}",
            group_id, group_type, count, ttl
        );
        Ok(group_id)
    }

    /// Record one task result. The first write for a task id wins.
    ///
    /// Returns true if this call stored the result. A confirmation against a
    /// group that has already been reaped is not detected.
    pub async fn confirm(
        &self,
        group_id: &str,
        task_id: Option<&str>,
        result: &str,
    ) -> Result<bool> {
        let task_id = match task_id {
            Some(id) if is_reserved(id) => {
                warn!("Rejected confirmation for group {} with reserved task id {:?}", group_id, id);
                return Err(WatcherError::ReservedTaskId {
                    task_id: id.to_string(),
                });
            }
            Some(id) => id.to_string(),
            None => Uuid::new_v4().to_string(),
        };

        let written = self
            .store
            .hset_nx(&self.key(group_id), &task_id, result)
            .await?;

        if written {
            debug!("Confirmed task {} in group {}", task_id, group_id);
        } else {
            debug!("Ignored duplicate confirmation of task {} in group {}", task_id, group_id);
        }
        Ok(written)
    }

    /// Every live key in this namespace
    pub async fn list_group_keys(&self) -> Result<Vec<String>> {
        let prefix = format!("{}:", self.prefix);
        self.store.keys_with_prefix(&prefix).await
    }

    /// Raw fields of a group record
    pub async fn read_all(&self, group_id: &str) -> Result<HashMap<String, String>> {
        self.store.hgetall(&self.key(group_id)).await
    }

    /// Read and classify a group record
    pub async fn load(&self, group_id: &str) -> Result<GroupState> {
        Ok(decode(group_id, self.read_all(group_id).await?))
    }

    /// Take ownership of a completed group by removing its `count` field
    ///
    /// Returns true for exactly one caller. A record recreated by a late
    /// confirmation has no `count`, so a watcher holding an older snapshot
    /// can never claim it.
    pub async fn claim(&self, group_id: &str) -> Result<bool> {
        self.store.hdel(&self.key(group_id), FIELD_COUNT).await
    }

    /// Remove a group record. Returns true if this call removed it.
    pub async fn delete(&self, group_id: &str) -> Result<bool> {
        self.store.delete(&self.key(group_id)).await
    }

    /// Remaining time before the store expires the group
    pub async fn ttl(&self, group_id: &str) -> Result<Option<Duration>> {
        self.store.ttl(&self.key(group_id)).await
    }
}

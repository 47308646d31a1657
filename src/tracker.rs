//! Completion tracker
//!
//! The entry point for producers, reporters and observers. Each tracker owns
//! its store handle, configuration, handler registry and metrics; several
//! independent trackers can live in one process.

use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::config::WatcherConfig;
use crate::error::Result;
use crate::group::{GroupStore, TaskResult};
use crate::metrics::WatcherMetrics;
use crate::registry::{CallbackRegistry, HandlerId, HandlerResult};
use crate::storage::{KvStore, RedisStore};
use crate::watcher::{TickSummary, Watcher, WatcherHandle};

/// Scatter-gather completion tracker over a shared store
pub struct Tracker<S> {
    config: WatcherConfig,
    groups: Arc<GroupStore<S>>,
    registry: Arc<CallbackRegistry>,
    metrics: Arc<WatcherMetrics>,
}

impl<S> Clone for Tracker<S> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            groups: self.groups.clone(),
            registry: self.registry.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

impl Tracker<RedisStore> {
    /// Validate `config` and connect to the store it names
    pub async fn connect(config: WatcherConfig) -> Result<Self> {
        config.validate()?;
        let store = RedisStore::connect(&config.store_url, config.io_timeout()).await?;
        Self::with_store(store, config)
    }
}

impl<S: KvStore> Tracker<S> {
    /// Build a tracker over an already-connected store
    pub fn with_store(store: S, config: WatcherConfig) -> Result<Self> {
        config.validate()?;
        let groups = GroupStore::new(store, config.key_prefix.clone());
        Ok(Self {
            config,
            groups: Arc::new(groups),
            registry: Arc::new(CallbackRegistry::new()),
            metrics: Arc::new(WatcherMetrics::new()),
        })
    }

    /// Start a group expecting `count` results that expires after `ttl_secs`
    pub async fn create_group(&self, group_type: &str, count: u64, ttl_secs: u64) -> Result<String> {
        let id = self
            .groups
            .create(group_type, count, Duration::from_secs(ttl_secs))
            .await?;
        self.metrics.groups_created.inc();
        Ok(id)
    }

    /// Report one task result; a fresh task id is generated when none is given
    ///
    /// Returns true if the result was recorded, false if the task id had
    /// already been confirmed.
    pub async fn confirm_task(
        &self,
        group_id: &str,
        result: &str,
        task_id: Option<&str>,
    ) -> Result<bool> {
        let written = self.groups.confirm(group_id, task_id, result).await?;
        if written {
            self.metrics.tasks_confirmed.inc();
        } else {
            self.metrics.duplicate_confirmations.inc();
        }
        Ok(written)
    }

    /// Register a handler for completed groups of `group_type`
    pub fn on_complete<F>(&self, group_type: &str, handler: F) -> HandlerId
    where
        F: Fn(&[TaskResult]) -> HandlerResult + Send + Sync + 'static,
    {
        self.registry.register(group_type, handler)
    }

    /// A watcher over this tracker's groups and handlers
    pub fn watcher(&self) -> Watcher<S> {
        Watcher::new(
            self.groups.clone(),
            self.registry.clone(),
            self.metrics.clone(),
            self.config.poll_interval(),
            self.config.dispatch_mode,
        )
    }

    /// Run a single watcher pass in the caller's task
    pub async fn tick(&self) -> TickSummary {
        self.watcher().tick().await
    }

    /// Start the watcher loop in the background
    pub fn spawn_watcher(&self) -> WatcherHandle {
        info!("Spawning watcher for prefix {}", self.config.key_prefix);
        self.watcher().spawn()
    }

    /// Group store backing this tracker
    pub fn groups(&self) -> &GroupStore<S> {
        &self.groups
    }

    /// Handler registry
    pub fn registry(&self) -> &CallbackRegistry {
        &self.registry
    }

    /// Instance metrics
    pub fn metrics(&self) -> &WatcherMetrics {
        &self.metrics
    }

    /// Active configuration
    pub fn config(&self) -> &WatcherConfig {
        &self.config
    }
}

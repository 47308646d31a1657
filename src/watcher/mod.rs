//! Watcher loop
//!
//! Periodically scans every live group, reaps corrupt ones and dispatches
//! completed ones to the handlers registered for their type.
//!
//! The check-then-reap sequence is not atomic in the store. How a completed
//! group is claimed depends on [`DispatchMode`]:
//! - `ClaimThenDispatch` removes the group's `count` field first and only
//!   dispatches if that removal succeeded, then deletes the record. Two
//!   watchers never both fire for one group, even when a late confirmation
//!   recreates the key in between.
//! - `ReapAfterDispatch` fires first and deletes after; a failed delete or a
//!   second watcher reading the same record fires the handlers again.

pub mod shutdown;

pub use shutdown::{ShutdownListener, ShutdownSignal};

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::DispatchMode;
use crate::error::{Result, WatcherError};
use crate::group::{CompletedGroup, GroupState, GroupStore};
use crate::metrics::WatcherMetrics;
use crate::registry::CallbackRegistry;
use crate::storage::KvStore;

/// Counts from one pass over the live groups
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    /// Keys enumerated
    pub scanned: usize,
    /// Groups still waiting for results
    pub pending: usize,
    /// Groups dispatched and reaped
    pub completed: usize,
    /// Corrupt groups reaped
    pub corrupt: usize,
    /// Keys skipped after a store error; retried next tick
    pub errors: usize,
}

enum Outcome {
    Pending,
    Completed,
    Corrupt,
    Skipped,
}

/// Completion detection loop over one group store
pub struct Watcher<S> {
    groups: Arc<GroupStore<S>>,
    registry: Arc<CallbackRegistry>,
    metrics: Arc<WatcherMetrics>,
    poll_interval: Duration,
    mode: DispatchMode,
}

impl<S: KvStore> Watcher<S> {
    /// Create a watcher over shared tracker state
    pub fn new(
        groups: Arc<GroupStore<S>>,
        registry: Arc<CallbackRegistry>,
        metrics: Arc<WatcherMetrics>,
        poll_interval: Duration,
        mode: DispatchMode,
    ) -> Self {
        Self {
            groups,
            registry,
            metrics,
            poll_interval,
            mode,
        }
    }

    /// Run one scan over every live group
    ///
    /// Store errors never abort the pass: a key that cannot be read or
    /// deleted is left for the next tick.
    pub async fn tick(&self) -> TickSummary {
        let started = Instant::now();
        let mut summary = TickSummary::default();

        let keys = match self.groups.list_group_keys().await {
            Ok(keys) => keys,
            Err(e) => {
                warn!("Failed to list groups under {}: {}", self.groups.prefix(), e);
                self.metrics.store_errors.inc();
                summary.errors += 1;
                return summary;
            }
        };

        for key in &keys {
            summary.scanned += 1;
            let Some(group_id) = self.groups.group_id_from_key(key) else {
                continue;
            };

            match self.process(group_id).await {
                Ok(Outcome::Pending) => summary.pending += 1,
                Ok(Outcome::Completed) => summary.completed += 1,
                Ok(Outcome::Corrupt) => summary.corrupt += 1,
                Ok(Outcome::Skipped) => {}
                Err(e) => {
                    warn!("Group {} left for next tick: {}", group_id, e);
                    self.metrics.store_errors.inc();
                    summary.errors += 1;
                }
            }
        }

        self.metrics.pending_groups.set(summary.pending as i64);
        self.metrics.tick_duration.observe(started.elapsed());
        if summary.scanned > 0 {
            debug!("Tick finished: {:?}", summary);
        }
        summary
    }

    async fn process(&self, group_id: &str) -> Result<Outcome> {
        match self.groups.load(group_id).await? {
            GroupState::Missing => Ok(Outcome::Skipped),
            GroupState::Pending {
                confirmed,
                expected,
            } => {
                debug!("Group {} pending: {}/{}", group_id, confirmed, expected);
                Ok(Outcome::Pending)
            }
            GroupState::Corrupt { reason } => {
                warn!("Reaping corrupt group {}: {}", group_id, reason);
                self.groups.delete(group_id).await?;
                self.metrics.groups_corrupt.inc();
                Ok(Outcome::Corrupt)
            }
            GroupState::Complete(group) => match self.mode {
                DispatchMode::ClaimThenDispatch => {
                    if !self.groups.claim(group_id).await? {
                        debug!("Group {} already claimed", group_id);
                        return Ok(Outcome::Skipped);
                    }
                    // Without `count` a leftover record is reaped as corrupt later.
                    if let Err(e) = self.groups.delete(group_id).await {
                        warn!("Claimed group {} not deleted: {}", group_id, e);
                        self.metrics.store_errors.inc();
                    }
                    self.dispatch(&group);
                    Ok(Outcome::Completed)
                }
                DispatchMode::ReapAfterDispatch => {
                    self.dispatch(&group);
                    self.groups.delete(group_id).await?;
                    Ok(Outcome::Completed)
                }
            },
        }
    }

    fn dispatch(&self, group: &CompletedGroup) {
        let report = self.registry.dispatch(&group.group_type, &group.results);
        self.metrics.groups_completed.inc();
        self.metrics
            .handler_failures
            .inc_by(report.failed.len() as u64);

        if report.invoked == 0 {
            debug!(
                "Group {} of type {} completed with no handlers registered",
                group.group_id, group.group_type
            );
        } else {
            info!(
                "Dispatched group {} type={} results={} handlers={} failed={}",
                group.group_id,
                group.group_type,
                group.results.len(),
                report.invoked,
                report.failed.len()
            );
        }
    }

    /// Tick until `shutdown` fires, sleeping the poll interval between ticks
    ///
    /// A tick in progress always runs to the end before the loop exits.
    pub async fn run(self, mut shutdown: ShutdownListener) {
        info!(
            "Watcher started on {} (interval {:?}, mode {:?})",
            self.groups.prefix(),
            self.poll_interval,
            self.mode
        );

        while !shutdown.is_triggered() {
            self.tick().await;

            tokio::select! {
                _ = shutdown.wait() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        info!("Watcher on {} stopped", self.groups.prefix());
    }

    /// Run the loop as a background task
    pub fn spawn(self) -> WatcherHandle {
        let signal = ShutdownSignal::new();
        let task = tokio::spawn(self.run(signal.subscribe()));
        WatcherHandle { signal, task }
    }
}

/// Handle to a background watcher
pub struct WatcherHandle {
    signal: ShutdownSignal,
    task: JoinHandle<()>,
}

impl WatcherHandle {
    /// Signal that stops the watcher; clone it to stop from elsewhere
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.signal.clone()
    }

    /// Whether the loop has exited
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the loop and wait for the current tick to finish
    pub async fn stop(self) -> Result<()> {
        self.signal.shutdown();
        self.task.await.map_err(|e| WatcherError::Internal {
            message: format!("watcher task failed: {}", e),
        })
    }
}

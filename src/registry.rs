//! Completion handler registry
//!
//! Local to one tracker instance: an ordered list of `(type, handler)` pairs.
//! Handlers are never removed, and every handler whose type matches a
//! completed group fires, in registration order.

use parking_lot::RwLock;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::WatcherError;
use crate::group::TaskResult;

/// What a handler returns
pub type HandlerResult = std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// A completion handler
pub type Handler = Arc<dyn Fn(&[TaskResult]) -> HandlerResult + Send + Sync>;

/// Position of a handler in registration order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(pub usize);

/// Outcome of dispatching one completed group
#[derive(Debug, Default)]
pub struct DispatchReport {
    /// Handlers called
    pub invoked: usize,
    /// Handlers that returned an error or panicked
    pub failed: Vec<WatcherError>,
}

impl DispatchReport {
    /// True if no handler failed
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Ordered registry of completion handlers
#[derive(Default)]
pub struct CallbackRegistry {
    entries: RwLock<Vec<(String, Handler)>>,
}

impl CallbackRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler for `group_type`
    pub fn register<F>(&self, group_type: impl Into<String>, handler: F) -> HandlerId
    where
        F: Fn(&[TaskResult]) -> HandlerResult + Send + Sync + 'static,
    {
        let group_type = group_type.into();
        let mut entries = self.entries.write();
        let id = HandlerId(entries.len());
        debug!("Registered handler {} for type {}", id.0, group_type);
        entries.push((group_type, Arc::new(handler)));
        id
    }

    /// Number of handlers registered for `group_type`
    pub fn handler_count(&self, group_type: &str) -> usize {
        self.entries
            .read()
            .iter()
            .filter(|(t, _)| t == group_type)
            .count()
    }

    /// Total number of registered handlers
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// True if nothing is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Call every handler registered for `group_type` with `results`
    ///
    /// Failures are isolated: an error or panic in one handler is logged and
    /// reported, and the remaining handlers still run.
    pub fn dispatch(&self, group_type: &str, results: &[TaskResult]) -> DispatchReport {
        // Snapshot so handlers may register more handlers without deadlocking.
        let handlers: Vec<Handler> = self
            .entries
            .read()
            .iter()
            .filter(|(t, _)| t == group_type)
            .map(|(_, h)| h.clone())
            .collect();

        let mut report = DispatchReport::default();
        for handler in handlers {
            report.invoked += 1;
            let outcome = catch_unwind(AssertUnwindSafe(|| handler(results)));
            let reason = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(panic) => panic_message(panic.as_ref()),
            };
            warn!("Handler for type {} failed: {}", group_type, reason);
            report.failed.push(WatcherError::Handler {
                group_type: group_type.to_string(),
                reason,
            });
        }
        report
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}

//! Tracker metrics
//!
//! Per-instance counters, a pending-groups gauge and a tick-latency
//! histogram, rendered in the Prometheus text format.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

/// Monotonic counter
pub struct Counter {
    name: &'static str,
    help: &'static str,
    value: AtomicU64,
}

impl Counter {
    const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            value: AtomicU64::new(0),
        }
    }

    /// Increment by 1
    pub fn inc(&self) {
        self.inc_by(1);
    }

    /// Increment by delta
    pub fn inc_by(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    /// Current value
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    fn render(&self, out: &mut String) {
        let _ = writeln!(out, "# HELP {} {}", self.name, self.help);
        let _ = writeln!(out, "# TYPE {} counter", self.name);
        let _ = writeln!(out, "{} {}", self.name, self.get());
    }
}

/// Value that moves both ways
pub struct Gauge {
    name: &'static str,
    help: &'static str,
    value: AtomicI64,
}

impl Gauge {
    const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            value: AtomicI64::new(0),
        }
    }

    /// Set value
    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    /// Current value
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    fn render(&self, out: &mut String) {
        let _ = writeln!(out, "# HELP {} {}", self.name, self.help);
        let _ = writeln!(out, "# TYPE {} gauge", self.name);
        let _ = writeln!(out, "{} {}", self.name, self.get());
    }
}

const TICK_BUCKETS: [f64; 8] = [0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0];

/// Latency histogram with fixed buckets
pub struct Histogram {
    name: &'static str,
    help: &'static str,
    buckets: [AtomicU64; TICK_BUCKETS.len()],
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            buckets: Default::default(),
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Record one observation
    pub fn observe(&self, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        for (bound, bucket) in TICK_BUCKETS.iter().zip(&self.buckets) {
            if secs <= *bound {
                bucket.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Number of observations
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    fn render(&self, out: &mut String) {
        let _ = writeln!(out, "# HELP {} {}", self.name, self.help);
        let _ = writeln!(out, "# TYPE {} histogram", self.name);
        for (bound, bucket) in TICK_BUCKETS.iter().zip(&self.buckets) {
            let _ = writeln!(
                out,
                "{}_bucket{{le=\"{}\"}} {}",
                self.name,
                bound,
                bucket.load(Ordering::Relaxed)
            );
        }
        let _ = writeln!(out, "{}_bucket{{le=\"+Inf\"}} {}", self.name, self.count());
        let sum = self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0;
        let _ = writeln!(out, "{}_sum {}", self.name, sum);
        let _ = writeln!(out, "{}_count {}", self.name, self.count());
    }
}

/// Metrics for one tracker instance
pub struct WatcherMetrics {
    pub groups_created: Counter,
    pub tasks_confirmed: Counter,
    pub duplicate_confirmations: Counter,
    pub groups_completed: Counter,
    pub groups_corrupt: Counter,
    pub handler_failures: Counter,
    pub store_errors: Counter,
    pub pending_groups: Gauge,
    pub tick_duration: Histogram,
}

impl WatcherMetrics {
    /// Fresh zeroed metrics
    pub fn new() -> Self {
        Self {
            groups_created: Counter::new(
                "parallel_watcher_groups_created_total",
                "Groups created by this instance",
            ),
            tasks_confirmed: Counter::new(
                "parallel_watcher_tasks_confirmed_total",
                "Task results recorded by this instance",
            ),
            duplicate_confirmations: Counter::new(
                "parallel_watcher_duplicate_confirmations_total",
                "Confirmations ignored because the task id was already recorded",
            ),
            groups_completed: Counter::new(
                "parallel_watcher_groups_completed_total",
                "Completed groups dispatched to handlers",
            ),
            groups_corrupt: Counter::new(
                "parallel_watcher_groups_corrupt_total",
                "Corrupt groups reaped without dispatch",
            ),
            handler_failures: Counter::new(
                "parallel_watcher_handler_failures_total",
                "Handler invocations that returned an error or panicked",
            ),
            store_errors: Counter::new(
                "parallel_watcher_store_errors_total",
                "Store operations that failed during a tick",
            ),
            pending_groups: Gauge::new(
                "parallel_watcher_pending_groups",
                "Groups still waiting for results at the last tick",
            ),
            tick_duration: Histogram::new(
                "parallel_watcher_tick_duration_seconds",
                "Time spent scanning and dispatching per tick",
            ),
        }
    }

    /// Render every metric in Prometheus text format
    pub fn export(&self) -> String {
        let mut out = String::new();
        for counter in [
            &self.groups_created,
            &self.tasks_confirmed,
            &self.duplicate_confirmations,
            &self.groups_completed,
            &self.groups_corrupt,
            &self.handler_failures,
            &self.store_errors,
        ] {
            counter.render(&mut out);
        }
        self.pending_groups.render(&mut out);
        self.tick_duration.render(&mut out);
        out
    }
}

impl Default for WatcherMetrics {
    fn default() -> Self {
        Self::new()
    }
}

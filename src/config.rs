//! Tracker configuration
//!
//! Loaded from the environment or a JSON file and validated before any
//! connection to the shared store is attempted.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, WatcherError};
use crate::{DEFAULT_KEY_PREFIX, DEFAULT_POLL_INTERVAL_MS};

/// Order of the reap and dispatch steps for a completed group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DispatchMode {
    /// Claim the group by removing its `count` field and dispatch only if
    /// this watcher removed it. Concurrent watchers never both dispatch the
    /// same group; a crash between claim and dispatch loses the group.
    #[default]
    ClaimThenDispatch,
    /// Dispatch, then delete. A delete that fails (or a second watcher that
    /// read the same record) fires the handlers again.
    ReapAfterDispatch,
}

impl FromStr for DispatchMode {
    type Err = WatcherError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "claim" | "claim-then-dispatch" => Ok(DispatchMode::ClaimThenDispatch),
            "reap-after" | "reap-after-dispatch" => Ok(DispatchMode::ReapAfterDispatch),
            other => Err(WatcherError::Config {
                reason: format!("unknown dispatch mode {:?}", other),
            }),
        }
    }
}

/// Configuration for a tracker instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    /// Connection string for the shared store
    pub store_url: String,
    /// Namespace prepended to every group key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Delay between watcher ticks
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Reap/dispatch ordering for completed groups
    #[serde(default)]
    pub dispatch_mode: DispatchMode,
    /// Upper bound on a single store round-trip
    #[serde(default = "default_io_timeout_ms")]
    pub io_timeout_ms: u64,
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_io_timeout_ms() -> u64 {
    5_000
}

impl WatcherConfig {
    /// Configuration with defaults for everything but the store url
    pub fn new(store_url: impl Into<String>) -> Self {
        Self {
            store_url: store_url.into(),
            key_prefix: default_key_prefix(),
            poll_interval_ms: default_poll_interval_ms(),
            dispatch_mode: DispatchMode::default(),
            io_timeout_ms: default_io_timeout_ms(),
        }
    }

    /// Set the key namespace
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Set the poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set the dispatch mode
    pub fn with_dispatch_mode(mut self, mode: DispatchMode) -> Self {
        self.dispatch_mode = mode;
        self
    }

    /// Load from `WATCHER_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let store_url = lookup("WATCHER_STORE_URL").ok_or_else(|| WatcherError::Config {
            reason: "WATCHER_STORE_URL is not set".into(),
        })?;

        let mut config = Self::new(store_url);

        if let Some(prefix) = lookup("WATCHER_KEY_PREFIX") {
            config.key_prefix = prefix;
        }
        if let Some(ms) = lookup("WATCHER_POLL_INTERVAL_MS") {
            config.poll_interval_ms = parse_millis("WATCHER_POLL_INTERVAL_MS", &ms)?;
        }
        if let Some(mode) = lookup("WATCHER_DISPATCH_MODE") {
            config.dispatch_mode = mode.parse()?;
        }
        if let Some(ms) = lookup("WATCHER_IO_TIMEOUT_MS") {
            config.io_timeout_ms = parse_millis("WATCHER_IO_TIMEOUT_MS", &ms)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| WatcherError::Config {
            reason: format!("cannot read {}: {}", path.display(), e),
        })?;
        let config: Self = serde_json::from_str(&contents).map_err(|e| WatcherError::Config {
            reason: format!("cannot parse {}: {}", path.display(), e),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot work
    pub fn validate(&self) -> Result<()> {
        if self.store_url.trim().is_empty() {
            return Err(WatcherError::Config {
                reason: "store_url must not be empty".into(),
            });
        }
        if self.key_prefix.is_empty() {
            return Err(WatcherError::Config {
                reason: "key_prefix must not be empty".into(),
            });
        }
        // The prefix is used verbatim in scan patterns and as the key separator.
        if let Some(c) = self
            .key_prefix
            .chars()
            .find(|c| matches!(c, ':' | '*' | '?' | '[' | ']' | '\\'))
        {
            return Err(WatcherError::Config {
                reason: format!("key_prefix must not contain {:?}", c),
            });
        }
        if self.poll_interval_ms == 0 {
            return Err(WatcherError::Config {
                reason: "poll_interval_ms must be positive".into(),
            });
        }
        if self.io_timeout_ms == 0 {
            return Err(WatcherError::Config {
                reason: "io_timeout_ms must be positive".into(),
            });
        }
        Ok(())
    }

    /// Delay between watcher ticks
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Upper bound on a single store round-trip
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

fn parse_millis(name: &str, value: &str) -> Result<u64> {
    value.trim().parse().map_err(|_| WatcherError::Config {
        reason: format!("{} must be an integer, got {:?}", name, value),
    })
}

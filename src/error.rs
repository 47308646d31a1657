//! Error types for the completion tracker
//!
//! Covers configuration, store, group and handler failures.

use thiserror::Error;

/// Primary error type for all tracker operations
#[derive(Debug, Error)]
pub enum WatcherError {
    // ========== Configuration Errors ==========

    /// Configuration rejected at setup
    #[error("Invalid configuration: {reason}")]
    Config { reason: String },

    /// Store connection string could not be parsed
    #[error("Invalid store url {url}: {reason}")]
    InvalidStoreUrl { url: String, reason: String },

    // ========== Store Errors ==========

    /// Connection to the shared store failed
    #[error("Connection to {endpoint} failed: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },

    /// Store operation failed (I/O, timeout, server error)
    #[error("Store operation failed: {message}")]
    Store { message: String },

    /// Store replied with something we did not expect
    #[error("Unexpected store reply: {reason}")]
    Protocol { reason: String },

    // ========== Group Errors ==========

    /// Group parameters rejected at creation
    #[error("Invalid group: {reason}")]
    InvalidGroup { reason: String },

    /// Task id collides with a reserved group field
    #[error("Task id {task_id:?} is reserved")]
    ReservedTaskId { task_id: String },

    // ========== Dispatch Errors ==========

    /// A completion handler returned an error or panicked
    #[error("Handler for type {group_type} failed: {reason}")]
    Handler { group_type: String, reason: String },

    // ========== Runtime Errors ==========

    /// Internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl WatcherError {
    /// Returns true if the failed operation may succeed on a later attempt
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WatcherError::Store { .. }
                | WatcherError::ConnectionFailed { .. }
                | WatcherError::Protocol { .. }
        )
    }

    /// Returns true if this error must prevent startup
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            WatcherError::Config { .. } | WatcherError::InvalidStoreUrl { .. }
        )
    }
}

impl From<std::io::Error> for WatcherError {
    fn from(e: std::io::Error) -> Self {
        WatcherError::Store {
            message: e.to_string(),
        }
    }
}

/// Result type alias for tracker operations
pub type Result<T> = std::result::Result<T, WatcherError>;

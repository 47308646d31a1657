//! Watcher shutdown handling
//!
//! A latched flag: once triggered it stays triggered, so a listener that
//! subscribes late (or checks between ticks) still sees it.

use std::sync::Arc;
use tokio::sync::watch;

/// Shutdown trigger shared by the owner of a watcher
#[derive(Clone)]
pub struct ShutdownSignal {
    sender: Arc<watch::Sender<bool>>,
}

impl ShutdownSignal {
    /// Create an untriggered signal
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Trigger shutdown
    pub fn shutdown(&self) {
        self.sender.send_replace(true);
    }

    /// Whether shutdown has been triggered
    pub fn is_triggered(&self) -> bool {
        *self.sender.borrow()
    }

    /// Create a listener for this signal
    pub fn subscribe(&self) -> ShutdownListener {
        ShutdownListener {
            receiver: self.sender.subscribe(),
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side held by the watcher loop
pub struct ShutdownListener {
    receiver: watch::Receiver<bool>,
}

impl ShutdownListener {
    /// Whether shutdown has been triggered
    pub fn is_triggered(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolve once shutdown is triggered or every signal is dropped
    pub async fn wait(&mut self) {
        while !*self.receiver.borrow_and_update() {
            if self.receiver.changed().await.is_err() {
                return;
            }
        }
    }
}

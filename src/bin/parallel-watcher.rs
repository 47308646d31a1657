//! Watcher service binary
//!
//! Runs the completion watcher against the configured store and logs every
//! completed group of the types listed in `WATCHER_TYPES`.

use parallel_watcher::{TaskResult, Tracker, WatcherConfig};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting parallel watcher");

    let config = match WatcherConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return Err(e.into());
        }
    };

    let tracker = match Tracker::connect(config).await {
        Ok(tracker) => tracker,
        Err(e) => {
            error!("Failed to connect to store: {}", e);
            return Err(e.into());
        }
    };

    let types = std::env::var("WATCHER_TYPES").unwrap_or_default();
    for group_type in types.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        tracker.on_complete(group_type, |results: &[TaskResult]| {
            info!("Group complete: {}", serde_json::to_string(results)?);
            Ok(())
        });
        info!("Logging completions of type {}", group_type);
    }

    let handle = tracker.spawn_watcher();

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    handle.stop().await?;
    info!("Final metrics:\n{}", tracker.metrics().export());

    Ok(())
}

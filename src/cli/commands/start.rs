// Start command implementation
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::config::NexqConfig;
use crate::core::time::SystemClock;
use crate::server::shutdown::{forward_os_signals, ShutdownSignal};
use crate::storage;

/// Execute the start command - runs the configured store until a shutdown signal
pub async fn execute(config: NexqConfig) -> Result<()> {
    info!(
        backend = config.store.backend_name(),
        poll_interval_ms = config.store.poll_interval().as_millis() as u64,
        "Starting nexq"
    );

    let store = storage::connect(&config.store, Arc::new(SystemClock))
        .await
        .context("Failed to initialize store")?;

    let shutdown_signal = ShutdownSignal::new();
    let signals = forward_os_signals(shutdown_signal.clone());

    let result = crate::server::run(store, shutdown_signal).await;
    signals.abort();
    result.context("Store failed")
}

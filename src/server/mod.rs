//! Long-running engine process around a [`Store`].

/// Graceful shutdown handling
pub mod shutdown;

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::storage::Store;
use crate::Result;
use shutdown::ShutdownSignal;

/// How long [`run`] waits for the store to shut down.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Start `store`, wait for `shutdown_signal`, then shut the store down.
pub async fn run(store: Arc<dyn Store>, shutdown_signal: ShutdownSignal) -> Result<()> {
    let mut rx = shutdown_signal.subscribe();
    store.start().await?;
    info!("nexq is running");

    let _ = rx.recv().await;
    info!("Shutting down store");

    match tokio::time::timeout(SHUTDOWN_TIMEOUT, store.shutdown()).await {
        Ok(Ok(())) => info!("Shutdown complete"),
        Ok(Err(e)) => {
            error!(error = %e, "Store shutdown failed");
            return Err(e);
        }
        Err(_) => warn!(
            timeout_ms = SHUTDOWN_TIMEOUT.as_millis() as u64,
            "Store shutdown timed out"
        ),
    }
    Ok(())
}

//! Background sweep task owned by a store.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::core::time::Clock;
use crate::Result;

/// Smallest allowed sweep interval.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Clamp a configured sweep interval to [`MIN_POLL_INTERVAL`].
pub fn clamp_poll_interval(interval: Duration) -> Duration {
    if interval < MIN_POLL_INTERVAL {
        warn!(
            requested_ms = interval.as_millis() as u64,
            minimum_ms = MIN_POLL_INTERVAL.as_millis() as u64,
            "Poll interval too small, clamping"
        );
        MIN_POLL_INTERVAL
    } else {
        interval
    }
}

/// Handle to a periodic sweep task. The task is aborted on [`Poller::stop`] or drop.
#[derive(Debug)]
pub struct Poller {
    name: String,
    handle: JoinHandle<()>,
}

impl Poller {
    /// Spawn a task that sleeps `interval` on `clock` and then runs `tick`, forever.
    ///
    /// Tick errors are logged and the loop carries on.
    pub fn start<F, Fut>(name: &str, clock: Arc<dyn Clock>, interval: Duration, tick: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        info!(
            poller = %name,
            interval_ms = interval.as_millis() as u64,
            "Starting poller"
        );

        let task_name = name.to_string();
        let handle = tokio::spawn(async move {
            loop {
                clock.sleep(interval).await;
                match tick().await {
                    Ok(()) => debug!(poller = %task_name, "Poll completed"),
                    Err(e) => error!(poller = %task_name, error = %e, "Poll failed"),
                }
            }
        });

        Self {
            name: name.to_string(),
            handle,
        }
    }

    /// Cancel the task.
    pub fn stop(&self) {
        if !self.handle.is_finished() {
            info!(poller = %self.name, "Stopping poller");
            self.handle.abort();
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

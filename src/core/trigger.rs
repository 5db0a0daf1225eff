//! Wait/notify coordination for long-polling receivers.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::trace;

use crate::core::time::{add_duration, Clock};
use crate::Result;

/// How a wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Woken by a trigger on the queue.
    Triggered,
    /// The timeout elapsed first.
    TimedOut,
}

/// Per-store registry of one-shot waiters keyed by queue name.
#[derive(Debug, Default)]
pub struct TriggerRegistry {
    waiters: Mutex<HashMap<String, Vec<oneshot::Sender<()>>>>,
}

impl TriggerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `queue_name`.
    pub fn register(&self, queue_name: &str) -> Waiter {
        let (tx, rx) = oneshot::channel();
        let mut waiters = self.waiters.lock().unwrap_or_else(|e| e.into_inner());
        let entry = waiters.entry(queue_name.to_string()).or_default();
        entry.retain(|tx| !tx.is_closed());
        entry.push(tx);
        Waiter { rx }
    }

    /// Wake every waiter of `queue_name`.
    pub fn trigger(&self, queue_name: &str) {
        let senders = {
            let mut waiters = self.waiters.lock().unwrap_or_else(|e| e.into_inner());
            waiters.remove(queue_name).unwrap_or_default()
        };
        if !senders.is_empty() {
            trace!(queue_name = %queue_name, waiters = senders.len(), "Triggering waiters");
        }
        for tx in senders {
            let _ = tx.send(());
        }
    }

    /// Wake every waiter of every queue.
    pub fn trigger_all(&self) {
        let all = {
            let mut waiters = self.waiters.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *waiters)
        };
        for tx in all.into_values().flatten() {
            let _ = tx.send(());
        }
    }

    /// Number of live waiters on `queue_name`.
    pub fn waiting(&self, queue_name: &str) -> usize {
        let waiters = self.waiters.lock().unwrap_or_else(|e| e.into_inner());
        waiters
            .get(queue_name)
            .map(|senders| senders.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }
}

/// A registered waiter. Dropping it abandons the wait.
#[derive(Debug)]
pub struct Waiter {
    rx: oneshot::Receiver<()>,
}

impl Waiter {
    /// Wait until triggered or until `timeout` elapses on `clock`.
    pub async fn wait(self, clock: &dyn Clock, timeout: Duration) -> WaitOutcome {
        let rx = self.rx;
        tokio::select! {
            Ok(()) = rx => WaitOutcome::Triggered,
            _ = clock.sleep(timeout) => WaitOutcome::TimedOut,
        }
    }
}

/// Run `attempt` until it claims something or `wait` elapses.
///
/// A waiter is registered before every attempt so a wake that lands between
/// the check and the wait is not lost.
pub async fn long_poll<T, F, Fut>(
    clock: &dyn Clock,
    triggers: &TriggerRegistry,
    queue_name: &str,
    wait: Duration,
    mut attempt: F,
) -> Result<Vec<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Vec<T>>>,
{
    let end = add_duration(clock.now(), wait);
    loop {
        let waiter = triggers.register(queue_name);
        let claimed = attempt().await?;
        if !claimed.is_empty() {
            return Ok(claimed);
        }

        let now = clock.now();
        if now >= end {
            return Ok(claimed);
        }
        let remaining = (end - now).to_std().unwrap_or_default();
        waiter.wait(clock, remaining).await;
    }
}

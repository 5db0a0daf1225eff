//! PostgreSQL change notification listener.
//!
//! Triggers on the nexq tables publish JSON events. Message events wake the
//! queue's local waiters so receivers in this process see writes made by other
//! processes without waiting for their timeout. Queue events also invalidate
//! the cached queue options.

use std::sync::Arc;

use serde::Deserialize;
use sqlx::postgres::PgListener;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::cache::QueueCache;
use crate::core::backoff::ExponentialBackoff;
use crate::core::trigger::TriggerRegistry;

/// Channels the listener subscribes to.
pub const CHANNELS: [&str; 4] = [
    "nexq_message",
    "nexq_queue",
    "nexq_topic",
    "nexq_subscription",
];

/// Notification payload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    /// Table kind: `message`, `queue`, `topic` or `subscription`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Lower-cased trigger operation.
    pub op: String,
    /// Row id (queue and topic names for those tables).
    pub id: String,
    /// Affected queue, when the row belongs to one.
    #[serde(default)]
    pub queue_name: Option<String>,
}

/// Applies change events to local state.
#[derive(Debug, Clone)]
pub struct ChangeHandler {
    cache: Arc<QueueCache>,
    triggers: Arc<TriggerRegistry>,
}

impl ChangeHandler {
    /// Create a handler over a store's cache and waiters.
    pub fn new(cache: Arc<QueueCache>, triggers: Arc<TriggerRegistry>) -> Self {
        Self { cache, triggers }
    }

    /// Apply a raw notification payload.
    pub fn handle_payload(&self, payload: &str) {
        match serde_json::from_str::<ChangeEvent>(payload) {
            Ok(event) => self.handle(&event),
            Err(e) => warn!(error = %e, payload = %payload, "Ignoring malformed notification"),
        }
    }

    /// Apply one event.
    pub fn handle(&self, event: &ChangeEvent) {
        debug!(kind = %event.kind, op = %event.op, id = %event.id, "Received change notification");
        match (event.kind.as_str(), event.queue_name.as_deref()) {
            ("message", Some(queue_name)) => self.triggers.trigger(queue_name),
            ("queue", Some(queue_name)) => {
                self.cache.invalidate(queue_name);
                self.triggers.trigger(queue_name);
            }
            _ => {}
        }
    }

    /// Forget everything that may have been missed while disconnected.
    pub fn resync(&self) {
        self.cache.clear();
        self.triggers.trigger_all();
    }
}

/// Spawn the listener task. It runs until aborted, reconnecting with
/// exponential backoff whenever the connection drops.
pub fn spawn(database_url: String, handler: ChangeHandler) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut backoff = ExponentialBackoff::new();
        loop {
            match connect(&database_url).await {
                Ok(mut listener) => {
                    info!(channels = ?CHANNELS, "Listening for change notifications");
                    backoff.reset();
                    handler.resync();
                    loop {
                        match listener.try_recv().await {
                            Ok(Some(notification)) => handler.handle_payload(notification.payload()),
                            Ok(None) => {
                                warn!("Notification connection lost");
                                break;
                            }
                            Err(e) => {
                                error!(error = %e, "Notification listener failed");
                                break;
                            }
                        }
                    }
                    handler.resync();
                }
                Err(e) => error!(error = %e, "Failed to connect notification listener"),
            }

            let delay = backoff.next_delay();
            warn!(
                attempt = backoff.attempt(),
                delay_ms = delay.as_millis() as u64,
                "Reconnecting notification listener"
            );
            tokio::time::sleep(delay).await;
        }
    })
}

async fn connect(database_url: &str) -> Result<PgListener, sqlx::Error> {
    let mut listener = PgListener::connect(database_url).await?;
    listener.listen_all(CHANNELS).await?;
    Ok(listener)
}
